//! Delegation monitor: the stall detector loop.
//!
//! Each cycle walks the active delegations once: new session output moves
//! a delegation into `monitoring` and resets its stall timer, a final
//! summary or session exit finalizes it, and silence past the owning
//! orchestrator's threshold opens a stall episode.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{AuditRecord, NewInsight};
use crate::delegation::{DelegationEngine, Outcome, ORCHESTRATOR_ACTOR};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::types::{
    Delegation, DelegationStatus, FailureKind, InsightKind, Orchestrator, OrchestratorStatus,
    Severity,
};

#[derive(Clone, Debug)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    /// Re-prompts per delegation before a stall becomes fatal.
    pub max_reprompts: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_reprompts: 1,
        }
    }
}

/// Outcome an agent reported in its own output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalSummary {
    pub success: bool,
    pub summary: Option<String>,
}

/// Last JSON line that reports an outcome, if any.
///
/// Recognizes `{"type":"result","is_error":..,"result":..}` and
/// `{"status":"completed"|"failed","summary":..}`.
pub fn parse_final_summary(lines: &[String]) -> Option<FinalSummary> {
    lines.iter().rev().find_map(|line| {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        let value: Value = serde_json::from_str(line).ok()?;
        if value.get("type").and_then(Value::as_str) == Some("result") {
            return Some(FinalSummary {
                success: !value
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                summary: value
                    .get("result")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
        let success = match value.get("status").and_then(Value::as_str)? {
            "completed" | "success" => true,
            "failed" | "error" => false,
            _ => return None,
        };
        Some(FinalSummary {
            success,
            summary: value
                .get("summary")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    })
}

fn reprompt_text(idle: Duration) -> String {
    format!(
        "No output for {}s. Continue the task, and report your status when done.",
        idle.as_secs()
    )
}

pub struct DelegationMonitor {
    engine: Arc<DelegationEngine>,
    settings: MonitorSettings,
}

impl DelegationMonitor {
    pub fn new(engine: Arc<DelegationEngine>, settings: MonitorSettings) -> Self {
        Self { engine, settings }
    }

    pub async fn poll_once(&self) {
        self.poll_at(Utc::now()).await;
    }

    /// One cycle against an explicit clock.
    pub async fn poll_at(&self, now: DateTime<Utc>) {
        let active = match self.engine.store().list_active_delegations().await {
            Ok(active) => active,
            Err(err) => {
                warn!("Failed to list active delegations: {}", err);
                return;
            }
        };
        for delegation in active {
            if !matches!(
                delegation.status,
                DelegationStatus::Running | DelegationStatus::Monitoring
            ) {
                continue;
            }
            if let Err(err) = self.advance_one(&delegation.task_id, &delegation.id, now).await {
                warn!(
                    delegation_id = %delegation.id,
                    task_id = %delegation.task_id,
                    "Delegation poll failed: {}",
                    err
                );
            }
        }
    }

    async fn advance_one(
        &self,
        task_id: &str,
        delegation_id: &str,
        now: DateTime<Utc>,
    ) -> OrchestrationResult<()> {
        let _guard = self.engine.lock_task(task_id).await?;

        let Some(mut delegation) = self.engine.store().get_delegation(delegation_id).await? else {
            return Ok(());
        };
        if !matches!(
            delegation.status,
            DelegationStatus::Running | DelegationStatus::Monitoring
        ) {
            return Ok(());
        }

        // Exits are published after stdout drained, so one read gives the
        // final lines together with the exit that follows them.
        let broker = self.engine.broker().clone();
        let after = delegation
            .output_baseline
            .saturating_add(delegation.lines_seen);
        let output = match broker.output_since(&delegation.session_id, after).await {
            Ok(output) => output,
            Err(err) => {
                let failure = Outcome::Failed {
                    kind: FailureKind::CrashDuringRun,
                    message: format!("session lost: {}", err),
                };
                self.engine.finish_locked(delegation, failure, now).await?;
                return Ok(());
            }
        };
        let activity = output.activity;
        let lines = output.lines;

        let total = activity
            .lines_captured
            .saturating_sub(delegation.output_baseline);
        if total > delegation.lines_seen {
            let seen_at = activity.last_output_at.unwrap_or(now);
            delegation.lines_seen = total;
            delegation.last_activity_at = Some(seen_at);
            if delegation.first_output_at.is_none() {
                delegation.first_output_at = Some(seen_at);
            }
            self.engine.save(&delegation).await?;
            self.engine.begin_monitoring(&mut delegation, now).await?;

            if let Some(insight_id) = delegation.stall_insight_id.take() {
                self.engine.save(&delegation).await?;
                self.engine
                    .audit()
                    .resolve_insight(&insight_id, ORCHESTRATOR_ACTOR)
                    .await?;
                info!(delegation_id = %delegation.id, "Agent output resumed, stall resolved");
            }
        }

        if let Some(summary) = parse_final_summary(&lines) {
            let outcome = if summary.success {
                Outcome::Completed {
                    summary: summary.summary,
                }
            } else {
                Outcome::Failed {
                    kind: FailureKind::DelegationFailure,
                    message: summary
                        .summary
                        .unwrap_or_else(|| "agent reported failure".to_string()),
                }
            };
            self.engine.finish_locked(delegation, outcome, now).await?;
            return Ok(());
        }

        if activity.exited {
            let outcome = match activity.exit_code {
                Some(0) => Outcome::Completed {
                    summary: lines
                        .iter()
                        .rev()
                        .find(|l| !l.trim().is_empty())
                        .map(|l| l.trim().to_string()),
                },
                Some(code) => Outcome::Failed {
                    kind: FailureKind::CrashDuringRun,
                    message: format!("agent exited with code {}", code),
                },
                None => Outcome::Failed {
                    kind: FailureKind::CrashDuringRun,
                    message: "agent terminated by signal".to_string(),
                },
            };
            self.engine.finish_locked(delegation, outcome, now).await?;
            return Ok(());
        }

        let orchestrator = self.orchestrator_for(task_id).await?;
        self.check_stall(delegation, &orchestrator, now).await
    }

    async fn orchestrator_for(&self, task_id: &str) -> OrchestrationResult<Orchestrator> {
        let task = self.engine.queue().get(task_id).await?;
        self.engine
            .store()
            .get_orchestrator(&task.orchestrator_id)
            .await?
            .ok_or_else(|| OrchestrationError::not_found("orchestrator", &task.orchestrator_id))
    }

    async fn check_stall(
        &self,
        mut delegation: Delegation,
        orchestrator: &Orchestrator,
        now: DateTime<Utc>,
    ) -> OrchestrationResult<()> {
        let since = delegation.last_activity_at.unwrap_or(delegation.created_at);
        let idle = (now - since).to_std().unwrap_or_default();
        let threshold = Duration::from_secs(orchestrator.stall_threshold_sec);
        if idle < threshold {
            return Ok(());
        }

        let intervene =
            orchestrator.auto_intervention && orchestrator.status != OrchestratorStatus::Paused;

        if delegation.stall_insight_id.is_none() {
            let insight = self
                .engine
                .audit()
                .record_insight(
                    NewInsight {
                        orchestrator_id: orchestrator.id.clone(),
                        task_id: Some(delegation.task_id.clone()),
                        session_id: Some(delegation.session_id.clone()),
                        delegation_id: Some(delegation.id.clone()),
                        kind: InsightKind::StallDetected,
                        severity: Severity::Warning,
                        title: "Agent stalled".to_string(),
                        detail: format!("no output for {}s", idle.as_secs()),
                    },
                    now,
                )
                .await?;
            delegation.stall_insight_id = Some(insight.id);
            delegation.log(now, format!("stall detected after {}s", idle.as_secs()));
            self.engine.save(&delegation).await?;
            self.engine
                .audit()
                .record_at(
                    AuditRecord::new("delegation.stall_detected", ORCHESTRATOR_ACTOR)
                        .orchestrator(&orchestrator.id)
                        .task(&delegation.task_id)
                        .delegation(&delegation.id)
                        .session(&delegation.session_id)
                        .detail(json!({ "idle_sec": idle.as_secs() })),
                    now,
                )
                .await?;
            warn!(
                delegation_id = %delegation.id,
                idle_sec = idle.as_secs(),
                "Stall detected"
            );
        } else if !intervene {
            // Already surfaced; waiting for manual handling.
            return Ok(());
        }

        if !intervene {
            return Ok(());
        }

        if delegation.reprompt_count < self.settings.max_reprompts {
            self.reprompt(delegation, orchestrator, idle, now).await
        } else {
            let failure = Outcome::Failed {
                kind: FailureKind::StallTimeout,
                message: format!(
                    "no output for {}s after {} re-prompt(s)",
                    idle.as_secs(),
                    delegation.reprompt_count
                ),
            };
            self.record_intervention(&delegation, orchestrator, "cancel", now)
                .await?;
            self.engine.finish_locked(delegation, failure, now).await?;
            Ok(())
        }
    }

    async fn reprompt(
        &self,
        mut delegation: Delegation,
        orchestrator: &Orchestrator,
        idle: Duration,
        now: DateTime<Utc>,
    ) -> OrchestrationResult<()> {
        let written = self
            .engine
            .broker()
            .write_input(
                &delegation.session_id,
                &reprompt_text(idle),
                self.engine.settings().inject_timeout,
            )
            .await;
        if let Err(err) = written {
            let failure = Outcome::Failed {
                kind: FailureKind::DelegationFailure,
                message: format!("re-prompt failed: {}", err),
            };
            self.engine.finish_locked(delegation, failure, now).await?;
            return Ok(());
        }

        delegation.reprompt_count += 1;
        delegation.last_activity_at = Some(now);
        delegation.log(now, format!("re-prompted agent ({})", delegation.reprompt_count));
        self.engine.save(&delegation).await?;
        self.record_intervention(&delegation, orchestrator, "reprompt", now)
            .await?;
        debug!(delegation_id = %delegation.id, "Agent re-prompted");
        Ok(())
    }

    async fn record_intervention(
        &self,
        delegation: &Delegation,
        orchestrator: &Orchestrator,
        action: &str,
        now: DateTime<Utc>,
    ) -> OrchestrationResult<()> {
        self.engine
            .audit()
            .record_at(
                AuditRecord::new("delegation.auto_intervention", ORCHESTRATOR_ACTOR)
                    .orchestrator(&orchestrator.id)
                    .task(&delegation.task_id)
                    .delegation(&delegation.id)
                    .session(&delegation.session_id)
                    .detail(json!({
                        "action": action,
                        "reprompt_count": delegation.reprompt_count,
                    })),
                now,
            )
            .await?;
        self.engine
            .audit()
            .record_insight(
                NewInsight {
                    orchestrator_id: orchestrator.id.clone(),
                    task_id: Some(delegation.task_id.clone()),
                    session_id: Some(delegation.session_id.clone()),
                    delegation_id: Some(delegation.id.clone()),
                    kind: InsightKind::AutoIntervention,
                    severity: Severity::Info,
                    title: format!("Automatic {}", action),
                    detail: format!("stalled delegation {}", delegation.id),
                },
                now,
            )
            .await?;
        Ok(())
    }

    /// Run the stall detector until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                interval_ms = self.settings.poll_interval.as_millis() as u64,
                max_reprompts = self.settings.max_reprompts,
                "Delegation monitor started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.poll_once().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Delegation monitor stopped");
        })
    }
}
