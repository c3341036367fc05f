//! Delegation engine: hands a queued task to an agent session.
//!
//! All task and delegation mutations happen under a per-task async lock;
//! the store's compare-and-set catches writers that bypass it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditLog, AuditRecord, NewInsight};
use crate::collaborators::KnowledgeSource;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::queue::TaskQueue;
use crate::session::{SessionBroker, SessionRequest};
use crate::store::RecordStore;
use crate::types::{
    AgentProviderKind, Delegation, DelegationStatus, ErrorInfo, FailureKind, InsightKind,
    Severity, Task, TaskStatus,
};

pub const ORCHESTRATOR_ACTOR: &str = "orchestrator";

#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub default_provider: AgentProviderKind,
    /// Bound on writing context or re-prompts into a session.
    pub inject_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_provider: AgentProviderKind::Claude,
            inject_timeout: Duration::from_secs(5),
        }
    }
}

/// How a delegation ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed { summary: Option<String> },
    Failed { kind: FailureKind, message: String },
}

pub struct DelegationEngine {
    store: Arc<dyn RecordStore>,
    queue: TaskQueue,
    audit: AuditLog,
    broker: Arc<dyn SessionBroker>,
    knowledge: Arc<dyn KnowledgeSource>,
    settings: EngineSettings,
    task_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DelegationEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        audit: AuditLog,
        broker: Arc<dyn SessionBroker>,
        knowledge: Arc<dyn KnowledgeSource>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            queue: TaskQueue::new(store.clone(), audit.clone()),
            store,
            audit,
            broker,
            knowledge,
            settings,
            task_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<dyn SessionBroker> {
        &self.broker
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Serialize work on one task.
    pub async fn lock_task(&self, task_id: &str) -> OrchestrationResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self
                .task_locks
                .lock()
                .map_err(|_| OrchestrationError::Store("task lock table poisoned".to_string()))?;
            locks.retain(|id, lock| id == task_id || Arc::strong_count(lock) > 1);
            locks
                .entry(task_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        Ok(lock.lock_owned().await)
    }

    /// Delegate a queued task. Session and injection failures are recorded
    /// on the returned delegation rather than returned as errors.
    pub async fn delegate(
        &self,
        task_id: &str,
        provider: Option<AgentProviderKind>,
    ) -> OrchestrationResult<Delegation> {
        let _guard = self.lock_task(task_id).await?;

        let task = self.queue.get(task_id).await?;
        if let Some(active) = self.store.active_delegation(task_id).await? {
            return Err(OrchestrationError::ActiveDelegationExists {
                task_id: task_id.to_string(),
                delegation_id: active.id,
            });
        }
        if task.status != TaskStatus::Queued {
            return Err(OrchestrationError::transition(
                "task",
                task_id,
                task.status,
                "delegated",
            ));
        }

        let provider = provider.unwrap_or(self.settings.default_provider);
        let now = Utc::now();
        let mut delegation = Delegation {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            session_id: String::new(),
            status: DelegationStatus::Spawning,
            agent_provider: provider,
            injected_context: String::new(),
            execution_log: Vec::new(),
            result: None,
            error: None,
            transcript_ref: None,
            created_at: now,
            completed_at: None,
            first_output_at: None,
            last_activity_at: None,
            stall_insight_id: None,
            reprompt_count: 0,
            output_baseline: 0,
            lines_seen: 0,
        };
        delegation.log(now, format!("delegation created for {}", provider));
        self.store.insert_delegation(delegation.clone()).await?;
        self.audit
            .record_at(
                AuditRecord::new("delegation.created", ORCHESTRATOR_ACTOR)
                    .orchestrator(&task.orchestrator_id)
                    .task(&task.id)
                    .delegation(&delegation.id)
                    .detail(json!({ "provider": provider })),
                now,
            )
            .await?;

        let delegation_id = delegation.id.clone();
        let staged = async {
            self.queue.begin_planning(task_id, ORCHESTRATOR_ACTOR).await?;
            self.queue
                .transition_with(
                    task_id,
                    TaskStatus::Planning,
                    TaskStatus::Executing,
                    ORCHESTRATOR_ACTOR,
                    |t| {
                        t.delegation_id = Some(delegation_id);
                        t.assigned_agent = Some(provider);
                    },
                )
                .await
        };
        let task = match staged.await {
            Ok(task) => task,
            Err(err) => {
                let failure = Outcome::Failed {
                    kind: FailureKind::DelegationFailure,
                    message: err.to_string(),
                };
                self.finish_locked(delegation, failure, Utc::now()).await?;
                return Err(err);
            }
        };

        match self.launch(&task, &mut delegation).await {
            Ok(()) => {
                info!(
                    task_id = %task.id,
                    delegation_id = %delegation.id,
                    session_id = %delegation.session_id,
                    "Delegation running"
                );
                Ok(delegation)
            }
            Err(err) => {
                warn!(task_id = %task.id, delegation_id = %delegation.id, "Delegation failed: {}", err);
                let failure = Outcome::Failed {
                    kind: FailureKind::DelegationFailure,
                    message: err.to_string(),
                };
                self.finish_locked(delegation, failure, Utc::now()).await
            }
        }
    }

    /// Pick the next queued task of an orchestrator and delegate it.
    pub async fn dispatch_next(
        &self,
        orchestrator_id: &str,
        provider: Option<AgentProviderKind>,
    ) -> OrchestrationResult<Option<Delegation>> {
        match self.queue.next_queued(orchestrator_id).await? {
            Some(task) => self.delegate(&task.id, provider).await.map(Some),
            None => Ok(None),
        }
    }

    async fn launch(&self, task: &Task, delegation: &mut Delegation) -> OrchestrationResult<()> {
        let handle = self
            .broker
            .acquire(SessionRequest {
                provider: delegation.agent_provider,
                folder: task.folder_scope.clone(),
                task_id: task.id.clone(),
            })
            .await?;
        delegation.session_id = handle.session_id.clone();
        delegation.output_baseline = handle.baseline;
        delegation.transcript_ref = handle.transcript_ref;

        let context = self.render_context(task).await;
        delegation.injected_context = context.clone();
        let message = if handle.reused {
            format!("reusing session {}", handle.session_id)
        } else {
            format!("started session {}", handle.session_id)
        };
        self.advance(delegation, DelegationStatus::InjectingContext, message, Utc::now())
            .await?;

        self.broker
            .write_input(&handle.session_id, &context, self.settings.inject_timeout)
            .await?;

        let now = Utc::now();
        delegation.last_activity_at = Some(now);
        self.advance(delegation, DelegationStatus::Running, "context injected", now)
            .await
    }

    /// Task description, project knowledge and linked issue, in that order.
    pub async fn render_context(&self, task: &Task) -> String {
        let mut out = format!("# Task ({})\n\n{}\n", task.task_type, task.description);

        let knowledge = self.knowledge.knowledge(task.folder_scope.as_deref()).await;
        if !knowledge.is_empty() {
            out.push_str("\n# Project knowledge\n\n");
            for snippet in knowledge {
                out.push_str("- ");
                out.push_str(snippet.trim());
                out.push('\n');
            }
        }
        if let Some(issue) = &task.external_issue_ref {
            out.push_str("\n# Linked issue\n\n");
            out.push_str(&issue.render());
            out.push('\n');
        }
        out
    }

    /// Compare-and-set a delegation to `to` and audit it. `delegation` is
    /// updated only when the write succeeds.
    pub async fn advance(
        &self,
        delegation: &mut Delegation,
        to: DelegationStatus,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> OrchestrationResult<()> {
        let from = delegation.status;
        if !from.can_transition_to(to) {
            return Err(OrchestrationError::transition(
                "delegation",
                &delegation.id,
                from,
                to,
            ));
        }

        let mut next = delegation.clone();
        next.status = to;
        next.log(at, message);
        if to.is_terminal() {
            next.completed_at = Some(at);
        }
        self.store.update_delegation(next.clone(), from).await?;
        *delegation = next;

        self.audit
            .record_at(
                AuditRecord::new("delegation.transition", ORCHESTRATOR_ACTOR)
                    .task(&delegation.task_id)
                    .delegation(&delegation.id)
                    .session(&delegation.session_id)
                    .detail(json!({ "from": from, "to": to })),
                at,
            )
            .await?;
        Ok(())
    }

    /// Persist non-status fields of a delegation.
    pub async fn save(&self, delegation: &Delegation) -> OrchestrationResult<()> {
        self.store
            .update_delegation(delegation.clone(), delegation.status)
            .await
    }

    /// First output seen: delegation `running -> monitoring`, task
    /// `executing -> monitoring`. Caller holds the task lock.
    pub async fn begin_monitoring(
        &self,
        delegation: &mut Delegation,
        at: DateTime<Utc>,
    ) -> OrchestrationResult<()> {
        if delegation.status != DelegationStatus::Running {
            return Ok(());
        }
        self.advance(delegation, DelegationStatus::Monitoring, "agent output started", at)
            .await?;
        let task = self.queue.get(&delegation.task_id).await?;
        if task.status == TaskStatus::Executing {
            self.queue
                .transition(
                    &task.id,
                    TaskStatus::Executing,
                    TaskStatus::Monitoring,
                    ORCHESTRATOR_ACTOR,
                )
                .await?;
        }
        Ok(())
    }

    /// Finalize a delegation and mirror the outcome onto its task. Caller
    /// holds the task lock.
    pub async fn finish_locked(
        &self,
        mut delegation: Delegation,
        outcome: Outcome,
        at: DateTime<Utc>,
    ) -> OrchestrationResult<Delegation> {
        let task = self.queue.get(&delegation.task_id).await?;

        match outcome {
            Outcome::Completed { summary } => {
                self.begin_monitoring(&mut delegation, at).await?;
                delegation.result = summary.clone();
                self.advance(&mut delegation, DelegationStatus::Completed, "agent finished", at)
                    .await?;
                if let Some(insight_id) = delegation.stall_insight_id.clone() {
                    self.audit.resolve_insight(&insight_id, ORCHESTRATOR_ACTOR).await?;
                }

                let task = self.queue.get(&task.id).await?;
                if task.status == TaskStatus::Monitoring {
                    self.queue
                        .complete(&task.id, TaskStatus::Monitoring, summary, ORCHESTRATOR_ACTOR)
                        .await?;
                }
                if !delegation.session_id.is_empty() {
                    self.broker.release(&delegation.session_id).await;
                }
                info!(task_id = %task.id, delegation_id = %delegation.id, "Delegation completed");
            }
            Outcome::Failed { kind, message } => {
                delegation.error = Some(ErrorInfo::new(kind, message.clone()));
                self.advance(
                    &mut delegation,
                    DelegationStatus::Failed,
                    format!("{}: {}", kind, message),
                    at,
                )
                .await?;

                if task.status.can_transition_to(TaskStatus::Failed) {
                    self.queue
                        .fail(
                            &task.id,
                            task.status,
                            ErrorInfo::new(kind, message.clone()),
                            ORCHESTRATOR_ACTOR,
                        )
                        .await?;
                }

                let insight_kind = match kind {
                    FailureKind::CrashDuringRun | FailureKind::StartupFailure => {
                        Some(InsightKind::SessionCrashed)
                    }
                    FailureKind::DelegationFailure | FailureKind::StallTimeout => {
                        Some(InsightKind::DelegationFailed)
                    }
                    FailureKind::Cancelled => None,
                };
                if let Some(insight_kind) = insight_kind {
                    self.audit
                        .record_insight(
                            NewInsight {
                                orchestrator_id: task.orchestrator_id.clone(),
                                task_id: Some(task.id.clone()),
                                session_id: Some(delegation.session_id.clone())
                                    .filter(|s| !s.is_empty()),
                                delegation_id: Some(delegation.id.clone()),
                                kind: insight_kind,
                                severity: if kind == FailureKind::StallTimeout {
                                    Severity::Critical
                                } else {
                                    Severity::Warning
                                },
                                title: format!("Delegation failed ({})", kind),
                                detail: message.clone(),
                            },
                            at,
                        )
                        .await?;
                }

                if !delegation.session_id.is_empty() {
                    if let Err(err) = self.broker.stop(&delegation.session_id).await {
                        warn!(session_id = %delegation.session_id, "Session stop failed: {}", err);
                    }
                }
                warn!(
                    task_id = %task.id,
                    delegation_id = %delegation.id,
                    kind = %kind,
                    "Delegation failed: {}",
                    message
                );
            }
        }
        Ok(delegation)
    }

    /// Cancel a task and its active delegation, then stop the session.
    pub async fn cancel_task(
        &self,
        task_id: &str,
        reason: &str,
        actor: &str,
    ) -> OrchestrationResult<Task> {
        let _guard = self.lock_task(task_id).await?;

        let task = self.queue.get(task_id).await?;
        if task.status.is_terminal() {
            return Err(OrchestrationError::transition(
                "task",
                task_id,
                task.status,
                TaskStatus::Cancelled,
            ));
        }

        let now = Utc::now();
        let mut session_to_stop = None;
        if let Some(mut delegation) = self.store.active_delegation(task_id).await? {
            delegation.error = Some(ErrorInfo::new(FailureKind::Cancelled, reason));
            self.advance(
                &mut delegation,
                DelegationStatus::Failed,
                format!("cancelled: {}", reason),
                now,
            )
            .await?;
            if !delegation.session_id.is_empty() {
                session_to_stop = Some(delegation.session_id);
            }
        }

        let reason_owned = reason.to_string();
        let task = self
            .queue
            .transition_with(task_id, task.status, TaskStatus::Cancelled, actor, |t| {
                t.error_info = Some(ErrorInfo::new(FailureKind::Cancelled, reason_owned));
            })
            .await?;

        if let Some(session_id) = session_to_stop {
            if let Err(err) = self.broker.stop(&session_id).await {
                warn!(session_id = %session_id, "Session stop after cancel failed: {}", err);
            }
        }
        info!(task_id = %task_id, reason = %reason, "Task cancelled");
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::StaticFolders;
    use crate::store::MemoryStore;
    use crate::types::{ExternalIssueRef, TaskType};
    use async_trait::async_trait;
    use devfleet_common::config::FolderSection;
    use devfleet_supervisor::SessionOutput;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    struct NullBroker;

    #[async_trait]
    impl SessionBroker for NullBroker {
        async fn acquire(
            &self,
            _request: SessionRequest,
        ) -> OrchestrationResult<crate::session::SessionHandle> {
            Err(OrchestrationError::Session("no sessions".into()))
        }
        async fn write_input(&self, _: &str, _: &str, _: Duration) -> OrchestrationResult<()> {
            Ok(())
        }
        async fn output_since(&self, _: &str, _: u64) -> OrchestrationResult<SessionOutput> {
            Ok(SessionOutput::default())
        }
        async fn release(&self, _: &str) {}
        async fn stop(&self, _: &str) -> OrchestrationResult<()> {
            Ok(())
        }
    }

    fn engine() -> DelegationEngine {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let folders = StaticFolders::new(BTreeMap::from([(
            "web".to_string(),
            FolderSection {
                path: PathBuf::from("/srv/web"),
                knowledge: vec!["Run pnpm test before finishing.".into()],
                ..FolderSection::default()
            },
        )]));
        DelegationEngine::new(
            store.clone(),
            AuditLog::new(store),
            Arc::new(NullBroker),
            Arc::new(folders),
            EngineSettings::default(),
        )
    }

    fn task() -> Task {
        let now = Utc::now();
        Task {
            id: "t1".into(),
            orchestrator_id: "o1".into(),
            folder_scope: Some("web".into()),
            description: "Fix the login redirect".into(),
            task_type: TaskType::Bug,
            status: TaskStatus::Queued,
            confidence: 0.9,
            priority: 5,
            assigned_agent: None,
            delegation_id: None,
            external_issue_ref: Some(ExternalIssueRef {
                provider: "github".into(),
                repo: "acme/web".into(),
                number: 7,
                title: Some("Redirect loop".into()),
                url: None,
                body: None,
            }),
            result_summary: None,
            error_info: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn context_contains_description_knowledge_and_issue() {
        let engine = engine();
        let context = engine.render_context(&task()).await;
        let description = context.find("Fix the login redirect").unwrap();
        let knowledge = context.find("- Run pnpm test before finishing.").unwrap();
        let issue = context.find("github acme/web#7: Redirect loop").unwrap();
        assert!(description < knowledge && knowledge < issue);
    }

    #[tokio::test]
    async fn failed_session_acquire_fails_delegation_and_task() {
        let engine = engine();
        engine.store().insert_task(task()).await.unwrap();

        let delegation = engine.delegate("t1", None).await.unwrap();
        assert_eq!(delegation.status, DelegationStatus::Failed);
        assert_eq!(
            delegation.error.as_ref().map(|e| e.kind),
            Some(FailureKind::DelegationFailure)
        );
        let task = engine.queue().get("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.delegation_id.as_deref(), Some(delegation.id.as_str()));

        let insights = engine.audit().insights(Some("o1")).await.unwrap();
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].kind, InsightKind::DelegationFailed);
    }

    #[tokio::test]
    async fn task_locks_are_per_task() {
        let engine = engine();
        let first = engine.lock_task("a").await.unwrap();
        // A different task is not blocked.
        let other = tokio::time::timeout(Duration::from_millis(100), engine.lock_task("b")).await;
        assert!(other.is_ok());
        // The same task is.
        let same = tokio::time::timeout(Duration::from_millis(100), engine.lock_task("a")).await;
        assert!(same.is_err());
        drop(first);
        assert!(engine.lock_task("a").await.is_ok());
    }
}
