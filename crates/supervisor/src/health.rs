//! Health monitor: one polling loop over every live supervised process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devfleet_common::limits::HealthLimits;
use devfleet_common::process_utils::{clock_ticks_per_second, read_proc_stat, read_rss_kb};
use devfleet_common::runtime::{RuntimeDir, SNAPSHOT_FILE};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::process::{ExitInfo, ProcessSupervisor};
use crate::types::{
    BindTarget, FailureKind, FleetSnapshot, HealthRecord, ProcessKind, ProcessStatus,
    SupervisedProcess,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(String),
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, target: &BindTarget, timeout: Duration) -> ProbeOutcome;
}

/// HTTP HEAD for ports, a Unix socket connect for sockets.
///
/// Any response below 500 counts as healthy: a dev server answering 404 on `/`
/// is still up.
#[derive(Clone, Debug)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|err| {
                warn!("Falling back to default HTTP client: {}", err);
                reqwest::Client::new()
            });
        Self { client }
    }
}

impl HttpProbe {
    async fn head(&self, url: &str, timeout: Duration) -> reqwest::Result<reqwest::Response> {
        self.client.head(url).timeout(timeout).send().await
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, target: &BindTarget, timeout: Duration) -> ProbeOutcome {
        match target {
            BindTarget::Port(port) => {
                let mut result = self.head(&format!("http://127.0.0.1:{}/", port), timeout).await;
                if matches!(&result, Err(err) if err.is_connect()) {
                    // A server bound to `localhost` may only listen on ::1.
                    if let Ok(response) = self.head(&format!("http://[::1]:{}/", port), timeout).await {
                        result = Ok(response);
                    }
                }
                match result {
                    Ok(response) if response.status().as_u16() < 500 => ProbeOutcome::Healthy,
                    Ok(response) => ProbeOutcome::Unhealthy(format!("HTTP {}", response.status())),
                    Err(err) if err.is_timeout() => {
                        ProbeOutcome::Unhealthy(format!("timed out after {}ms", timeout.as_millis()))
                    }
                    Err(err) => ProbeOutcome::Unhealthy(err.to_string()),
                }
            }
            BindTarget::Socket(path) => probe_socket(path, timeout).await,
            BindTarget::Stdio => ProbeOutcome::Healthy,
        }
    }
}

#[cfg(unix)]
async fn probe_socket(path: &std::path::Path, timeout: Duration) -> ProbeOutcome {
    match tokio::time::timeout(timeout, tokio::net::UnixStream::connect(path)).await {
        Ok(Ok(_)) => ProbeOutcome::Healthy,
        Ok(Err(err)) => ProbeOutcome::Unhealthy(err.to_string()),
        Err(_) => ProbeOutcome::Unhealthy(format!("timed out after {}ms", timeout.as_millis())),
    }
}

#[cfg(not(unix))]
async fn probe_socket(path: &std::path::Path, _timeout: Duration) -> ProbeOutcome {
    ProbeOutcome::Unhealthy(format!(
        "unix sockets are not supported here ({})",
        path.display()
    ))
}

/// What a probe result means for the process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Unchanged,
    BecameHealthy,
    Crashed(String),
}

/// Fold one probe outcome into the record.
///
/// Failures only crash a `running` process; while `starting` the startup
/// deadline decides (see [`check_startup_deadline`]).
pub fn apply_probe(
    record: &mut HealthRecord,
    status: ProcessStatus,
    outcome: &ProbeOutcome,
    threshold: u32,
    now: DateTime<Utc>,
) -> Verdict {
    record.last_checked_at = Some(now);
    match outcome {
        ProbeOutcome::Healthy => {
            record.is_healthy = true;
            record.consecutive_failures = 0;
            if status == ProcessStatus::Starting {
                Verdict::BecameHealthy
            } else {
                Verdict::Unchanged
            }
        }
        ProbeOutcome::Unhealthy(reason) => {
            record.is_healthy = false;
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            if status == ProcessStatus::Running
                && record.consecutive_failures >= threshold.max(1)
                && record.crashed_at.is_none()
            {
                let reason = format!(
                    "{} consecutive failed health probes (last: {})",
                    record.consecutive_failures, reason
                );
                record.crashed_at = Some(now);
                record.crash_reason = Some(reason.clone());
                Verdict::Crashed(reason)
            } else {
                Verdict::Unchanged
            }
        }
    }
}

/// Wall-clock startup deadline, independent of probe results.
pub fn check_startup_deadline(
    record: &mut HealthRecord,
    process: &SupervisedProcess,
    now: DateTime<Utc>,
) -> Verdict {
    if process.status != ProcessStatus::Starting
        || now < process.startup_deadline
        || record.crashed_at.is_some()
    {
        return Verdict::Unchanged;
    }
    let reason = format!(
        "startup deadline exceeded after {}s",
        (process.startup_deadline - process.created_at).num_seconds()
    );
    record.crashed_at = Some(now);
    record.crash_reason = Some(reason.clone());
    Verdict::Crashed(reason)
}

#[derive(Clone, Debug)]
pub struct HealthSettings {
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
}

impl From<&HealthLimits> for HealthSettings {
    fn from(limits: &HealthLimits) -> Self {
        Self {
            poll_interval: limits.poll_interval(),
            probe_timeout: limits.probe_timeout(),
            failure_threshold: limits.failure_threshold,
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            failure_threshold: 3,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct CpuSample {
    ticks: u64,
    at: Instant,
}

pub struct HealthMonitor {
    supervisor: ProcessSupervisor,
    probe: Arc<dyn HealthProbe>,
    settings: HealthSettings,
    records: Mutex<HashMap<String, HealthRecord>>,
    cpu_samples: Mutex<HashMap<String, CpuSample>>,
    snapshot_to: Option<RuntimeDir>,
}

impl HealthMonitor {
    pub fn new(
        supervisor: ProcessSupervisor,
        probe: Arc<dyn HealthProbe>,
        settings: HealthSettings,
    ) -> Self {
        Self {
            supervisor,
            probe,
            settings,
            records: Mutex::new(HashMap::new()),
            cpu_samples: Mutex::new(HashMap::new()),
            snapshot_to: None,
        }
    }

    /// Write `processes.json` into `runtime` after every cycle.
    pub fn with_snapshot(mut self, runtime: RuntimeDir) -> Self {
        self.snapshot_to = Some(runtime);
        self
    }

    pub async fn record(&self, process_id: &str) -> Option<HealthRecord> {
        self.records.lock().await.get(process_id).cloned()
    }

    pub async fn records(&self) -> Vec<HealthRecord> {
        let mut records: Vec<HealthRecord> = self.records.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.process_id.cmp(&b.process_id));
        records
    }

    pub async fn poll_once(&self) {
        self.poll_at(Utc::now()).await;
    }

    /// One cycle against an explicit clock.
    pub async fn poll_at(&self, now: DateTime<Utc>) {
        let observed = self.supervisor.observe().await;

        {
            let keep = |id: &String| {
                observed
                    .iter()
                    .any(|(p, _)| &p.id == id && p.status != ProcessStatus::Stopped)
            };
            self.records.lock().await.retain(|id, _| keep(id));
            self.cpu_samples.lock().await.retain(|id, _| keep(id));
        }

        for (process, exit) in observed {
            if !process.status.is_live() {
                continue;
            }
            self.check_process(&process, exit, now).await;
        }

        if let Some(runtime) = &self.snapshot_to {
            let snapshot = self.snapshot().await;
            if let Err(err) = runtime.write_json(SNAPSHOT_FILE, &snapshot) {
                warn!("Failed to write process snapshot: {}", err);
            }
        }
    }

    async fn check_process(
        &self,
        process: &SupervisedProcess,
        exited: Option<ExitInfo>,
        now: DateTime<Utc>,
    ) {
        let id = process.id.as_str();

        // An agent that finished its work and exited 0 did not crash; its
        // owner stops it once the delegation is finalized.
        if process.kind == ProcessKind::AgentSession && exited.is_some_and(|e| e.code == Some(0)) {
            debug!(process_id = %id, "Agent session exited cleanly, awaiting stop");
            self.cpu_samples.lock().await.remove(id);
            let mut records = self.records.lock().await;
            let record = records
                .entry(id.to_string())
                .or_insert_with(|| HealthRecord::new(id));
            record.is_healthy = false;
            record.last_checked_at = Some(now);
            return;
        }

        let mut record = self
            .records
            .lock()
            .await
            .get(id)
            .cloned()
            .unwrap_or_else(|| HealthRecord::new(id));

        let verdict = if let Some(description) = exited.map(|e| e.describe()) {
            record.is_healthy = false;
            record.last_checked_at = Some(now);
            if record.crashed_at.is_none() {
                record.crashed_at = Some(now);
                record.crash_reason = Some(description.clone());
            }
            Verdict::Crashed(description)
        } else {
            let outcome = match process.kind {
                // The reaper has not seen an exit, so the session is alive.
                ProcessKind::AgentSession => ProbeOutcome::Healthy,
                ProcessKind::DevServer => {
                    self.probe
                        .probe(&process.bind_target, self.settings.probe_timeout)
                        .await
                }
            };
            debug!(process_id = %id, outcome = ?outcome, "Health probe");
            match apply_probe(
                &mut record,
                process.status,
                &outcome,
                self.settings.failure_threshold,
                now,
            ) {
                Verdict::Unchanged => check_startup_deadline(&mut record, process, now),
                other => other,
            }
        };

        match verdict {
            Verdict::BecameHealthy => {
                if let Err(err) = self.supervisor.mark_running(id).await {
                    debug!(process_id = %id, "mark_running skipped: {}", err);
                }
            }
            Verdict::Crashed(reason) => {
                let kind = if process.status == ProcessStatus::Starting {
                    FailureKind::StartupFailure
                } else {
                    FailureKind::CrashDuringRun
                };
                match self.supervisor.mark_crashed(id, kind, reason).await {
                    Ok(true) => info!(process_id = %id, failure = %kind, "Health monitor marked process crashed"),
                    Ok(false) => {}
                    Err(err) => debug!(process_id = %id, "mark_crashed skipped: {}", err),
                }
            }
            Verdict::Unchanged => {}
        }

        if let Some(pid) = process.pid {
            self.sample_resources(id, pid, &mut record).await;
        }

        self.records.lock().await.insert(id.to_string(), record);
    }

    async fn sample_resources(&self, id: &str, pid: u32, record: &mut HealthRecord) {
        match read_proc_stat(pid) {
            Ok(stat) => {
                let sample = CpuSample {
                    ticks: stat.cpu_ticks(),
                    at: Instant::now(),
                };
                let previous = self.cpu_samples.lock().await.insert(id.to_string(), sample);
                if let Some(previous) = previous {
                    record.cpu_percent = cpu_percent(previous, sample, clock_ticks_per_second());
                }
            }
            Err(err) => debug!(process_id = %id, pid, "CPU sample failed: {}", err),
        }
        match read_rss_kb(pid) {
            Ok(kb) => record.memory_mb = Some(kb as f64 / 1024.0),
            Err(err) => debug!(process_id = %id, pid, "Memory sample failed: {}", err),
        }
    }

    pub async fn snapshot(&self) -> FleetSnapshot {
        FleetSnapshot {
            written_at: Some(Utc::now()),
            processes: self.supervisor.list().await,
            health: self.records().await,
        }
    }

    /// Run the polling loop until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                interval_ms = self.settings.poll_interval.as_millis() as u64,
                threshold = self.settings.failure_threshold,
                "Health monitor started"
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
            info!("Health monitor stopped");
        })
    }
}

fn cpu_percent(previous: CpuSample, current: CpuSample, ticks_per_second: u64) -> Option<f64> {
    let elapsed = current.at.checked_duration_since(previous.at)?.as_secs_f64();
    if elapsed <= 0.0 || ticks_per_second == 0 {
        return None;
    }
    let ticks = current.ticks.saturating_sub(previous.ticks) as f64;
    Some(ticks / ticks_per_second as f64 / elapsed * 100.0)
}
