//! Lifecycle commands: detached start, stop with orphan sweep, status and
//! the foreground run used by `start`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use devfleet_common::config::FleetConfig;
use devfleet_common::limits::{resolve_stop_limits, StopLimits};
use devfleet_common::process_utils::{pid_matches, process_exists};
use devfleet_common::runtime::{ControlLock, PidMarker, RuntimeDir, SNAPSHOT_FILE};
use devfleet_supervisor::{FleetSnapshot, ProcessStatus};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use serde_json::Value;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::daemon::Daemon;
use crate::protocol::{self, ControlRequest};

pub const DAEMON_LOG: &str = "devfleetd.log";
const LOCK_WAIT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const START_TIMEOUT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(100);

/// Where a command runs: the resolved runtime dir and config.
pub struct ControlEnv {
    pub runtime: RuntimeDir,
    pub config: FleetConfig,
    pub config_path: Option<PathBuf>,
}

impl ControlEnv {
    fn stop_limits(&self) -> StopLimits {
        resolve_stop_limits(
            self.config.stop.graceful_timeout_ms,
            self.config.stop.kill_timeout_ms,
            self.config.stop.spawn_confirm_ms,
            self.config.stop.port_free_timeout_ms,
        )
        .0
    }

    pub fn profile_or_default(&self, profile: Option<String>) -> String {
        profile.unwrap_or_else(|| self.config.runtime.default_profile.clone())
    }

    pub async fn request(&self, request: &ControlRequest) -> Result<Value> {
        if self.runtime.live_pid()?.is_none() {
            bail!("devfleetd is not running (try `devfleetd start`)");
        }
        protocol::send(&self.runtime.control_socket(), request, REQUEST_TIMEOUT)
            .await?
            .into_result()
    }
}

/// Take the control lock off the async workers: acquiring it polls with a
/// blocking sleep.
async fn control_lock(runtime: &RuntimeDir) -> Result<ControlLock> {
    let runtime = runtime.clone();
    tokio::task::spawn_blocking(move || runtime.lock(LOCK_WAIT))
        .await
        .context("control lock task")?
        .context("take control lock")
}

#[derive(Debug, Serialize)]
pub struct StartReport {
    pub pid: u32,
    pub profile: String,
    pub already_running: bool,
}

/// Spawn `devfleetd run <profile>` detached and wait until it answers.
pub async fn start(ctx: &ControlEnv, profile: &str) -> Result<StartReport> {
    let mut child = {
        let _lock = control_lock(&ctx.runtime).await?;
        if let Some(marker) = ctx.runtime.live_pid()? {
            let running = ctx
                .runtime
                .read_profile()?
                .unwrap_or_else(|| "unknown".to_string());
            info!(pid = marker.pid, profile = %running, "devfleetd already running");
            return Ok(StartReport {
                pid: marker.pid,
                profile: running,
                already_running: true,
            });
        }
        spawn_detached(ctx, profile)?
    };

    let deadline = Instant::now() + START_TIMEOUT;
    loop {
        let ready = protocol::send(&ctx.runtime.control_socket(), &ControlRequest::Ping, POLL * 5)
            .await
            .map(|response| response.ok)
            .unwrap_or(false);
        if ready {
            if let Some(marker) = ctx.runtime.live_pid()? {
                info!(pid = marker.pid, profile = %profile, "devfleetd ready");
                return Ok(StartReport {
                    pid: marker.pid,
                    profile: profile.to_string(),
                    already_running: false,
                });
            }
        }
        if let Some(status) = child.try_wait()? {
            bail!(
                "devfleetd exited with {} while starting; see {}",
                status,
                ctx.runtime.logs_dir().join(DAEMON_LOG).display()
            );
        }
        if Instant::now() >= deadline {
            bail!("devfleetd failed to start within {}ms", START_TIMEOUT.as_millis());
        }
        sleep(POLL).await;
    }
}

fn spawn_detached(ctx: &ControlEnv, profile: &str) -> Result<tokio::process::Child> {
    let binary = std::env::current_exe().context("locate devfleetd binary")?;
    ctx.runtime.ensure()?;
    let log_path = ctx.runtime.logs_dir().join(DAEMON_LOG);
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("open {}", log_path.display()))?;

    let mut cmd = Command::new(&binary);
    cmd.arg("--runtime-dir").arg(ctx.runtime.path());
    if let Some(config) = &ctx.config_path {
        cmd.arg("--config").arg(config);
    }
    cmd.arg("run")
        .arg(profile)
        .env(
            "RUST_LOG",
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        )
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log))
        .process_group(0)
        .kill_on_drop(false);

    let child = cmd
        .spawn()
        .with_context(|| format!("spawn {}", binary.display()))?;
    info!(pid = ?child.id(), profile = %profile, "Spawned devfleetd");
    Ok(child)
}

#[derive(Debug, Default, Serialize)]
pub struct StopReport {
    pub daemon_pid: Option<u32>,
    pub was_running: bool,
    pub forced: bool,
    pub orphans_terminated: Vec<u32>,
}

/// Stop the daemon, then terminate supervised processes it left behind.
///
/// A daemon that outlives SIGKILL keeps its markers and fails the stop.
pub async fn stop(ctx: &ControlEnv) -> Result<StopReport> {
    stop_with(ctx, signal).await
}

async fn stop_with(ctx: &ControlEnv, send: SignalFn) -> Result<StopReport> {
    let _lock = control_lock(&ctx.runtime).await?;
    let limits = ctx.stop_limits();
    let mut report = StopReport::default();

    if let Some(marker) = ctx.runtime.live_pid()? {
        report.daemon_pid = Some(marker.pid);
        report.was_running = true;
        // The daemon stops its own children first, so its grace covers both waits.
        let grace = limits.graceful_timeout() + limits.kill_timeout() + Duration::from_secs(1);
        match terminate(marker.pid, marker.start_ticks, grace, limits.kill_timeout(), send).await {
            Termination::Exited => {}
            Termination::Killed => report.forced = true,
            Termination::Survived => bail!(
                "devfleetd (pid {}) is still running after SIGKILL; markers left in place",
                marker.pid
            ),
        }
    } else {
        debug!("No live devfleetd pid marker");
    }
    ctx.runtime.clear_daemon_markers()?;

    let snapshot: Option<FleetSnapshot> = match ctx.runtime.read_json(SNAPSHOT_FILE) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!("Unreadable {}: {}", SNAPSHOT_FILE, err);
            None
        }
    };
    if let Some(snapshot) = snapshot {
        for (id, pid, start_ticks) in orphans(&snapshot, pid_matches) {
            warn!(process_id = %id, pid, "Terminating orphaned supervised process");
            let outcome =
                terminate(pid, start_ticks, limits.graceful_timeout(), limits.kill_timeout(), send).await;
            if outcome == Termination::Survived {
                warn!(process_id = %id, pid, "Orphan survived SIGKILL");
            } else {
                report.orphans_terminated.push(pid);
            }
        }
    }
    Ok(report)
}

/// Snapshot records whose process is still alive, by id, pid and start
/// ticks. A `crashed` server that kept running counts; a `stopped` record
/// was already reaped by the daemon.
pub fn orphans(
    snapshot: &FleetSnapshot,
    alive: impl Fn(u32, Option<u64>) -> bool,
) -> Vec<(String, u32, Option<u64>)> {
    snapshot
        .processes
        .iter()
        .filter(|process| process.status != ProcessStatus::Stopped)
        .filter_map(|process| {
            let pid = process.pid?;
            alive(pid, process.start_ticks).then(|| (process.id.clone(), pid, process.start_ticks))
        })
        .collect()
}

type SignalFn = fn(u32, Signal);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Exited,
    Killed,
    Survived,
}

/// SIGTERM, wait, SIGKILL, wait.
async fn terminate(
    pid: u32,
    start_ticks: Option<u64>,
    grace: Duration,
    kill_wait: Duration,
    send: SignalFn,
) -> Termination {
    if !pid_matches(pid, start_ticks) {
        return Termination::Exited;
    }
    send(pid, Signal::SIGTERM);
    if wait_gone(pid, start_ticks, grace).await {
        return Termination::Exited;
    }
    warn!(pid, timeout_ms = grace.as_millis() as u64, "Graceful stop timed out, sending SIGKILL");
    if pid_matches(pid, start_ticks) {
        send(pid, Signal::SIGKILL);
    }
    if wait_gone(pid, start_ticks, kill_wait).await {
        Termination::Killed
    } else {
        error!(pid, "Process still present after SIGKILL");
        Termination::Survived
    }
}

fn signal(pid: u32, signal: Signal) {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => debug!(pid, ?signal, "Signal sent"),
        Err(err) => warn!(pid, ?signal, "Signal failed: {}", err),
    }
}

async fn wait_gone(pid: u32, start_ticks: Option<u64>, wait: Duration) -> bool {
    let deadline = Instant::now() + wait;
    loop {
        if !process_exists(pid) || !pid_matches(pid, start_ticks) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL).await;
    }
}

pub async fn restart(ctx: &ControlEnv, profile: &str) -> Result<StartReport> {
    let stopped = stop(ctx).await?;
    debug!(?stopped, "Stopped before restart");
    start(ctx, profile).await
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub pid: Option<u32>,
    pub profile: Option<String>,
    pub runtime_dir: PathBuf,
    /// Live view from the daemon, when it answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daemon: Option<Value>,
    /// Last snapshot on disk, shown when the daemon does not answer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<FleetSnapshot>,
}

pub async fn status(ctx: &ControlEnv) -> Result<StatusReport> {
    let marker = ctx.runtime.live_pid()?;
    let mut report = StatusReport {
        running: marker.is_some(),
        pid: marker.map(|m| m.pid),
        profile: ctx.runtime.read_profile()?,
        runtime_dir: ctx.runtime.path().to_path_buf(),
        daemon: None,
        snapshot: None,
    };
    if report.running {
        match protocol::send(&ctx.runtime.control_socket(), &ControlRequest::Status, REQUEST_TIMEOUT).await {
            Ok(response) => report.daemon = response.into_result().ok(),
            Err(err) => warn!("Daemon did not answer status: {:#}", err),
        }
    }
    if report.daemon.is_none() {
        report.snapshot = ctx.runtime.read_json(SNAPSHOT_FILE).unwrap_or(None);
    }
    Ok(report)
}

/// Run the daemon in the foreground until it is told to stop.
pub async fn run_foreground(ctx: ControlEnv, profile: &str) -> Result<()> {
    {
        let _lock = control_lock(&ctx.runtime).await?;
        if let Some(marker) = ctx.runtime.live_pid()? {
            if marker.pid != std::process::id() {
                bail!("devfleetd already running with pid {}", marker.pid);
            }
        }
        ctx.runtime.ensure()?;
        ctx.runtime.write_pid(&PidMarker::current())?;
        ctx.runtime.write_profile(profile)?;
    }

    let result = run_daemon(&ctx, profile).await;

    // `stop` may hold the lock while waiting for this process to exit.
    if let Err(err) = ctx.runtime.clear_daemon_markers() {
        warn!("Failed to clear daemon markers: {}", err);
    }
    result
}

async fn run_daemon(ctx: &ControlEnv, profile: &str) -> Result<()> {
    let daemon: Arc<Daemon> = Daemon::build(ctx.config.clone(), ctx.runtime.clone(), profile).await?;
    daemon.run().await
}

/// Runtime dir from the flag, the config file or the default location.
pub fn resolve_runtime_dir(flag: Option<&Path>, config: &FleetConfig) -> Result<RuntimeDir> {
    if let Some(dir) = flag {
        return Ok(RuntimeDir::new(dir));
    }
    if let Some(dir) = &config.runtime.dir {
        return Ok(RuntimeDir::new(dir));
    }
    devfleet_common::default_runtime_dir()
        .map(RuntimeDir::new)
        .map_err(|err| anyhow!("resolve runtime dir: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use devfleet_supervisor::{BindTarget, ProcessKind, Scope, SupervisedProcess};

    fn process(id: &str, pid: Option<u32>, status: ProcessStatus) -> SupervisedProcess {
        let now = Utc::now();
        SupervisedProcess {
            id: id.into(),
            name: id.into(),
            kind: ProcessKind::DevServer,
            bind_target: BindTarget::Stdio,
            pid,
            start_ticks: Some(42),
            status,
            created_at: now,
            startup_deadline: now,
            working_dir: None,
            scope: Scope::Global,
            failure: None,
            crashed_reason: None,
            exit_code: None,
            stopped_at: None,
        }
    }

    fn env(temp: &tempfile::TempDir, config: FleetConfig) -> ControlEnv {
        ControlEnv {
            runtime: RuntimeDir::new(temp.path()),
            config,
            config_path: None,
        }
    }

    #[test]
    fn orphans_are_unstopped_records_with_matching_pids() {
        let snapshot = FleetSnapshot {
            written_at: None,
            processes: vec![
                process("running", Some(10), ProcessStatus::Running),
                process("starting", Some(11), ProcessStatus::Starting),
                process("stopped", Some(12), ProcessStatus::Stopped),
                process("no-pid", None, ProcessStatus::Running),
                process("reused", Some(13), ProcessStatus::Running),
                process("crashed", Some(14), ProcessStatus::Crashed),
            ],
            health: Vec::new(),
        };
        let found = orphans(&snapshot, |pid, ticks| pid != 13 && ticks == Some(42));
        let ids: Vec<_> = found.iter().map(|(id, _, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["running", "starting", "crashed"]);
        assert_eq!(found[0].1, 10);
        assert_eq!(found[2].1, 14);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn daemon_surviving_sigkill_keeps_its_markers() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut config = FleetConfig::default();
        config.stop.graceful_timeout_ms = Some(100);
        config.stop.kill_timeout_ms = Some(100);
        let ctx = env(&temp, config);
        ctx.runtime.ensure().unwrap();

        // A stand-in daemon that ignores every signal we "send".
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let start_ticks = devfleet_common::process_utils::read_proc_stat(pid)
            .unwrap()
            .starttime;
        ctx.runtime
            .write_pid(&PidMarker {
                pid,
                start_ticks: Some(start_ticks),
            })
            .unwrap();
        ctx.runtime.write_profile("dev").unwrap();

        let result = stop_with(&ctx, |_, _| {}).await;
        let marker = ctx.runtime.live_pid().unwrap();

        child.kill().unwrap();
        child.wait().unwrap();

        let err = result.unwrap_err();
        assert!(err.to_string().contains("still running"), "{:#}", err);
        assert_eq!(marker.map(|m| m.pid), Some(pid));
        assert_eq!(ctx.runtime.read_profile().unwrap().as_deref(), Some("dev"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn waiting_for_the_lock_leaves_the_runtime_free() {
        let temp = tempfile::TempDir::new().unwrap();
        let runtime = RuntimeDir::new(temp.path());
        runtime.ensure().unwrap();
        let held = control_lock(&runtime).await.unwrap();

        // On a single-threaded runtime the release below can only run if the
        // second acquisition does not block the worker.
        let release = async {
            sleep(Duration::from_millis(200)).await;
            drop(held);
        };
        let started = Instant::now();
        let (second, ()) = tokio::join!(control_lock(&runtime), release);
        assert!(second.is_ok());
        assert!(started.elapsed() < LOCK_WAIT);
    }

    #[tokio::test]
    async fn stop_without_daemon_is_a_no_op() {
        let temp = tempfile::TempDir::new().unwrap();
        let ctx = env(&temp, FleetConfig::default());
        let report = stop(&ctx).await.unwrap();
        assert!(!report.was_running);
        assert!(report.orphans_terminated.is_empty());
        let again = stop(&ctx).await.unwrap();
        assert!(!again.was_running);
    }

    #[tokio::test]
    async fn status_reports_stale_markers_as_stopped() {
        let temp = tempfile::TempDir::new().unwrap();
        let runtime = RuntimeDir::new(temp.path());
        runtime
            .write_pid(&PidMarker {
                pid: u32::MAX - 1,
                start_ticks: None,
            })
            .unwrap();
        runtime.write_profile("web").unwrap();
        let ctx = ControlEnv {
            runtime,
            config: FleetConfig::default(),
            config_path: None,
        };
        let report = status(&ctx).await.unwrap();
        assert!(!report.running);
        assert_eq!(report.profile, None);
    }
}
