//! Process supervisor.
//!
//! Each supervised process is spawned with an explicit environment overlay and
//! its PID (plus start ticks) is recorded immediately. A per-process reaper task
//! owns the `Child`, waits for it and publishes the exit on a watch channel.
//! Nothing here walks the process tree: the recorded PID is the only handle.

use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use devfleet_common::limits::StopLimits;
use devfleet_common::process_utils::{pid_matches, read_proc_stat};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{SupervisorError, SupervisorResult};
use crate::ports::{validate_port, LoopbackProbe, PortProbe};
use crate::types::{
    BindTarget, FailureKind, ProcessEvent, ProcessKind, ProcessStatus, SessionActivity,
    SessionOutput, StartRequest, SupervisedProcess,
};

pub const PROCESS_ID_ENV: &str = "DEVFLEET_PROCESS_ID";
pub const CALLBACK_URL_ENV: &str = "DEVFLEET_CALLBACK_URL";
pub const AUTH_URL_ENV: &str = "DEVFLEET_AUTH_URL";

const EVENT_CAPACITY: usize = 256;
const PORT_FREE_POLL: Duration = Duration::from_millis(50);
/// How long an exit waits for the session's stdout to drain.
const TRANSCRIPT_DRAIN: Duration = Duration::from_secs(1);

/// How a supervised child ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {}", code),
            (None, Some(signal)) => format!("terminated by signal {}", signal),
            (None, None) => "exited".to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    pub logs_dir: PathBuf,
    pub stop: StopLimits,
    pub default_startup_deadline: Duration,
    pub transcript_lines: usize,
    pub callback_url: Option<String>,
    pub auth_url: Option<String>,
}

impl SupervisorSettings {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        let (stop, _) = devfleet_common::limits::resolve_stop_limits(None, None, None, None);
        Self {
            logs_dir: logs_dir.into(),
            stop,
            default_startup_deadline: Duration::from_secs(60),
            transcript_lines: 2_000,
            callback_url: None,
            auth_url: None,
        }
    }
}

#[derive(Debug, Default)]
struct Transcript {
    lines: VecDeque<String>,
    lines_captured: u64,
    first_output_at: Option<DateTime<Utc>>,
    last_output_at: Option<DateTime<Utc>>,
    /// stdout reached EOF.
    closed: bool,
}

struct ProcessEntry {
    record: SupervisedProcess,
    request: StartRequest,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: Option<mpsc::Sender<()>>,
    stdin: Option<Arc<Mutex<ChildStdin>>>,
    transcript: Option<Arc<Mutex<Transcript>>>,
}

type ProcessTable = HashMap<String, ProcessEntry>;

/// Cheap to clone; all clones share the same process table.
#[derive(Clone)]
pub struct ProcessSupervisor {
    settings: Arc<SupervisorSettings>,
    table: Arc<Mutex<ProcessTable>>,
    events: broadcast::Sender<ProcessEvent>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            settings: Arc::new(settings),
            table: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: ProcessEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Spawn a process and wait (bounded) for spawn confirmation.
    ///
    /// A spawn error, a missing PID, or an exit during the confirmation window
    /// is recorded as `crashed` with `startup_failure` and returned as
    /// [`SupervisorError::StartupFailure`].
    pub async fn start(&self, request: StartRequest) -> SupervisorResult<SupervisedProcess> {
        validate_request(&request)?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let deadline = request
            .startup_deadline
            .unwrap_or(self.settings.default_startup_deadline);
        let startup_deadline = now
            + chrono::Duration::from_std(deadline).unwrap_or_else(|_| chrono::Duration::seconds(60));

        let mut record = SupervisedProcess {
            id: id.clone(),
            name: request.name.clone(),
            kind: request.kind,
            bind_target: request.bind_target.clone(),
            pid: None,
            start_ticks: None,
            status: ProcessStatus::Starting,
            created_at: now,
            startup_deadline,
            working_dir: request.working_dir.clone(),
            scope: request.scope.clone(),
            failure: None,
            crashed_reason: None,
            exit_code: None,
            stopped_at: None,
        };

        let mut command = self.build_command(&id, &request)?;
        info!(
            process_id = %id,
            name = %request.name,
            kind = %request.kind,
            bind = %request.bind_target,
            command = %request.command.display_line(),
            "Starting supervised process"
        );

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let reason = format!("spawn failed: {}", err);
                return Err(self.record_startup_failure(record, request, reason).await);
            }
        };

        let Some(pid) = child.id() else {
            let _ = child.start_kill();
            let reason = "spawned child reported no pid".to_string();
            return Err(self.record_startup_failure(record, request, reason).await);
        };
        record.pid = Some(pid);
        record.start_ticks = read_proc_stat(pid).ok().map(|stat| stat.starttime);

        let stdin = child.stdin.take().map(|s| Arc::new(Mutex::new(s)));
        let (transcript, drained) = match child.stdout.take() {
            Some(stdout) => {
                let transcript = Arc::new(Mutex::new(Transcript::default()));
                let drained = spawn_transcript_reader(
                    id.clone(),
                    stdout,
                    transcript.clone(),
                    self.settings.transcript_lines,
                );
                (Some(transcript), Some(drained))
            }
            None => (None, None),
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        self.spawn_reaper(id.clone(), child, exit_tx, kill_rx, drained);

        let mut confirm_rx = exit_rx.clone();
        let confirm_window = self.settings.stop.spawn_confirm();
        let early_exit =
            match tokio::time::timeout(confirm_window, confirm_rx.wait_for(Option::is_some)).await {
                Ok(Ok(exit)) => *exit,
                _ => None,
            };

        if let Some(exit) = early_exit {
            record.exit_code = exit.code;
            let reason = format!("{} during startup", exit.describe());
            return Err(self.record_startup_failure(record, request, reason).await);
        }

        {
            let mut table = self.table.lock().await;
            table.insert(
                id.clone(),
                ProcessEntry {
                    record: record.clone(),
                    request,
                    exit_rx,
                    kill_tx: Some(kill_tx),
                    stdin,
                    transcript,
                },
            );
        }

        debug!(process_id = %id, pid, start_ticks = ?record.start_ticks, "Spawn confirmed");
        self.publish(ProcessEvent::Started {
            process_id: id,
            pid,
        });
        Ok(record)
    }

    fn build_command(&self, id: &str, request: &StartRequest) -> SupervisorResult<Command> {
        let mut command = Command::new(&request.command.program);
        command.args(&request.command.args);
        command.envs(&request.command.env);
        command.env(PROCESS_ID_ENV, id);

        match &request.bind_target {
            BindTarget::Port(port) => {
                command.env("PORT", port.to_string());
            }
            BindTarget::Socket(path) => {
                command.env("SOCKET_PATH", path);
            }
            BindTarget::Stdio => {}
        }
        if let Some(url) = &self.settings.callback_url {
            command.env(CALLBACK_URL_ENV, url);
        }
        if let Some(url) = &self.settings.auth_url {
            command.env(AUTH_URL_ENV, url);
        }
        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }

        std::fs::create_dir_all(&self.settings.logs_dir)
            .map_err(|err| SupervisorError::io("create logs dir", err))?;
        let log_path = self.settings.logs_dir.join(format!("{}.log", id));
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|err| SupervisorError::io("open process log", err))?;

        match request.kind {
            ProcessKind::DevServer => {
                let stdout_log = log
                    .try_clone()
                    .map_err(|err| SupervisorError::io("clone process log", err))?;
                command.stdin(Stdio::null());
                command.stdout(Stdio::from(stdout_log));
                command.stderr(Stdio::from(log));
            }
            ProcessKind::AgentSession => {
                command.stdin(Stdio::piped());
                command.stdout(Stdio::piped());
                command.stderr(Stdio::from(log));
            }
        }
        command.kill_on_drop(false);
        Ok(command)
    }

    fn spawn_reaper(
        &self,
        id: String,
        mut child: tokio::process::Child,
        exit_tx: watch::Sender<Option<ExitInfo>>,
        mut kill_rx: mpsc::Receiver<()>,
        drained: Option<watch::Receiver<bool>>,
    ) {
        let table = self.table.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Some(()) = kill_rx.recv() => {
                    if let Err(err) = child.start_kill() {
                        warn!(process_id = %id, "Forced kill failed: {}", err);
                    }
                    child.wait().await
                }
            };

            let exit = match status {
                Ok(status) => ExitInfo::from_status(status),
                Err(err) => {
                    error!(process_id = %id, "Failed to wait for child: {}", err);
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            debug!(process_id = %id, code = ?exit.code, signal = ?exit.signal, "Child exited");

            // Publish the exit only once the last output line is in the
            // transcript. Bounded: a grandchild may keep stdout open.
            if let Some(mut drained) = drained {
                let closed = tokio::time::timeout(TRANSCRIPT_DRAIN, drained.wait_for(|done| *done))
                    .await
                    .is_ok();
                if !closed {
                    debug!(process_id = %id, "Transcript still open after exit");
                }
            }

            if let Some(entry) = table.lock().await.get_mut(&id) {
                entry.record.exit_code = exit.code;
                entry.stdin = None;
            }
            let _ = exit_tx.send(Some(exit));
        });
    }

    async fn record_startup_failure(
        &self,
        mut record: SupervisedProcess,
        request: StartRequest,
        reason: String,
    ) -> SupervisorError {
        warn!(process_id = %record.id, name = %record.name, "Startup failure: {}", reason);
        record.status = ProcessStatus::Crashed;
        record.failure = Some(FailureKind::StartupFailure);
        record.crashed_reason = Some(reason.clone());

        let (exit_tx, exit_rx) = watch::channel(None);
        let _ = exit_tx.send(Some(ExitInfo {
            code: record.exit_code,
            signal: None,
        }));

        let id = record.id.clone();
        let name = record.name.clone();
        self.table.lock().await.insert(
            id.clone(),
            ProcessEntry {
                record,
                request,
                exit_rx,
                kill_tx: None,
                stdin: None,
                transcript: None,
            },
        );
        self.publish(ProcessEvent::Crashed {
            process_id: id.clone(),
            reason: reason.clone(),
        });

        SupervisorError::StartupFailure {
            process_id: id,
            name,
            reason,
        }
    }

    /// `starting → running`. Returns whether the status changed.
    pub async fn mark_running(&self, id: &str) -> SupervisorResult<bool> {
        let mut table = self.table.lock().await;
        let entry = table
            .get_mut(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        match entry.record.status {
            ProcessStatus::Running => return Ok(false),
            ProcessStatus::Starting => {}
            from => {
                return Err(SupervisorError::InvalidTransition {
                    process_id: id.to_string(),
                    from,
                    to: ProcessStatus::Running,
                })
            }
        }
        entry.record.status = ProcessStatus::Running;
        drop(table);

        info!(process_id = %id, "Process is running");
        self.publish(ProcessEvent::Running {
            process_id: id.to_string(),
        });
        Ok(true)
    }

    /// Mark a live process crashed. Idempotent: crashed or stopped processes
    /// are left untouched and `false` is returned.
    pub async fn mark_crashed(
        &self,
        id: &str,
        kind: FailureKind,
        reason: impl Into<String>,
    ) -> SupervisorResult<bool> {
        let reason = reason.into();
        let mut table = self.table.lock().await;
        let entry = table
            .get_mut(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        if !entry.record.status.can_transition_to(ProcessStatus::Crashed) {
            return Ok(false);
        }
        entry.record.status = ProcessStatus::Crashed;
        entry.record.failure = Some(kind);
        entry.record.crashed_reason = Some(reason.clone());
        drop(table);

        warn!(process_id = %id, failure = %kind, "Process crashed: {}", reason);
        self.publish(ProcessEvent::Crashed {
            process_id: id.to_string(),
            reason,
        });
        Ok(true)
    }

    /// Graceful stop with bounded escalation. Idempotent for stopped processes.
    ///
    /// SIGTERM, wait up to the graceful timeout, then a forced kill through the
    /// reaper, wait up to the kill timeout. Signals are only sent while the
    /// recorded start ticks still match the live PID.
    pub async fn stop(&self, id: &str) -> SupervisorResult<SupervisedProcess> {
        let (pid, start_ticks, mut exit_rx, kill_tx) = {
            let mut table = self.table.lock().await;
            let entry = table
                .get_mut(id)
                .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
            if entry.record.status == ProcessStatus::Stopped {
                return Ok(entry.record.clone());
            }
            entry.stdin = None;
            (
                entry.record.pid,
                entry.record.start_ticks,
                entry.exit_rx.clone(),
                entry.kill_tx.clone(),
            )
        };

        let already_exited = exit_rx.borrow().is_some();
        if !already_exited {
            if let Some(pid) = pid {
                self.terminate(id, pid, start_ticks, &mut exit_rx, kill_tx)
                    .await;
            }
        }

        let mut table = self.table.lock().await;
        let entry = table
            .get_mut(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        if entry.record.status != ProcessStatus::Stopped {
            entry.record.status = ProcessStatus::Stopped;
            entry.record.stopped_at = Some(Utc::now());
            if let Some(exit) = *entry.exit_rx.borrow() {
                entry.record.exit_code = exit.code;
            }
            info!(process_id = %id, "Process stopped");
            self.publish(ProcessEvent::Stopped {
                process_id: id.to_string(),
            });
        }
        Ok(entry.record.clone())
    }

    async fn terminate(
        &self,
        id: &str,
        pid: u32,
        start_ticks: Option<u64>,
        exit_rx: &mut watch::Receiver<Option<ExitInfo>>,
        kill_tx: Option<mpsc::Sender<()>>,
    ) {
        let limits = &self.settings.stop;

        if pid_matches(pid, start_ticks) {
            send_terminate(id, pid);
        } else {
            warn!(process_id = %id, pid, "PID no longer matches recorded start ticks; not signalling");
        }

        if wait_for_exit(exit_rx, limits.graceful_timeout()).await {
            return;
        }

        warn!(
            process_id = %id,
            pid,
            timeout_ms = limits.graceful_timeout_ms,
            "Graceful stop timed out, forcing kill"
        );
        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.try_send(());
        }

        if !wait_for_exit(exit_rx, limits.kill_timeout()).await {
            error!(
                process_id = %id,
                pid,
                timeout_ms = limits.kill_timeout_ms,
                "Process did not exit after forced kill"
            );
        }
    }

    /// Stop then start again with the same request. The old record is removed.
    ///
    /// A child the old process left behind may still hold the port, so a
    /// port-bound server waits (bounded) until the port binds again.
    pub async fn restart(&self, id: &str) -> SupervisorResult<SupervisedProcess> {
        let request = {
            let table = self.table.lock().await;
            table
                .get(id)
                .map(|entry| entry.request.clone())
                .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?
        };
        self.stop(id).await?;
        self.remove(id).await?;
        if let BindTarget::Port(port) = request.bind_target {
            wait_port_free(port, self.settings.stop.port_free_timeout()).await;
        }
        self.start(request).await
    }

    /// Drop the record of a stopped or crashed process.
    pub async fn remove(&self, id: &str) -> SupervisorResult<SupervisedProcess> {
        let mut table = self.table.lock().await;
        let status = table
            .get(id)
            .map(|entry| entry.record.status)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        if status.is_live() {
            return Err(SupervisorError::InvalidRequest(format!(
                "process {} is still {}",
                id, status
            )));
        }
        table
            .remove(id)
            .map(|entry| entry.record)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    /// Stop every process that is not already stopped.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = {
            let table = self.table.lock().await;
            table
                .values()
                .filter(|entry| entry.record.status != ProcessStatus::Stopped)
                .map(|entry| entry.record.id.clone())
                .collect()
        };
        for id in ids {
            if let Err(err) = self.stop(&id).await {
                warn!(process_id = %id, "Stop during shutdown failed: {}", err);
            }
        }
    }

    /// Write `text` (newline-terminated) to an agent session's stdin.
    pub async fn write_input(&self, id: &str, text: &str, timeout: Duration) -> SupervisorResult<()> {
        let stdin = {
            let table = self.table.lock().await;
            let entry = table
                .get(id)
                .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
            if entry.record.kind != ProcessKind::AgentSession {
                return Err(SupervisorError::InvalidRequest(format!(
                    "process {} is not an agent session",
                    id
                )));
            }
            entry.stdin.clone().ok_or_else(|| {
                SupervisorError::InvalidRequest(format!("process {} has no open input", id))
            })?
        };

        let mut payload = text.to_string();
        if !payload.ends_with('\n') {
            payload.push('\n');
        }

        let write = async {
            let mut stdin = stdin.lock().await;
            stdin.write_all(payload.as_bytes()).await?;
            stdin.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => {
                debug!(process_id = %id, bytes = payload.len(), "Input written");
                Ok(())
            }
            Ok(Err(err)) => Err(SupervisorError::io("write session input", err)),
            Err(_) => Err(SupervisorError::io(
                "write session input",
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("write timed out after {}ms", timeout.as_millis()),
                ),
            )),
        }
    }

    pub async fn activity(&self, id: &str) -> SupervisorResult<SessionActivity> {
        Ok(self.output_since(id, u64::MAX).await?.activity)
    }

    /// Activity plus every retained line captured after the first `after`
    /// lines, read under one transcript lock.
    ///
    /// The exit is read first and only published once stdout drained, so an
    /// `exited` result already carries the session's final lines.
    pub async fn output_since(&self, id: &str, after: u64) -> SupervisorResult<SessionOutput> {
        let (transcript, exit) = {
            let table = self.table.lock().await;
            let entry = table
                .get(id)
                .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
            let exit = *entry.exit_rx.borrow();
            (entry.transcript.clone(), exit)
        };

        let mut output = SessionOutput {
            activity: SessionActivity {
                exited: exit.is_some(),
                exit_code: exit.and_then(|e| e.code),
                ..SessionActivity::default()
            },
            lines: Vec::new(),
        };
        if let Some(transcript) = transcript {
            let transcript = transcript.lock().await;
            output.activity.lines_captured = transcript.lines_captured;
            output.activity.first_output_at = transcript.first_output_at;
            output.activity.last_output_at = transcript.last_output_at;
            output.activity.output_closed = transcript.closed;
            let fresh = transcript.lines_captured.saturating_sub(after);
            let take = usize::try_from(fresh).unwrap_or(usize::MAX).min(transcript.lines.len());
            let skip = transcript.lines.len() - take;
            output.lines = transcript.lines.iter().skip(skip).cloned().collect();
        }
        Ok(output)
    }

    /// Last `limit` captured stdout lines of an agent session.
    pub async fn transcript(&self, id: &str, limit: usize) -> SupervisorResult<Vec<String>> {
        let transcript = {
            let table = self.table.lock().await;
            let entry = table
                .get(id)
                .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
            entry.transcript.clone()
        };
        let Some(transcript) = transcript else {
            return Ok(Vec::new());
        };
        let transcript = transcript.lock().await;
        let skip = transcript.lines.len().saturating_sub(limit);
        Ok(transcript.lines.iter().skip(skip).cloned().collect())
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.settings.logs_dir.join(format!("{}.log", id))
    }

    pub async fn exit_watch(&self, id: &str) -> SupervisorResult<watch::Receiver<Option<ExitInfo>>> {
        let table = self.table.lock().await;
        table
            .get(id)
            .map(|entry| entry.exit_rx.clone())
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    pub async fn get(&self, id: &str) -> Option<SupervisedProcess> {
        self.table.lock().await.get(id).map(|e| e.record.clone())
    }

    pub async fn list(&self) -> Vec<SupervisedProcess> {
        let table = self.table.lock().await;
        let mut records: Vec<SupervisedProcess> =
            table.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    /// Records plus the current exit state, for the health monitor.
    pub(crate) async fn observe(&self) -> Vec<(SupervisedProcess, Option<ExitInfo>)> {
        let table = self.table.lock().await;
        table
            .values()
            .map(|e| (e.record.clone(), *e.exit_rx.borrow()))
            .collect()
    }
}

fn validate_request(request: &StartRequest) -> SupervisorResult<()> {
    if request.name.trim().is_empty() {
        return Err(SupervisorError::InvalidRequest(
            "process name must not be empty".to_string(),
        ));
    }
    if request.command.program.trim().is_empty() {
        return Err(SupervisorError::InvalidRequest(
            "command program must not be empty".to_string(),
        ));
    }
    match (&request.kind, &request.bind_target) {
        (_, BindTarget::Port(port)) => {
            validate_port(u32::from(*port))?;
        }
        (ProcessKind::DevServer, BindTarget::Stdio) => {
            return Err(SupervisorError::InvalidRequest(
                "dev servers must bind a port or a socket".to_string(),
            ));
        }
        _ => {}
    }
    Ok(())
}

/// Poll until `127.0.0.1:<port>` binds or `limit` passes.
async fn wait_port_free(port: u16, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if LoopbackProbe.is_bindable(port) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(
                port,
                timeout_ms = limit.as_millis() as u64,
                "Port still in use after stop, starting anyway"
            );
            return false;
        }
        tokio::time::sleep(PORT_FREE_POLL).await;
    }
}

async fn wait_for_exit(exit_rx: &mut watch::Receiver<Option<ExitInfo>>, limit: Duration) -> bool {
    matches!(
        tokio::time::timeout(limit, exit_rx.wait_for(Option::is_some)).await,
        Ok(Ok(_))
    )
}

#[cfg(unix)]
fn send_terminate(id: &str, pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => debug!(process_id = %id, pid, "SIGTERM sent"),
        Err(err) => warn!(process_id = %id, pid, "SIGTERM failed: {}", err),
    }
}

#[cfg(not(unix))]
fn send_terminate(id: &str, pid: u32) {
    debug!(process_id = %id, pid, "No graceful signal on this platform");
}

/// Returns a watch that flips to true once stdout hit EOF.
fn spawn_transcript_reader(
    id: String,
    stdout: ChildStdout,
    transcript: Arc<Mutex<Transcript>>,
    capacity: usize,
) -> watch::Receiver<bool> {
    let (drained_tx, drained_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    // A partial trailing line at EOF still counts.
                    let line = clean_line(&buf);
                    let now = Utc::now();
                    let mut transcript = transcript.lock().await;
                    if transcript.first_output_at.is_none() {
                        transcript.first_output_at = Some(now);
                    }
                    transcript.last_output_at = Some(now);
                    transcript.lines_captured += 1;
                    transcript.lines.push_back(line);
                    while transcript.lines.len() > capacity.max(1) {
                        transcript.lines.pop_front();
                    }
                }
                Err(err) => {
                    debug!(process_id = %id, "Transcript reader stopped: {}", err);
                    break;
                }
            }
        }
        transcript.lock().await.closed = true;
        let _ = drained_tx.send(true);
        debug!(process_id = %id, "Transcript reader finished");
    });
    drained_rx
}

fn clean_line(raw: &[u8]) -> String {
    let trimmed = raw
        .strip_suffix(b"\n")
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
        .unwrap_or(raw);
    match strip_ansi_escapes::strip(trimmed) {
        Ok(clean) => String::from_utf8_lossy(&clean).into_owned(),
        Err(_) => String::from_utf8_lossy(trimmed).into_owned(),
    }
}
