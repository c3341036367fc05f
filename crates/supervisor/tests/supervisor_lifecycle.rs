#![cfg(unix)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use devfleet_common::limits::StopLimits;
use devfleet_supervisor::{
    BindTarget, CommandSpec, FailureKind, HealthMonitor, HealthProbe, HealthSettings,
    ProbeOutcome, ProcessEvent, ProcessKind, ProcessStatus, ProcessSupervisor, Scope,
    StartRequest, SupervisorError, SupervisorSettings,
};
use tempfile::TempDir;

/// Replays queued outcomes, then reports unhealthy forever.
struct ScriptedProbe {
    outcomes: StdMutex<VecDeque<ProbeOutcome>>,
}

impl ScriptedProbe {
    fn new(outcomes: Vec<ProbeOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: StdMutex::new(outcomes.into()),
        })
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, _target: &BindTarget, _timeout: Duration) -> ProbeOutcome {
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ProbeOutcome::Unhealthy("connection refused".into()))
    }
}

fn ok() -> ProbeOutcome {
    ProbeOutcome::Healthy
}

fn fail() -> ProbeOutcome {
    ProbeOutcome::Unhealthy("HTTP 503".into())
}

fn supervisor(temp: &TempDir) -> ProcessSupervisor {
    let mut settings = SupervisorSettings::new(temp.path().join("logs"));
    settings.stop = StopLimits {
        graceful_timeout_ms: 2_000,
        kill_timeout_ms: 2_000,
        spawn_confirm_ms: 200,
        port_free_timeout_ms: 2_000,
    };
    ProcessSupervisor::new(settings)
}

fn sh(script: &str) -> CommandSpec {
    CommandSpec::new("sh").arg("-c").arg(script)
}

fn dev_server(script: &str, deadline: Option<Duration>) -> StartRequest {
    StartRequest {
        name: "web".into(),
        kind: ProcessKind::DevServer,
        bind_target: BindTarget::Port(39_123),
        command: sh(script),
        working_dir: None,
        scope: Scope::folder("web"),
        startup_deadline: deadline,
    }
}

fn agent(script: &str) -> StartRequest {
    StartRequest {
        name: "agent".into(),
        kind: ProcessKind::AgentSession,
        bind_target: BindTarget::Stdio,
        command: sh(script),
        working_dir: None,
        scope: Scope::Global,
        startup_deadline: None,
    }
}

fn monitor(supervisor: &ProcessSupervisor, probe: Arc<ScriptedProbe>) -> HealthMonitor {
    HealthMonitor::new(
        supervisor.clone(),
        probe,
        HealthSettings {
            poll_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(100),
            failure_threshold: 3,
        },
    )
}

#[tokio::test]
async fn start_records_pid_and_stop_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let supervisor = supervisor(&temp);
    let mut events = supervisor.subscribe();

    let process = supervisor
        .start(dev_server("echo \"port=$PORT id=$DEVFLEET_PROCESS_ID\"; exec sleep 30", None))
        .await
        .unwrap();
    assert_eq!(process.status, ProcessStatus::Starting);
    assert!(process.pid.is_some());
    assert!(process.start_ticks.is_some());

    match events.recv().await.unwrap() {
        ProcessEvent::Started { process_id, pid } => {
            assert_eq!(process_id, process.id);
            assert_eq!(Some(pid), process.pid);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let log = std::fs::read_to_string(supervisor.log_path(&process.id)).unwrap();
    assert!(log.contains("port=39123"));
    assert!(log.contains(&format!("id={}", process.id)));

    let stopped = supervisor.stop(&process.id).await.unwrap();
    assert_eq!(stopped.status, ProcessStatus::Stopped);
    assert!(stopped.stopped_at.is_some());
    let again = supervisor.stop(&process.id).await.unwrap();
    assert_eq!(again.stopped_at, stopped.stopped_at);
}

#[tokio::test]
async fn immediate_exit_is_a_startup_failure() {
    let temp = TempDir::new().unwrap();
    let supervisor = supervisor(&temp);

    let err = supervisor.start(dev_server("exit 3", None)).await.unwrap_err();
    let process_id = match err {
        SupervisorError::StartupFailure { process_id, reason, .. } => {
            assert!(reason.contains("code 3"), "reason: {}", reason);
            process_id
        }
        other => panic!("unexpected {:?}", other),
    };

    let record = supervisor.get(&process_id).await.unwrap();
    assert_eq!(record.status, ProcessStatus::Crashed);
    assert_eq!(record.failure, Some(FailureKind::StartupFailure));
    assert_eq!(record.exit_code, Some(3));
}

#[tokio::test]
async fn missing_binary_is_a_startup_failure() {
    let temp = TempDir::new().unwrap();
    let supervisor = supervisor(&temp);
    let mut request = dev_server("", None);
    request.command = CommandSpec::new("/nonexistent/devfleet-binary");

    assert!(matches!(
        supervisor.start(request).await,
        Err(SupervisorError::StartupFailure { .. })
    ));
}

#[tokio::test]
async fn silent_server_crashes_once_after_startup_deadline() {
    let temp = TempDir::new().unwrap();
    let supervisor = supervisor(&temp);
    let process = supervisor
        .start(dev_server("exec sleep 30", Some(Duration::from_secs(1))))
        .await
        .unwrap();
    let mut events = supervisor.subscribe();
    let health = monitor(&supervisor, ScriptedProbe::new(vec![]));

    health.poll_at(Utc::now()).await;
    assert_eq!(
        supervisor.get(&process.id).await.unwrap().status,
        ProcessStatus::Starting
    );

    let late = Utc::now() + chrono::Duration::seconds(5);
    health.poll_at(late).await;
    health.poll_at(late + chrono::Duration::seconds(5)).await;
    health.poll_at(late + chrono::Duration::seconds(10)).await;

    let record = supervisor.get(&process.id).await.unwrap();
    assert_eq!(record.status, ProcessStatus::Crashed);
    assert_eq!(record.failure, Some(FailureKind::StartupFailure));

    let mut crashed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ProcessEvent::Crashed { .. }) {
            crashed += 1;
        }
    }
    assert_eq!(crashed, 1);
    assert!(health.record(&process.id).await.unwrap().crashed_at.is_some());

    supervisor.stop(&process.id).await.unwrap();
}

#[tokio::test]
async fn threshold_counts_consecutive_failures_only() {
    let temp = TempDir::new().unwrap();
    let supervisor = supervisor(&temp);
    let process = supervisor
        .start(dev_server("exec sleep 30", None))
        .await
        .unwrap();
    let probe = ScriptedProbe::new(vec![fail(), ok(), fail(), fail(), ok(), fail(), fail(), fail()]);
    let health = monitor(&supervisor, probe);

    health.poll_once().await;
    let status = |s: &ProcessSupervisor| {
        let s = s.clone();
        let id = process.id.clone();
        async move { s.get(&id).await.unwrap().status }
    };
    assert_eq!(status(&supervisor).await, ProcessStatus::Starting);
    assert_eq!(health.record(&process.id).await.unwrap().consecutive_failures, 1);

    health.poll_once().await;
    assert_eq!(status(&supervisor).await, ProcessStatus::Running);
    assert_eq!(health.record(&process.id).await.unwrap().consecutive_failures, 0);

    health.poll_once().await;
    health.poll_once().await;
    health.poll_once().await; // success resets
    assert_eq!(status(&supervisor).await, ProcessStatus::Running);

    health.poll_once().await;
    health.poll_once().await;
    assert_eq!(status(&supervisor).await, ProcessStatus::Running);
    health.poll_once().await;
    let record = supervisor.get(&process.id).await.unwrap();
    assert_eq!(record.status, ProcessStatus::Crashed);
    assert_eq!(record.failure, Some(FailureKind::CrashDuringRun));

    supervisor.stop(&process.id).await.unwrap();
}

#[tokio::test]
async fn stop_escalates_when_term_is_ignored() {
    let temp = TempDir::new().unwrap();
    let mut settings = SupervisorSettings::new(temp.path().join("logs"));
    settings.stop = StopLimits {
        graceful_timeout_ms: 300,
        kill_timeout_ms: 2_000,
        spawn_confirm_ms: 100,
        port_free_timeout_ms: 2_000,
    };
    let supervisor = ProcessSupervisor::new(settings);

    let process = supervisor
        .start(dev_server("trap '' TERM; exec sleep 30", None))
        .await
        .unwrap();
    let pid = process.pid.unwrap();

    let started = std::time::Instant::now();
    let stopped = supervisor.stop(&process.id).await.unwrap();
    assert_eq!(stopped.status, ProcessStatus::Stopped);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(!devfleet_common::process_utils::pid_matches(pid, process.start_ticks));
}

#[tokio::test]
async fn agent_session_captures_output_and_input() {
    let temp = TempDir::new().unwrap();
    let supervisor = supervisor(&temp);
    let session = supervisor
        .start(agent("read line; echo \"got $line\"; exec sleep 30"))
        .await
        .unwrap();

    let before = supervisor.activity(&session.id).await.unwrap();
    assert_eq!(before.lines_captured, 0);
    assert!(before.first_output_at.is_none());

    supervisor
        .write_input(&session.id, "hello", Duration::from_secs(1))
        .await
        .unwrap();

    let mut captured = false;
    for _ in 0..50 {
        if supervisor.activity(&session.id).await.unwrap().lines_captured > 0 {
            captured = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(captured, "agent output never captured");
    let transcript = supervisor.transcript(&session.id, 10).await.unwrap();
    assert_eq!(transcript, vec!["got hello".to_string()]);

    supervisor.stop(&session.id).await.unwrap();
    assert!(supervisor
        .write_input(&session.id, "late", Duration::from_millis(100))
        .await
        .is_err());
}

#[tokio::test]
async fn exited_agent_session_is_marked_crashed() {
    let temp = TempDir::new().unwrap();
    let supervisor = supervisor(&temp);
    let session = supervisor
        .start(agent("read line; exit 4"))
        .await
        .unwrap();
    let health = monitor(&supervisor, ScriptedProbe::new(vec![]));

    health.poll_once().await;
    assert_eq!(
        supervisor.get(&session.id).await.unwrap().status,
        ProcessStatus::Running
    );

    supervisor
        .write_input(&session.id, "go", Duration::from_secs(1))
        .await
        .unwrap();
    let mut exit_rx = supervisor.exit_watch(&session.id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), exit_rx.wait_for(Option::is_some))
        .await
        .unwrap()
        .unwrap();

    health.poll_once().await;
    let record = supervisor.get(&session.id).await.unwrap();
    assert_eq!(record.status, ProcessStatus::Crashed);
    assert_eq!(record.failure, Some(FailureKind::CrashDuringRun));
    assert_eq!(record.crashed_reason.as_deref(), Some("exited with code 4"));
}

#[tokio::test]
async fn restart_replaces_the_record() {
    let temp = TempDir::new().unwrap();
    let supervisor = supervisor(&temp);
    let first = supervisor
        .start(dev_server("exec sleep 30", None))
        .await
        .unwrap();

    let second = supervisor.restart(&first.id).await.unwrap();
    assert_ne!(first.id, second.id);
    assert_ne!(first.pid, second.pid);
    assert!(supervisor.get(&first.id).await.is_none());
    assert_eq!(supervisor.list().await.len(), 1);

    supervisor.shutdown_all().await;
    assert_eq!(
        supervisor.get(&second.id).await.unwrap().status,
        ProcessStatus::Stopped
    );
}

#[tokio::test]
async fn restart_waits_for_the_port_to_free_up() {
    let temp = TempDir::new().unwrap();
    let supervisor = supervisor(&temp);
    // Stands in for a child that outlived the server and still listens.
    let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = holder.local_addr().unwrap().port();
    let mut request = dev_server("exec sleep 30", None);
    request.bind_target = BindTarget::Port(port);
    let first = supervisor.start(request).await.unwrap();

    let restarting = {
        let supervisor = supervisor.clone();
        let id = first.id.clone();
        tokio::spawn(async move { supervisor.restart(&id).await })
    };
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!restarting.is_finished(), "restart did not wait for the port");
    let released_at = Utc::now();
    drop(holder);

    let second = tokio::time::timeout(Duration::from_secs(5), restarting)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(second.created_at >= released_at);
    assert_eq!(second.bind_target, BindTarget::Port(port));
    assert!(supervisor.get(&first.id).await.is_none());

    supervisor.shutdown_all().await;
}

#[tokio::test]
async fn restart_gives_up_waiting_for_a_held_port() {
    let temp = TempDir::new().unwrap();
    let mut settings = SupervisorSettings::new(temp.path().join("logs"));
    settings.stop = StopLimits {
        graceful_timeout_ms: 2_000,
        kill_timeout_ms: 2_000,
        spawn_confirm_ms: 100,
        port_free_timeout_ms: 300,
    };
    let supervisor = ProcessSupervisor::new(settings);
    let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = holder.local_addr().unwrap().port();
    let mut request = dev_server("exec sleep 30", None);
    request.bind_target = BindTarget::Port(port);
    let first = supervisor.start(request).await.unwrap();

    let started = std::time::Instant::now();
    let second = supervisor.restart(&first.id).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(second.status, ProcessStatus::Starting);

    supervisor.shutdown_all().await;
    drop(holder);
}

#[tokio::test]
async fn agent_session_exiting_cleanly_is_not_a_crash() {
    let temp = TempDir::new().unwrap();
    let supervisor = supervisor(&temp);
    let session = supervisor
        .start(agent("read line; echo \"done $line\""))
        .await
        .unwrap();
    let health = monitor(&supervisor, ScriptedProbe::new(vec![]));
    health.poll_once().await;
    assert!(health.record(&session.id).await.is_some());

    supervisor
        .write_input(&session.id, "task", Duration::from_secs(1))
        .await
        .unwrap();
    let mut exit_rx = supervisor.exit_watch(&session.id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), exit_rx.wait_for(Option::is_some))
        .await
        .unwrap()
        .unwrap();

    health.poll_once().await;
    health.poll_once().await;
    let record = supervisor.get(&session.id).await.unwrap();
    assert_eq!(record.status, ProcessStatus::Running);
    assert_eq!(record.failure, None);
    assert!(record.crashed_reason.is_none());
    let health_record = health.record(&session.id).await.unwrap();
    assert!(!health_record.is_healthy);
    assert!(health_record.crashed_at.is_none());

    // The owner's explicit stop ends it.
    let stopped = supervisor.stop(&session.id).await.unwrap();
    assert_eq!(stopped.status, ProcessStatus::Stopped);
    assert_eq!(stopped.exit_code, Some(0));
    assert_eq!(stopped.failure, None);
}

#[tokio::test]
async fn exit_is_published_after_the_last_output_line() {
    let temp = TempDir::new().unwrap();
    let supervisor = supervisor(&temp);
    let session = supervisor
        .start(agent("read line; printf 'one\\ntwo\\nSUMMARY: ok'; exit 3"))
        .await
        .unwrap();
    supervisor
        .write_input(&session.id, "go", Duration::from_secs(1))
        .await
        .unwrap();
    let mut exit_rx = supervisor.exit_watch(&session.id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), exit_rx.wait_for(Option::is_some))
        .await
        .unwrap()
        .unwrap();

    let output = supervisor.output_since(&session.id, 0).await.unwrap();
    assert!(output.activity.exited);
    assert!(output.activity.output_closed);
    assert_eq!(output.activity.exit_code, Some(3));
    assert_eq!(output.activity.lines_captured, 3);
    assert_eq!(output.lines, vec!["one", "two", "SUMMARY: ok"]);

    let tail = supervisor.output_since(&session.id, 2).await.unwrap();
    assert_eq!(tail.lines, vec!["SUMMARY: ok"]);
    assert!(supervisor
        .output_since(&session.id, 3)
        .await
        .unwrap()
        .lines
        .is_empty());
}
