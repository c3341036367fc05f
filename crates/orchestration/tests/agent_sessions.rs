#![cfg(unix)]
//! SupervisorBroker with `sh` standing in for an agent CLI.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devfleet_common::config::{FolderSection, ProviderSection};
use devfleet_common::limits::StopLimits;
use devfleet_orchestration::{
    AgentProviderKind, ProviderRegistry, SecretSource, SessionBroker, SessionRequest,
    StaticFolders, SupervisorBroker,
};
use devfleet_supervisor::{ProcessStatus, ProcessSupervisor, SupervisorSettings};
use tempfile::TempDir;

struct FixedSecrets;

#[async_trait]
impl SecretSource for FixedSecrets {
    async fn secret(&self, name: &str) -> Option<String> {
        (name == "ANTHROPIC_API_KEY").then(|| "sk-test".to_string())
    }
}

/// Echoes every input line back until stdin closes.
const ECHO_AGENT: &str = r#"echo "key=$ANTHROPIC_API_KEY mode=$APP_MODE"; while read -r line; do echo "got: $line"; done"#;

fn broker(temp: &TempDir) -> (SupervisorBroker, ProcessSupervisor) {
    let mut settings = SupervisorSettings::new(temp.path().join("logs"));
    settings.stop = StopLimits {
        graceful_timeout_ms: 2_000,
        kill_timeout_ms: 2_000,
        spawn_confirm_ms: 200,
        port_free_timeout_ms: 2_000,
    };
    let supervisor = ProcessSupervisor::new(settings);

    let providers = ProviderRegistry::from_config(&BTreeMap::from([(
        "claude".to_string(),
        ProviderSection {
            program: Some("sh".into()),
            args: Some(vec!["-c".into(), ECHO_AGENT.into()]),
            env: BTreeMap::new(),
        },
    )]));
    let folders = StaticFolders::new(BTreeMap::from([(
        "web".to_string(),
        FolderSection {
            path: temp.path().to_path_buf(),
            env: BTreeMap::from([("APP_MODE".to_string(), "dev".to_string())]),
            ..FolderSection::default()
        },
    )]));

    let broker = SupervisorBroker::new(
        supervisor.clone(),
        providers,
        Arc::new(FixedSecrets),
        Arc::new(folders),
    );
    (broker, supervisor)
}

async fn wait_for_lines(broker: &SupervisorBroker, session_id: &str, lines: u64) {
    for _ in 0..100 {
        let output = broker.output_since(session_id, u64::MAX).await.unwrap();
        if output.activity.lines_captured >= lines {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("session {} never produced {} lines", session_id, lines);
}

fn request(task_id: &str) -> SessionRequest {
    SessionRequest {
        provider: AgentProviderKind::Claude,
        folder: Some("web".into()),
        task_id: task_id.into(),
    }
}

#[tokio::test]
async fn session_gets_credentials_env_and_input() {
    let temp = TempDir::new().unwrap();
    let (broker, supervisor) = broker(&temp);

    let handle = broker.acquire(request("task-one")).await.unwrap();
    assert!(!handle.reused);
    let process = supervisor.get(&handle.session_id).await.unwrap();
    assert_eq!(process.working_dir, Some(PathBuf::from(temp.path())));

    broker
        .write_input(&handle.session_id, "hello agent", Duration::from_secs(2))
        .await
        .unwrap();
    wait_for_lines(&broker, &handle.session_id, 2).await;

    let output = broker.output_since(&handle.session_id, 0).await.unwrap();
    assert_eq!(output.lines[0], "key=sk-test mode=dev");
    assert_eq!(output.lines[1], "got: hello agent");
    let tail = broker.output_since(&handle.session_id, 1).await.unwrap();
    assert_eq!(tail.lines, vec!["got: hello agent".to_string()]);
    assert_eq!(tail.activity.lines_captured, 2);

    broker.stop(&handle.session_id).await.unwrap();
    assert!(supervisor.get(&handle.session_id).await.is_none());
    // Stopping again is a no-op.
    broker.stop(&handle.session_id).await.unwrap();
}

#[tokio::test]
async fn finished_sessions_leave_no_supervisor_records() {
    let temp = TempDir::new().unwrap();
    let (broker, supervisor) = broker(&temp);

    let stopped = broker.acquire(request("task-one")).await.unwrap();
    let died = broker.acquire(request("task-two")).await.unwrap();
    assert_eq!(supervisor.list().await.len(), 2);

    broker.stop(&stopped.session_id).await.unwrap();
    let ids: Vec<_> = supervisor.list().await.into_iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![died.session_id.clone()]);

    // A session that ended behind the broker's back is dropped on release.
    let process = supervisor.stop(&died.session_id).await.unwrap();
    assert_eq!(process.status, ProcessStatus::Stopped);
    broker.release(&died.session_id).await;
    assert_eq!(broker.idle_count().await, 0);
    assert!(supervisor.list().await.is_empty());
}

#[tokio::test]
async fn released_session_is_reused_with_a_baseline() {
    let temp = TempDir::new().unwrap();
    let (broker, _supervisor) = broker(&temp);

    let first = broker.acquire(request("task-one")).await.unwrap();
    wait_for_lines(&broker, &first.session_id, 1).await;
    broker.release(&first.session_id).await;
    assert_eq!(broker.idle_count().await, 1);

    let second = broker.acquire(request("task-two")).await.unwrap();
    assert!(second.reused);
    assert_eq!(second.session_id, first.session_id);
    assert_eq!(second.baseline, 1);
    assert_eq!(broker.idle_count().await, 0);

    // A stopped session never goes back to the pool.
    broker.stop(&second.session_id).await.unwrap();
    broker.release(&second.session_id).await;
    assert_eq!(broker.idle_count().await, 0);

    let third = broker.acquire(request("task-three")).await.unwrap();
    assert!(!third.reused);
    broker.stop(&third.session_id).await.unwrap();
}
