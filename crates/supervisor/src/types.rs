use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Configuration scope of a port/socket reservation or a supervised process.
///
/// Every folder inherits from `Global`, so folders are siblings of each other.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Scope {
    Global,
    Folder(String),
}

impl Scope {
    pub fn folder(name: impl Into<String>) -> Self {
        Scope::Folder(name.into())
    }

    /// Inheritance chain, most specific first.
    pub fn chain(&self) -> Vec<Scope> {
        match self {
            Scope::Global => vec![Scope::Global],
            Scope::Folder(_) => vec![self.clone(), Scope::Global],
        }
    }

    /// Filesystem-safe identifier used for socket paths.
    pub fn slug(&self) -> String {
        match self {
            Scope::Global => "global".to_string(),
            Scope::Folder(name) => {
                let cleaned: String = name
                    .chars()
                    .map(|c| {
                        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                            c.to_ascii_lowercase()
                        } else {
                            '-'
                        }
                    })
                    .collect();
                format!("folder-{}", cleaned.trim_matches('-'))
            }
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Folder(name) => write!(f, "folder:{}", name),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    DevServer,
    AgentSession,
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessKind::DevServer => write!(f, "dev-server"),
            ProcessKind::AgentSession => write!(f, "agent-session"),
        }
    }
}

/// What the process listens on. Agent sessions talk over their stdio pipes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum BindTarget {
    Port(u16),
    Socket(PathBuf),
    Stdio,
}

impl fmt::Display for BindTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindTarget::Port(port) => write!(f, "port {}", port),
            BindTarget::Socket(path) => write!(f, "socket {}", path.display()),
            BindTarget::Stdio => write!(f, "stdio"),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Crashed,
    Stopped,
}

impl ProcessStatus {
    /// `starting → running → crashed`, plus `stopped` from anywhere.
    pub fn can_transition_to(self, next: ProcessStatus) -> bool {
        use ProcessStatus::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Crashed)
                | (Running, Crashed)
                | (Starting, Stopped)
                | (Running, Stopped)
                | (Crashed, Stopped)
        )
    }

    pub fn is_live(self) -> bool {
        matches!(self, ProcessStatus::Starting | ProcessStatus::Running)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Crashed => "crashed",
            ProcessStatus::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Failure taxonomy recorded on supervised processes and delegations.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    StartupFailure,
    CrashDuringRun,
    DelegationFailure,
    StallTimeout,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::StartupFailure => "startup_failure",
            FailureKind::CrashDuringRun => "crash_during_run",
            FailureKind::DelegationFailure => "delegation_failure",
            FailureKind::StallTimeout => "stall_timeout",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Program, arguments and environment overlay for a spawn.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Shell-ish rendering for logs; never executed.
    pub fn display_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartRequest {
    pub name: String,
    pub kind: ProcessKind,
    pub bind_target: BindTarget,
    pub command: CommandSpec,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    pub scope: Scope,
    #[serde(default, with = "opt_duration_ms")]
    pub startup_deadline: Option<Duration>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SupervisedProcess {
    pub id: String,
    pub name: String,
    pub kind: ProcessKind,
    pub bind_target: BindTarget,
    pub pid: Option<u32>,
    /// Start time in clock ticks, read at spawn. Signals are refused when the
    /// live PID reports a different value.
    pub start_ticks: Option<u64>,
    pub status: ProcessStatus,
    pub created_at: DateTime<Utc>,
    pub startup_deadline: DateTime<Utc>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    pub scope: Scope,
    #[serde(default)]
    pub failure: Option<FailureKind>,
    #[serde(default)]
    pub crashed_reason: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
}

/// One-to-one with a supervised process, mutated only by the health monitor.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HealthRecord {
    pub process_id: String,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub crashed_at: Option<DateTime<Utc>>,
    pub crash_reason: Option<String>,
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
}

impl HealthRecord {
    pub fn new(process_id: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            is_healthy: false,
            consecutive_failures: 0,
            last_checked_at: None,
            crashed_at: None,
            crash_reason: None,
            cpu_percent: None,
            memory_mb: None,
        }
    }
}

/// Output activity of an agent session.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionActivity {
    pub lines_captured: u64,
    pub first_output_at: Option<DateTime<Utc>>,
    pub last_output_at: Option<DateTime<Utc>>,
    pub exited: bool,
    pub exit_code: Option<i32>,
    /// stdout reached EOF; every line the session wrote is captured.
    #[serde(default)]
    pub output_closed: bool,
}

/// Session activity and the lines captured after a known count, read
/// together so the two never disagree.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionOutput {
    pub activity: SessionActivity,
    pub lines: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProcessEvent {
    Started { process_id: String, pid: u32 },
    Running { process_id: String },
    Crashed { process_id: String, reason: String },
    Stopped { process_id: String },
}

impl ProcessEvent {
    pub fn process_id(&self) -> &str {
        match self {
            ProcessEvent::Started { process_id, .. }
            | ProcessEvent::Running { process_id }
            | ProcessEvent::Crashed { process_id, .. }
            | ProcessEvent::Stopped { process_id } => process_id,
        }
    }
}

/// Environment and port reservations resolved for one folder.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FolderPreferences {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
}

/// Serialized fleet view written to `processes.json`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub written_at: Option<DateTime<Utc>>,
    pub processes: Vec<SupervisedProcess>,
    pub health: Vec<HealthRecord>,
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_chain_ends_at_global() {
        let scope = Scope::folder("web");
        assert_eq!(scope.chain(), vec![Scope::folder("web"), Scope::Global]);
        assert_eq!(Scope::Global.chain(), vec![Scope::Global]);
    }

    #[test]
    fn slug_is_filesystem_safe() {
        assert_eq!(Scope::folder("My App/v2").slug(), "folder-my-app-v2");
        assert_eq!(Scope::Global.slug(), "global");
    }

    #[test]
    fn status_transitions() {
        use ProcessStatus::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Crashed));
        assert!(Running.can_transition_to(Crashed));
        assert!(Crashed.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Crashed.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Stopped));
    }

    #[test]
    fn start_request_deadline_serializes_as_millis() {
        let request = StartRequest {
            name: "web".into(),
            kind: ProcessKind::DevServer,
            bind_target: BindTarget::Port(3000),
            command: CommandSpec::new("pnpm").arg("dev"),
            working_dir: None,
            scope: Scope::folder("web"),
            startup_deadline: Some(Duration::from_secs(2)),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["startup_deadline"], 2000);
        assert_eq!(value["bind_target"]["type"], "port");
        let back: StartRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back.startup_deadline, Some(Duration::from_secs(2)));
    }
}
