use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use devfleet_supervisor::FailureKind;

pub const MAX_DESCRIPTION_CHARS: usize = 16_000;
pub const DEFAULT_PRIORITY: u8 = 5;
pub const MAX_PRIORITY: u8 = 10;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Feature,
    Bug,
    Refactor,
    Test,
    Doc,
    Research,
    Review,
    Maintenance,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskType::Feature => "feature",
            TaskType::Bug => "bug",
            TaskType::Refactor => "refactor",
            TaskType::Test => "test",
            TaskType::Doc => "doc",
            TaskType::Research => "research",
            TaskType::Review => "review",
            TaskType::Maintenance => "maintenance",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "feature" => Ok(TaskType::Feature),
            "bug" => Ok(TaskType::Bug),
            "refactor" => Ok(TaskType::Refactor),
            "test" => Ok(TaskType::Test),
            "doc" | "docs" => Ok(TaskType::Doc),
            "research" => Ok(TaskType::Research),
            "review" => Ok(TaskType::Review),
            "maintenance" => Ok(TaskType::Maintenance),
            other => Err(format!("unknown task type '{}'", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Planning,
    Executing,
    Monitoring,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Queued, Planning)
                | (Planning, Executing)
                | (Executing, Monitoring)
                | (Monitoring, Completed)
                | (Planning, Failed)
                | (Executing, Failed)
                | (Monitoring, Failed)
                | (_, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Planning => "planning",
            TaskStatus::Executing => "executing",
            TaskStatus::Monitoring => "monitoring",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Link to an issue in an external tracker.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalIssueRef {
    pub provider: String,
    pub repo: String,
    pub number: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl ExternalIssueRef {
    pub fn render(&self) -> String {
        let mut out = format!("{} {}#{}", self.provider, self.repo, self.number);
        if let Some(title) = &self.title {
            out.push_str(": ");
            out.push_str(title);
        }
        if let Some(url) = &self.url {
            out.push('\n');
            out.push_str(url);
        }
        if let Some(body) = self.body.as_deref().filter(|b| !b.trim().is_empty()) {
            out.push_str("\n\n");
            out.push_str(body.trim());
        }
        out
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    pub kind: FailureKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub orchestrator_id: String,
    #[serde(default)]
    pub folder_scope: Option<String>,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub confidence: f64,
    pub priority: u8,
    #[serde(default)]
    pub assigned_agent: Option<AgentProviderKind>,
    #[serde(default)]
    pub delegation_id: Option<String>,
    #[serde(default)]
    pub external_issue_ref: Option<ExternalIssueRef>,
    #[serde(default)]
    pub result_summary: Option<String>,
    #[serde(default)]
    pub error_info: Option<ErrorInfo>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewTask {
    pub orchestrator_id: String,
    #[serde(default)]
    pub folder_scope: Option<String>,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub external_issue_ref: Option<ExternalIssueRef>,
}

fn default_confidence() -> f64 {
    1.0
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub orchestrator_id: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub folder_scope: Option<String>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.orchestrator_id
            .as_ref()
            .map_or(true, |id| &task.orchestrator_id == id)
            && self.status.map_or(true, |status| task.status == status)
            && self
                .folder_scope
                .as_ref()
                .map_or(true, |scope| task.folder_scope.as_ref() == Some(scope))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AgentProviderKind {
    Claude,
    Codex,
    Gemini,
    #[serde(rename = "opencode")]
    OpenCode,
}

impl AgentProviderKind {
    pub const ALL: [AgentProviderKind; 4] = [
        AgentProviderKind::Claude,
        AgentProviderKind::Codex,
        AgentProviderKind::Gemini,
        AgentProviderKind::OpenCode,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentProviderKind::Claude => "claude",
            AgentProviderKind::Codex => "codex",
            AgentProviderKind::Gemini => "gemini",
            AgentProviderKind::OpenCode => "opencode",
        }
    }
}

impl fmt::Display for AgentProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentProviderKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim().to_ascii_lowercase();
        AgentProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == raw)
            .ok_or_else(|| format!("unknown agent provider '{}'", raw))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Spawning,
    InjectingContext,
    Running,
    Monitoring,
    Completed,
    Failed,
}

impl DelegationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DelegationStatus::Completed | DelegationStatus::Failed)
    }

    pub fn can_transition_to(self, next: DelegationStatus) -> bool {
        use DelegationStatus::*;
        matches!(
            (self, next),
            (Spawning, InjectingContext)
                | (InjectingContext, Running)
                | (Running, Monitoring)
                | (Monitoring, Completed)
                | (Spawning, Failed)
                | (InjectingContext, Failed)
                | (Running, Failed)
                | (Monitoring, Failed)
        )
    }
}

impl fmt::Display for DelegationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DelegationStatus::Spawning => "spawning",
            DelegationStatus::InjectingContext => "injecting_context",
            DelegationStatus::Running => "running",
            DelegationStatus::Monitoring => "monitoring",
            DelegationStatus::Completed => "completed",
            DelegationStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Delegation {
    pub id: String,
    pub task_id: String,
    /// Empty until a session has been acquired.
    pub session_id: String,
    pub status: DelegationStatus,
    pub agent_provider: AgentProviderKind,
    pub injected_context: String,
    /// Ordered, append-only.
    pub execution_log: Vec<ExecutionLogEntry>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub transcript_ref: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub first_output_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Open `stall_detected` insight of the current stall episode.
    #[serde(default)]
    pub stall_insight_id: Option<String>,
    #[serde(default)]
    pub reprompt_count: u32,
    /// Session lines captured before this delegation started (reused sessions).
    #[serde(default)]
    pub output_baseline: u64,
    /// Lines seen since the baseline.
    #[serde(default)]
    pub lines_seen: u64,
}

impl Delegation {
    pub fn log(&mut self, at: DateTime<Utc>, message: impl Into<String>) {
        self.execution_log.push(ExecutionLogEntry {
            at,
            message: message.into(),
        });
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "folder", rename_all = "snake_case")]
pub enum OrchestratorScope {
    Master,
    Folder(String),
}

impl fmt::Display for OrchestratorScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorScope::Master => f.write_str("master"),
            OrchestratorScope::Folder(name) => write!(f, "folder:{}", name),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStatus {
    Idle,
    Analyzing,
    Acting,
    Paused,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Orchestrator {
    pub id: String,
    pub user_id: String,
    pub scope: OrchestratorScope,
    pub status: OrchestratorStatus,
    pub monitoring_interval_sec: u64,
    pub stall_threshold_sec: u64,
    pub auto_intervention: bool,
    pub created_at: DateTime<Utc>,
}

/// Partial update of an orchestrator's monitoring policy.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OrchestratorPolicy {
    #[serde(default)]
    pub monitoring_interval_sec: Option<u64>,
    #[serde(default)]
    pub stall_threshold_sec: Option<u64>,
    #[serde(default)]
    pub auto_intervention: Option<bool>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    StallDetected,
    SessionCrashed,
    DelegationFailed,
    AutoIntervention,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub orchestrator_id: String,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub delegation_id: Option<String>,
    pub kind: InsightKind,
    pub severity: Severity,
    pub title: String,
    pub detail: String,
    pub resolved: bool,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    #[serde(default)]
    pub orchestrator_id: Option<String>,
    pub action: String,
    pub actor: String,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub delegation_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_machine() {
        use TaskStatus::*;
        assert!(Queued.can_transition_to(Planning));
        assert!(Planning.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Monitoring));
        assert!(Monitoring.can_transition_to(Completed));
        assert!(Executing.can_transition_to(Cancelled));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(!Queued.can_transition_to(Executing));
        assert!(!Executing.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Cancelled));
    }

    #[test]
    fn delegation_state_machine() {
        use DelegationStatus::*;
        assert!(Spawning.can_transition_to(InjectingContext));
        assert!(Running.can_transition_to(Monitoring));
        assert!(Spawning.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(Completed.is_terminal());
    }

    #[test]
    fn provider_names_round_trip() {
        for kind in AgentProviderKind::ALL {
            assert_eq!(kind.as_str().parse::<AgentProviderKind>().unwrap(), kind);
        }
        assert_eq!(
            serde_json::to_value(AgentProviderKind::OpenCode).unwrap(),
            "opencode"
        );
    }

    #[test]
    fn issue_rendering() {
        let issue = ExternalIssueRef {
            provider: "github".into(),
            repo: "acme/web".into(),
            number: 42,
            title: Some("Login fails".into()),
            url: None,
            body: Some("  Steps to reproduce  ".into()),
        };
        assert_eq!(
            issue.render(),
            "github acme/web#42: Login fails\n\nSteps to reproduce"
        );
    }
}
