//! Task queue, delegation engine and stall detection for devfleet.
//!
//! Tasks enter the [`queue::TaskQueue`] as `queued`, are handed to agent
//! sessions by the [`delegation::DelegationEngine`] and watched by the
//! [`monitor::DelegationMonitor`]. Every state change lands in the audit log.

pub mod audit;
pub mod collaborators;
pub mod delegation;
pub mod error;
pub mod journal;
pub mod monitor;
pub mod providers;
pub mod queue;
pub mod registry;
pub mod session;
pub mod store;
pub mod types;

pub use audit::{AuditLog, AuditRecord, NewInsight};
pub use collaborators::{
    EnvSecretSource, KnowledgeSource, PreferenceSource, ResolvedFolder, SecretSource,
    StaticFolders,
};
pub use delegation::{DelegationEngine, EngineSettings, Outcome, ORCHESTRATOR_ACTOR};
pub use error::{OrchestrationError, OrchestrationResult};
pub use journal::{Journal, JournalError, JournalVerifier};
pub use monitor::{parse_final_summary, DelegationMonitor, FinalSummary, MonitorSettings};
pub use providers::{AgentProvider, ProviderContext, ProviderRegistry};
pub use queue::TaskQueue;
pub use registry::{OrchestratorRegistry, PolicyDefaults};
pub use session::{SessionBroker, SessionHandle, SessionRequest, SupervisorBroker};
pub use store::{MemoryStore, RecordStore};
pub use types::*;
