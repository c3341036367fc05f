use devfleet_supervisor::{ErrorCategory, SupervisorError};
use thiserror::Error;

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

/// Errors returned synchronously by the task queue, delegation engine and
/// record store. Runtime failures of delegations are recorded on the records.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// E_VALIDATION - malformed input such as an empty task description
    #[error("validation failed: {0}")]
    Validation(String),

    /// E_CONFLICT - uniqueness or compare-and-set violation in the store
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("task {task_id} already has active delegation {delegation_id}")]
    ActiveDelegationExists {
        task_id: String,
        delegation_id: String,
    },

    #[error("{entity} {id} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("session error: {0}")]
    Session(String),

    #[error("store error: {0}")]
    Store(String),
}

impl OrchestrationError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        OrchestrationError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn transition(
        entity: &'static str,
        id: impl Into<String>,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        OrchestrationError::InvalidTransition {
            entity,
            id: id.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            OrchestrationError::Validation(_) => "E_VALIDATION",
            OrchestrationError::Conflict(_) => "E_CONFLICT",
            OrchestrationError::ActiveDelegationExists { .. } => "E_ACTIVE_DELEGATION_EXISTS",
            OrchestrationError::InvalidTransition { .. } => "E_INVALID_TRANSITION",
            OrchestrationError::NotFound { .. } => "E_NOT_FOUND",
            OrchestrationError::Session(_) => "E_SESSION",
            OrchestrationError::Store(_) => "E_STORE",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestrationError::Validation(_) => ErrorCategory::Validation,
            OrchestrationError::Conflict(_) => ErrorCategory::Conflict,
            OrchestrationError::ActiveDelegationExists { .. } => ErrorCategory::Conflict,
            OrchestrationError::InvalidTransition { .. } => ErrorCategory::State,
            OrchestrationError::NotFound { .. } => ErrorCategory::State,
            OrchestrationError::Session(_) => ErrorCategory::Operation,
            OrchestrationError::Store(_) => ErrorCategory::System,
        }
    }
}

impl From<SupervisorError> for OrchestrationError {
    fn from(err: SupervisorError) -> Self {
        OrchestrationError::Session(err.to_string())
    }
}
