//! Supervisor error types.
//!
//! Only input validation and contract violations are returned to callers.
//! Failures of supervised processes (startup failure, crash during run) are
//! recorded on the process record and published as events.

use std::io;

use thiserror::Error;

use crate::types::{ProcessStatus, Scope};

/// High-level classification shared by every error enum in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorCategory {
    /// Malformed input rejected synchronously
    Validation,
    /// Reservation or uniqueness clash
    Conflict,
    /// Record is in the wrong state for the requested operation
    State,
    /// A subprocess or session operation failed
    Operation,
    /// I/O and other system-level failures
    System,
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// E_PORT_CONFLICT - another scope in the chain holds the port
    #[error(
        "port {port} for {variable} in {scope} conflicts with {other_variable} in {other_scope}{}",
        suggested.map(|p| format!(" (try {})", p)).unwrap_or_else(|| " (no free port found)".to_string())
    )]
    Conflict {
        scope: Scope,
        variable: String,
        port: u16,
        other_scope: Scope,
        other_variable: String,
        suggested: Option<u16>,
    },

    /// E_INVALID_PORT
    #[error("invalid port {port}: must be within 1024..=65535")]
    InvalidPort { port: u32 },

    /// E_STARTUP_FAILURE - spawn failed or the child exited during confirmation
    #[error("process '{name}' failed to start: {reason}")]
    StartupFailure {
        process_id: String,
        name: String,
        reason: String,
    },

    #[error("process not found: {0}")]
    NotFound(String),

    #[error("process {process_id} cannot move from {from} to {to}")]
    InvalidTransition {
        process_id: String,
        from: ProcessStatus,
        to: ProcessStatus,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error in {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: io::Error,
    },
}

impl SupervisorError {
    pub fn io(operation: impl Into<String>, source: io::Error) -> Self {
        SupervisorError::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::Conflict { .. } => "E_PORT_CONFLICT",
            SupervisorError::InvalidPort { .. } => "E_INVALID_PORT",
            SupervisorError::StartupFailure { .. } => "E_STARTUP_FAILURE",
            SupervisorError::NotFound(_) => "E_NOT_FOUND",
            SupervisorError::InvalidTransition { .. } => "E_INVALID_TRANSITION",
            SupervisorError::InvalidRequest(_) => "E_INVALID_REQUEST",
            SupervisorError::Io { .. } => "E_IO",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            SupervisorError::Conflict { .. } => ErrorCategory::Conflict,
            SupervisorError::InvalidPort { .. } => ErrorCategory::Validation,
            SupervisorError::InvalidRequest(_) => ErrorCategory::Validation,
            SupervisorError::StartupFailure { .. } => ErrorCategory::Operation,
            SupervisorError::NotFound(_) => ErrorCategory::State,
            SupervisorError::InvalidTransition { .. } => ErrorCategory::State,
            SupervisorError::Io { .. } => ErrorCategory::System,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_mentions_suggestion() {
        let err = SupervisorError::Conflict {
            scope: Scope::folder("b"),
            variable: "PORT".into(),
            port: 3000,
            other_scope: Scope::folder("a"),
            other_variable: "PORT".into(),
            suggested: Some(3001),
        };
        let message = err.to_string();
        assert!(message.contains("folder:a"));
        assert!(message.contains("try 3001"));
        assert_eq!(err.category(), ErrorCategory::Conflict);
        assert_eq!(err.code(), "E_PORT_CONFLICT");
    }

    #[test]
    fn invalid_port_is_validation() {
        let err = SupervisorError::InvalidPort { port: 80 };
        assert_eq!(err.category(), ErrorCategory::Validation);
    }
}
