use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ThreadPhase;

/// Broad error kind used to decide how a failure is surfaced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorKind {
    /// Malformed or empty input. Never retried.
    Validation,
    /// Operation is not valid in the current session state.
    Precondition,
    /// Transport or backend failure reported by the chat service.
    Service,
}

/// Stable error payload returned by commands and emitted with command outcomes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{kind:?}:{code}: {message}")]
pub struct SyncError {
    /// High-level error kind.
    pub kind: SyncErrorKind,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl SyncError {
    /// Construct a new error.
    pub fn new(kind: SyncErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Validation, code, message)
    }

    pub fn precondition(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Precondition, code, message)
    }

    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(SyncErrorKind::Service, code, message)
    }

    /// The client has no live connection to the chat service.
    pub fn not_connected(action: &str) -> Self {
        Self::service(
            "not_connected",
            format!("cannot run '{action}' before the client is connected"),
        )
    }

    /// No thread is active, or the caller's handle refers to a stale thread.
    pub fn no_active_thread(action: &str) -> Self {
        Self::precondition(
            "no_active_thread",
            format!("cannot run '{action}' without an active thread"),
        )
    }

    /// A create/delete thread request is still pending.
    pub fn thread_operation_in_flight(phase: ThreadPhase, action: &str) -> Self {
        Self::precondition(
            "thread_operation_in_flight",
            format!("cannot run '{action}' while thread is in phase {phase:?}"),
        )
    }

    /// The service could not find the addressed resource.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::service("not_found", message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == SyncErrorKind::Service && self.code == "not_found"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_in_flight_error_code_stable() {
        let err = SyncError::thread_operation_in_flight(ThreadPhase::Creating, "delete_thread");
        assert_eq!(err.code, "thread_operation_in_flight");
        assert_eq!(err.kind, SyncErrorKind::Precondition);
        assert!(err.message.contains("Creating"));
    }

    #[test]
    fn not_connected_is_a_service_error() {
        let err = SyncError::not_connected("create_thread");
        assert_eq!(err.kind, SyncErrorKind::Service);
        assert_eq!(err.code, "not_connected");
    }

    #[test]
    fn recognizes_not_found_only_for_service_errors() {
        assert!(SyncError::not_found("participant gone").is_not_found());
        assert!(!SyncError::precondition("not_found", "local").is_not_found());
    }

    #[test]
    fn display_includes_kind_and_code() {
        let err = SyncError::validation("empty_content", "message content is empty");
        assert_eq!(
            err.to_string(),
            "Validation:empty_content: message content is empty"
        );
    }
}
