//! Workspace error taxonomy.
//!
//! Local components surface these typed kinds rather than exceptions-as-flow.
//! The API layer maps kinds to HTTP status codes deterministically; the CLI
//! maps them to exit codes; the scheduler records them on execution rows.

use serde::{Deserialize, Serialize};

/// Workspace result alias.
pub type HiveResult<T> = std::result::Result<T, HiveError>;

/// Error kinds shared across the control plane.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HiveError {
    /// Malformed input: bad name, bad cron, unknown template, profile
    /// mismatch. Surfaced at the API boundary, never retried.
    #[error("validation: {0}")]
    Validation(String),

    /// Referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller lacks access, or an agent-scoped caller lacks the edge.
    #[error("permission denied: {caller} -> {target}")]
    PermissionDenied {
        /// Holder label of the denied caller.
        caller: String,
        /// What was being accessed.
        target: String,
    },

    /// The agent's queue slot is held. The caller decides whether to retry.
    #[error("busy: slot held by {holder}")]
    Busy {
        /// Holder label of the current slot owner.
        holder: String,
        /// Suggested retry delay in seconds.
        retry_after_secs: u64,
    },

    /// Concurrent lifecycle transition. May be retried after stabilisation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Container engine, coordination store, or state store transiently down.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Invariant violated. Logged loudly, never silently swallowed.
    #[error("internal: {0}")]
    Internal(String),

    /// Execution terminated by operator request. Not an error in the
    /// error-reporting sense; the execution row carries the status.
    #[error("cancelled")]
    Cancelled,
}

impl HiveError {
    /// Stable kind tag, used for wire envelopes and exit-code mapping.
    pub fn kind(&self) -> &'static str {
        match self {
            HiveError::Validation(_) => "validation",
            HiveError::NotFound(_) => "not_found",
            HiveError::PermissionDenied { .. } => "permission_denied",
            HiveError::Busy { .. } => "busy",
            HiveError::Conflict(_) => "conflict",
            HiveError::DependencyUnavailable(_) => "dependency_unavailable",
            HiveError::Internal(_) => "internal",
            HiveError::Cancelled => "cancelled",
        }
    }

    /// Whether an internal caller may retry after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HiveError::DependencyUnavailable(_) | HiveError::Conflict(_))
    }
}

impl From<serde_json::Error> for HiveError {
    fn from(err: serde_json::Error) -> Self {
        HiveError::Internal(format!("serialization: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        let busy = HiveError::Busy { holder: "user:1".into(), retry_after_secs: 2 };
        assert_eq!(busy.kind(), "busy");
        assert_eq!(HiveError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn only_transient_kinds_retry() {
        assert!(HiveError::DependencyUnavailable("redis down".into()).is_retryable());
        assert!(!HiveError::Validation("bad".into()).is_retryable());
        assert!(!HiveError::PermissionDenied { caller: "a".into(), target: "b".into() }
            .is_retryable());
    }
}
