//! Structured error kinds shared across every subsystem.

use std::fmt;

/// A single, structured error carrying a kind, a human message, and an
/// optional underlying cause.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(
        kind: ErrorKind,
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }
}

/// Error kinds propagated by the core, matching the structured shape
/// `{kind, message, cause?}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Env missing/ill-formed; fatal at startup only.
    ConfigInvalid,
    /// SQL layer unreachable.
    StoreUnavailable,
    /// SQL layer reachable but the query failed.
    QueryFailed,
    /// Transport-layer failure reaching a host (SSH dial, TCP connect).
    HostUnreachable,
    /// Docker daemon reachable transport-wise but API calls fail or ping
    /// times out.
    DockerUnavailable,
    /// Stager could not produce a valid workspace.
    StageFailed,
    /// SOPS subprocess failed or produced undecryptable output.
    DecryptFailed,
    /// Compose subprocess exited non-zero.
    ComposeFailed,
    /// Auto-DevOps gate rejected the deploy; not a failure.
    PolicyDenied,
    /// Sentinel: this pass was intentionally skipped.
    SkipScan,
    /// Unique constraint violated; caller chooses update or ignore.
    Conflict,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::QueryFailed => "query_failed",
            ErrorKind::HostUnreachable => "host_unreachable",
            ErrorKind::DockerUnavailable => "docker_unavailable",
            ErrorKind::StageFailed => "stage_failed",
            ErrorKind::DecryptFailed => "decrypt_failed",
            ErrorKind::ComposeFailed => "compose_failed",
            ErrorKind::PolicyDenied => "policy_denied",
            ErrorKind::SkipScan => "skip_scan",
            ErrorKind::Conflict => "conflict",
        };
        f.write_str(s)
    }
}

/// Convenience constructors used throughout the crate.
impl CoreError {
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigInvalid, message)
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StoreUnavailable, message)
    }

    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueryFailed, message)
    }

    pub fn host_unreachable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HostUnreachable, message)
    }

    pub fn docker_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DockerUnavailable, message)
    }

    pub fn stage_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StageFailed, message)
    }

    pub fn decrypt_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DecryptFailed, message)
    }

    pub fn compose_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ComposeFailed, message)
    }

    pub fn policy_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PolicyDenied, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return CoreError::with_cause(ErrorKind::Conflict, "unique constraint violated", err);
            }
        }
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                CoreError::with_cause(ErrorKind::StoreUnavailable, "store unavailable", err)
            }
            _ => CoreError::with_cause(ErrorKind::QueryFailed, "query failed", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = CoreError::host_unreachable("ssh dial timed out");
        assert_eq!(err.to_string(), "host_unreachable: ssh dial timed out");
    }

    #[test]
    fn policy_denied_is_not_an_error_path_marker() {
        // PolicyDenied is returned, never constructed from an IO failure.
        let err = CoreError::policy_denied("auto-devops disabled for stack");
        assert_eq!(err.kind, ErrorKind::PolicyDenied);
        assert!(err.cause.is_none());
    }
}
