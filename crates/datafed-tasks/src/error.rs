//! Error types for the task orchestration domain.
//!
//! Validation failures (`PermissionDenied`, `NotFound`, `InvalidParam`, …) are
//! surfaced to the caller immediately. `WriteConflict` is the only transient
//! variant: the retry combinator re-runs the transaction that produced it.

use std::fmt;

use datafed_core::TaskId;

/// The result type used throughout datafed-tasks.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in task orchestration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The client lacks a required permission.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A referenced resource does not exist.
    #[error("not found: {resource_type} {id}")]
    NotFound {
        /// The kind of resource that was looked up.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A request parameter is malformed or inconsistent.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// A conflicting task is pending or the resource is locked.
    #[error("in use: {0}")]
    InUse(String),

    /// Two transferred files would land on the same destination name.
    #[error("transfer conflict: {0}")]
    TransferConflict(String),

    /// An allocation's record or byte limit would be exceeded.
    #[error("allocation exceeded: {0}")]
    AllocationExceeded(String),

    /// Persisted bookkeeping violates an invariant.
    #[error("internal fault: {0}")]
    InternalFault(String),

    /// A concurrent transaction committed first. Retryable.
    #[error("write conflict: {message}")]
    WriteConflict {
        /// Description of the conflict.
        message: String,
    },

    /// An invalid task status transition was attempted.
    #[error("invalid state transition for task {task_id}: {from} -> {to}")]
    InvalidStateTransition {
        /// The task being transitioned.
        task_id: TaskId,
        /// The current status.
        from: String,
        /// The requested status.
        to: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration could not be loaded.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from datafed-core.
    #[error("core error: {0}")]
    Core(#[from] datafed_core::Error),
}

/// Stable code and status family of an error, for transport layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode {
    /// Numeric error code.
    pub code: u32,
    /// Status family (400 for request errors, 500 for service faults).
    pub status: u16,
    /// Short human-readable label.
    pub label: &'static str,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label, self.code)
    }
}

impl Error {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a transient write conflict.
    #[must_use]
    pub fn write_conflict(message: impl Into<String>) -> Self {
        Self::WriteConflict {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns true when retrying the same transaction may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::WriteConflict { .. })
    }

    /// Returns the stable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        let (code, status, label) = match self {
            Self::PermissionDenied(_) => (1, 400, "Permission Denied"),
            Self::InvalidParam(_) | Self::InvalidStateTransition { .. } => {
                (2, 400, "Invalid Parameter")
            }
            Self::NotFound { .. } => (5, 400, "Record Not Found"),
            Self::InUse(_) => (6, 400, "Value In Use"),
            Self::TransferConflict(_) => (11, 400, "Data transfer conflict"),
            Self::InternalFault(_) => (12, 500, "Internal server fault"),
            Self::AllocationExceeded(_) => (14, 400, "Storage allocation exceeded"),
            Self::WriteConflict { .. } => (100, 500, "Write conflict"),
            Self::Storage { .. } => (101, 500, "Storage failure"),
            Self::Configuration { .. } => (102, 500, "Configuration error"),
            Self::Serialization { .. } | Self::Core(_) => (103, 500, "Unexpected error"),
        };
        ErrorCode {
            code,
            status,
            label,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn only_write_conflicts_are_transient() {
        assert!(Error::write_conflict("version moved").is_transient());
        assert!(!Error::InUse("locked".into()).is_transient());
        assert!(!Error::storage("disk").is_transient());
    }

    #[test]
    fn taxonomy_maps_to_request_status() {
        assert_eq!(Error::PermissionDenied("x".into()).code().status, 400);
        assert_eq!(Error::not_found("record", "d/1").code().code, 5);
        assert_eq!(Error::AllocationExceeded("full".into()).code().code, 14);
        assert_eq!(Error::InternalFault("bad".into()).code().status, 500);
    }

    #[test]
    fn not_found_display() {
        let err = Error::not_found("collection", "c/root");
        assert_eq!(err.to_string(), "not found: collection c/root");
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::Other, "backend down");
        let err = Error::storage_with_source("commit failed", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
    }
}
