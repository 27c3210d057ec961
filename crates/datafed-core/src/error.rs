//! Error types and result aliases shared by DataFed crates.
//!
//! Domain crates wrap this error in their own taxonomy; the variants here
//! cover failures that can happen before any domain logic runs.

/// The result type used throughout datafed-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by core primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates an invalid identifier error.
    #[must_use]
    pub fn invalid_id(message: impl Into<String>) -> Self {
        Self::InvalidId {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_id_display() {
        let err = Error::invalid_id("missing prefix");
        assert_eq!(err.to_string(), "invalid identifier: missing prefix");
    }

    #[test]
    fn internal_display() {
        let err = Error::internal("broken invariant");
        assert!(err.to_string().contains("broken invariant"));
    }
}
