use std::sync::Arc;

/// Represents a result type for switch operations.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// crate-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur while managing or evaluating switches.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Raw input for a field could not be turned into a stored condition.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A mutation referenced a condition set id that is not registered.
    #[error("unknown condition set: {0}")]
    UnknownConditionSet(String),

    /// A mutation referenced a field the condition set does not declare.
    #[error("unknown field {field:?} in condition set {condition_set:?}")]
    UnknownField {
        /// Id of the condition set.
        condition_set: String,
        /// Name of the missing field.
        field: String,
    },

    /// The switch does not exist and auto-creation is disabled.
    #[error("switch not found: {0}")]
    SwitchNotFound(String),

    /// A field received a live value of a kind it cannot compare against.
    #[error("field {field:?} expected {expected} value, found {found}")]
    TypeMismatch {
        /// Name of the field.
        field: String,
        /// Kind of value the field understands.
        expected: &'static str,
        /// Kind of value that was supplied.
        found: &'static str,
    },

    /// The persistence layer failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Stored data could not be encoded or decoded.
    #[error(transparent)]
    Serialization(Arc<serde_json::Error>),

    /// Indicates that the refresher thread panicked. This should normally never happen.
    #[error("refresher thread panicked")]
    RefresherThreadPanicked,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(value))
    }
}

/// Malformed raw input passed to a field's `clean`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    pub(crate) fn new(message: impl Into<String>) -> ValidationError {
        ValidationError {
            message: message.into(),
        }
    }

    /// Human-readable explanation suitable for showing next to the offending input.
    pub fn message(&self) -> &str {
        &self.message
    }
}
