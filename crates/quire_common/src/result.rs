//! Common result and error types for the Quire engine.

/// The standard result type for operations that can only fail on an engine bug.
///
/// User mistakes (bad config, failing filters) are reported through the typed
/// error enums of each crate. `Err` here always means Quire itself is wrong.
pub type QuireResult<T> = Result<T, InternalError>;

/// An internal error indicating a bug in Quire, not a user input problem.
///
/// Examples are an out-of-order document state transition, a missing
/// fingerprint attribute, or a sectioned payload larger than the on-disk
/// index can address. These are always fatal to the run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("internal error: {message}")]
pub struct InternalError {
    /// Description of the internal error.
    pub message: String,
}

impl InternalError {
    /// Creates a new internal error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for InternalError {
    fn from(message: String) -> Self {
        Self { message }
    }
}
