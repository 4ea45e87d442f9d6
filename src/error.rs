//! Error taxonomy shared by every public operation.
//!
//! The platform exposes a closed set of error kinds so callers can match on
//! failure categories without depending on provider-specific error types.
//! Provider failures carry the provider identifier; storage failures wrap
//! the underlying SQLite error.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure categories surfaced by the platform.
#[derive(Debug, Error)]
pub enum Error {
    /// Schema or parameter violation: empty prompt, unknown chunk method,
    /// bad cron expression, dimension mismatch, unknown task type.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// A named document, task, server, or tool does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Persistence I/O failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Embedding provider call failed.
    #[error("embedding failed ({provider}): {message}")]
    Embedding { provider: String, message: String },

    /// Generation provider call failed.
    #[error("generation failed ({provider}): {message}")]
    Generation { provider: String, message: String },

    /// A tool call was requested that is not on the allowed list.
    #[error("tool not allowed: {0}")]
    ToolDenied(String),

    /// A tool ran and returned a non-success result.
    #[error("tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    /// An operation exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Canceled,

    /// A component is disabled by configuration or not yet started.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl Error {
    /// Shorthand for an [`Error::InvalidArg`] with a formatted message.
    pub fn invalid_arg(msg: impl Into<String>) -> Self {
        Self::InvalidArg(msg.into())
    }

    /// Shorthand for an [`Error::Embedding`] tagged with the provider name.
    pub fn embedding(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Embedding {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Shorthand for an [`Error::Generation`] tagged with the provider name.
    pub fn generation(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Generation {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// True when the error is a cancellation, which callers that requested
    /// the cancellation should not treat as a failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}
