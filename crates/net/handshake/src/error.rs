//! Error types for handshake negotiation.

use std::time::Duration;

use accord_timers::{DurationError, TimerError};

/// Invalid handshake configuration. Always returned synchronously.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An absent value was passed to [`Handshake::set`](crate::Handshake::set).
    #[error("cannot set an absent value for: {field}")]
    AbsentValue { field: String },

    #[error("invalid handshake timeout: {0}")]
    InvalidTimeout(#[from] DurationError),

    #[error("timer registry unavailable: {0}")]
    Timers(#[from] TimerError),
}

/// Rejection raised by the application's modify step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ModifyError {
    message: String,
}

impl ModifyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Captures the display message of any error.
    pub fn from_error<E: std::error::Error + ?Sized>(error: &E) -> Self {
        Self::new(error.to_string())
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<&str> for ModifyError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for ModifyError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Why a negotiation failed, as delivered to the completion callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    /// The modify step rejected the handshake.
    #[error(transparent)]
    Modification(#[from] ModifyError),

    /// The modify step did not finish before the deadline.
    #[error("handshake did not complete in a timely manner")]
    Timeout(Duration),
}

impl NegotiationError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Errors returned directly by [`Handshake`](crate::Handshake) operations.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The handshake was disposed, either before the call or while the
    /// negotiation was still pending.
    #[error("handshake has been disposed")]
    Disposed,

    /// No deadline was configured and the modify step dropped every
    /// [`Done`](crate::Done) handle without completing.
    #[error("handshake negotiation was abandoned by its modify step")]
    Abandoned,
}
