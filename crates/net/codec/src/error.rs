//! Error types for payload encoding.

/// Failure to encode a payload.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The encoder has no representation for a value of this kind.
    #[error("cannot encode {kind} value for key: {key}")]
    Unsupported { key: String, kind: &'static str },

    /// JSON serialization failed.
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Failure reported by an application-supplied encoder.
    #[error("{0}")]
    Custom(String),
}

impl EncodeError {
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }
}

/// Failure to decode an encoded payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid percent-encoding: {0}")]
    InvalidEncoding(String),

    #[error("json decoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a json object")]
    NotAnObject,
}
