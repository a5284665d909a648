//! Payload type and encoders for handshake responses.
//!
//! A handshake response is a flat, insertion-ordered mapping of field names to
//! plain JSON values. An [`Encoder`] turns it into the string handed to the
//! transport. Two encoders ship here:
//!
//! - [`QueryStringEncoder`]: `key=value&key=value`, components percent-encoded.
//!   This is the default.
//! - [`JsonEncoder`]: a JSON object.

pub use serde_json::Value;

mod error;
pub use error::{DecodeError, EncodeError};

mod json;
pub use json::JsonEncoder;

mod query;
pub use query::{QueryStringEncoder, decode_component, encode_component};

/// Field mapping carried by a handshake. Iteration follows insertion order.
pub type Payload = serde_json::Map<String, Value>;

/// Converts a finished payload into its wire form.
pub trait Encoder: Send + Sync {
    /// Encodes `payload`, failing on values this encoder cannot represent.
    fn encode(&self, payload: &Payload) -> Result<String, EncodeError>;
}

impl<F> Encoder for F
where
    F: Fn(&Payload) -> Result<String, EncodeError> + Send + Sync,
{
    fn encode(&self, payload: &Payload) -> Result<String, EncodeError> {
        self(payload)
    }
}
