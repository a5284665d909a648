//! Compact JSON encoding.

use serde_json::Value;

use crate::{DecodeError, EncodeError, Encoder, Payload};

/// Encodes a payload as a compact JSON object.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl JsonEncoder {
    /// Decodes a JSON object back into a payload.
    pub fn decode(input: &str) -> Result<Payload, DecodeError> {
        match serde_json::from_str::<Value>(input)? {
            Value::Object(payload) => Ok(payload),
            _ => Err(DecodeError::NotAnObject),
        }
    }
}

impl Encoder for JsonEncoder {
    fn encode(&self, payload: &Payload) -> Result<String, EncodeError> {
        Ok(serde_json::to_string(payload)?)
    }
}
