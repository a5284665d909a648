//! `key=value&key=value` encoding.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde_json::Value;

use crate::{DecodeError, EncodeError, Encoder, Payload};

/// Bytes left untouched when encoding a component, matching the unreserved
/// set browsers use for URI components.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Percent-encodes a single key or value.
pub fn encode_component(input: &str) -> String {
    utf8_percent_encode(input, COMPONENT).to_string()
}

/// Reverses [`encode_component`]. A `+` is read as a space.
pub fn decode_component(input: &str) -> Result<String, DecodeError> {
    let spaced = input.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| DecodeError::InvalidEncoding(input.to_owned()))
}

/// Encodes a flat payload as `key=value` pairs joined by `&`.
///
/// Strings, numbers and booleans are written in their plain text form and
/// `null` as an empty value. Arrays and objects have no flat representation
/// and fail to encode.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryStringEncoder;

impl QueryStringEncoder {
    /// Decodes a query string into a payload of string values.
    ///
    /// A leading `?` or `#` is ignored. When a key repeats, the first
    /// occurrence wins.
    pub fn decode(input: &str) -> Result<Payload, DecodeError> {
        let input = input.trim_start_matches(['?', '#']);
        let mut payload = Payload::new();

        for pair in input.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = decode_component(key)?;
            if key.is_empty() || payload.contains_key(&key) {
                continue;
            }
            payload.insert(key, Value::String(decode_component(value)?));
        }

        Ok(payload)
    }
}

impl Encoder for QueryStringEncoder {
    fn encode(&self, payload: &Payload) -> Result<String, EncodeError> {
        let mut pairs = Vec::with_capacity(payload.len());

        for (key, value) in payload {
            let text = match value {
                Value::Null => String::new(),
                Value::Bool(flag) => flag.to_string(),
                Value::Number(number) => number.to_string(),
                Value::String(text) => text.clone(),
                Value::Array(_) => return Err(unsupported(key, "array")),
                Value::Object(_) => return Err(unsupported(key, "object")),
            };
            pairs.push(format!(
                "{}={}",
                encode_component(key),
                encode_component(&text)
            ));
        }

        Ok(pairs.join("&"))
    }
}

fn unsupported(key: &str, kind: &'static str) -> EncodeError {
    EncodeError::Unsupported {
        key: key.to_owned(),
        kind,
    }
}
