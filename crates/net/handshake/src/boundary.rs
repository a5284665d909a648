//! Encoding of finished payloads.
//!
//! The caller always receives a string. When the configured encoder fails, the
//! failure message is encoded on its own in the `error` field instead, and if
//! even that fails a hand-built `error=<message>` pair is returned.

use accord_net_codec::{Encoder, Payload, Value, encode_component};
use tracing::warn;

use crate::{ERROR_FIELD, metrics::HandshakeMetrics};

pub(crate) fn encode(encoder: &dyn Encoder, payload: &Payload, metrics: &HandshakeMetrics) -> String {
    let err = match encoder.encode(payload) {
        Ok(encoded) => return encoded,
        Err(err) => err,
    };

    warn!(%err, "handshake payload could not be encoded, sending the failure instead");
    metrics.inc_encode_fallbacks();

    let message = err.to_string();
    let mut fallback = Payload::new();
    fallback.insert(ERROR_FIELD.to_owned(), Value::String(message.clone()));

    encoder.encode(&fallback).unwrap_or_else(|err| {
        warn!(%err, "encoder rejected the error payload");
        format!("{ERROR_FIELD}={}", encode_component(&message))
    })
}
