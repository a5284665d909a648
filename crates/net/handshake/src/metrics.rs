//! Handshake Metrics

use std::time::Duration;

use metrics::{Counter, Histogram};

use crate::NegotiationError;

/// Handshake Metrics
#[derive(Clone, Debug)]
pub(crate) struct HandshakeMetrics {
    /// Number of negotiations started
    started_total: Counter,
    /// Number of negotiations completed without error
    succeeded_total: Counter,
    /// Number of negotiations rejected by the modify step
    failed_total: Counter,
    /// Number of negotiations that hit their deadline
    timed_out_total: Counter,
    /// Number of negotiations whose modify step dropped its completion handle
    abandoned_total: Counter,
    /// Number of payloads replaced by an error payload because encoding failed
    encode_fallbacks_total: Counter,
    /// Time from negotiation start to delivered outcome
    duration_seconds: Histogram,
}

impl Default for HandshakeMetrics {
    fn default() -> Self {
        Self {
            started_total: metrics::counter!("handshake.negotiations_started_total"),
            succeeded_total: metrics::counter!("handshake.negotiations_succeeded_total"),
            failed_total: metrics::counter!("handshake.negotiations_failed_total"),
            timed_out_total: metrics::counter!("handshake.negotiations_timed_out_total"),
            abandoned_total: metrics::counter!("handshake.negotiations_abandoned_total"),
            encode_fallbacks_total: metrics::counter!("handshake.encode_fallbacks_total"),
            duration_seconds: metrics::histogram!("handshake.negotiation_duration_seconds"),
        }
    }
}

impl HandshakeMetrics {
    pub(crate) fn inc_started(&self) {
        self.started_total.increment(1);
    }

    pub(crate) fn inc_abandoned(&self) {
        self.abandoned_total.increment(1);
    }

    pub(crate) fn inc_encode_fallbacks(&self) {
        self.encode_fallbacks_total.increment(1);
    }

    /// Records how a negotiation ended and how long it took.
    pub(crate) fn record_outcome(&self, error: Option<&NegotiationError>, elapsed: Duration) {
        match error {
            None => self.succeeded_total.increment(1),
            Some(NegotiationError::Timeout(_)) => self.timed_out_total.increment(1),
            Some(NegotiationError::Modification(_)) => self.failed_total.increment(1),
        }
        self.duration_seconds.record(elapsed.as_secs_f64());
    }
}
