//! Per-negotiation state and the completion gate.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU8, Ordering},
    },
    time::{Duration, Instant},
};

use accord_net_codec::{Encoder, Payload, Value};
use accord_timers::TimerRegistry;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::{
    ERROR_FIELD, HandshakeError, ModifyError, NegotiationError, Outcome, SessionId, boundary,
    metrics::HandshakeMetrics,
};

/// Application step that enriches or rejects a negotiation's payload.
pub enum Modify<C> {
    /// Runs to completion inline. Returning `Err` rejects the handshake.
    Sync(Box<dyn FnOnce(&C, &mut Payload) -> Result<(), ModifyError>>),
    /// Completes later by calling [`Done::complete`].
    Deferred(Box<dyn FnOnce(&C, WorkingPayload, Done)>),
}

impl<C> Modify<C> {
    pub fn sync<F>(step: F) -> Self
    where
        F: FnOnce(&C, &mut Payload) -> Result<(), ModifyError> + 'static,
    {
        Self::Sync(Box::new(step))
    }

    pub fn deferred<F>(step: F) -> Self
    where
        F: FnOnce(&C, WorkingPayload, Done) + 'static,
    {
        Self::Deferred(Box::new(step))
    }

    /// Accepts the payload unchanged.
    pub fn noop() -> Self {
        Self::sync(|_, _| Ok(()))
    }
}

impl<C> fmt::Debug for Modify<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Modify::Sync"),
            Self::Deferred(_) => f.write_str("Modify::Deferred"),
        }
    }
}

/// Shared handle to a negotiation's private payload.
#[derive(Debug, Clone, Default)]
pub struct WorkingPayload(Arc<Mutex<Payload>>);

impl WorkingPayload {
    fn new(payload: Payload) -> Self {
        Self(Arc::new(Mutex::new(payload)))
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.lock().insert(key.into(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.lock().remove(key)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.lock().get(key).cloned()
    }

    /// Runs `f` with exclusive access to the payload.
    ///
    /// # Deadlocks
    ///
    /// The payload stays locked while `f` runs, and completing a negotiation
    /// locks it again to take the final snapshot. Calling [`Done::complete`]
    /// (or `ok`/`fail`) from inside `f`, or any other method of this payload,
    /// deadlocks. Return a value from `f` and complete after it returns.
    pub fn with<R>(&self, f: impl FnOnce(&mut Payload) -> R) -> R {
        f(&mut *self.0.lock())
    }

    pub fn snapshot(&self) -> Payload {
        self.0.lock().clone()
    }
}

const PENDING: u8 = 0;
const COMPLETING: u8 = 1;
const DONE: u8 = 2;

/// Single-fire latch: `PENDING -> COMPLETING -> DONE`, or `PENDING -> DONE`
/// when closed without an outcome.
#[derive(Debug)]
pub(crate) struct CompletionGate {
    state: AtomicU8,
}

impl CompletionGate {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
        }
    }

    /// Claims the right to deliver the outcome. Succeeds at most once.
    pub(crate) fn try_begin(&self) -> bool {
        self.state
            .compare_exchange(PENDING, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn finish(&self) {
        self.state.store(DONE, Ordering::Release);
    }

    /// Moves a pending gate straight to `DONE`, so no outcome is delivered.
    pub(crate) fn close(&self) -> bool {
        self.state
            .compare_exchange(PENDING, DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }
}

/// Receives the outcome of a negotiation: the error, if any, and the encoded
/// payload.
pub(crate) type OnComplete<C> = Box<dyn FnOnce(&C, Option<NegotiationError>, String) + Send>;

/// Where a session's outcome goes.
pub(crate) enum Delivery<C> {
    /// Called with the outcome. Dropped unused if the session closes first.
    Callback(OnComplete<C>),
    /// Sent the outcome, or the reason the session closed without one.
    Reply(oneshot::Sender<Result<Outcome, HandshakeError>>),
}

/// Sessions still waiting for an outcome, keyed by id.
pub(crate) type Outstanding<C> = Mutex<HashMap<SessionId, Arc<Session<C>>>>;

/// Everything a session needs from its handshake, captured at start.
pub(crate) struct SessionParts<C> {
    pub(crate) id: SessionId,
    pub(crate) payload: Payload,
    pub(crate) context: Arc<C>,
    pub(crate) encoder: Arc<dyn Encoder>,
    pub(crate) timers: Arc<dyn TimerRegistry>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) metrics: HandshakeMetrics,
    pub(crate) outstanding: Weak<Outstanding<C>>,
}

/// A single negotiation.
pub(crate) struct Session<C> {
    id: SessionId,
    gate: CompletionGate,
    payload: WorkingPayload,
    context: Arc<C>,
    encoder: Arc<dyn Encoder>,
    timers: Arc<dyn TimerRegistry>,
    timeout: Option<Duration>,
    metrics: HandshakeMetrics,
    outstanding: Weak<Outstanding<C>>,
    delivery: Mutex<Option<Delivery<C>>>,
    started: Instant,
}

impl<C> Session<C> {
    pub(crate) fn new(parts: SessionParts<C>, delivery: Delivery<C>) -> Self {
        Self {
            id: parts.id,
            gate: CompletionGate::new(),
            payload: WorkingPayload::new(parts.payload),
            context: parts.context,
            encoder: parts.encoder,
            timers: parts.timers,
            timeout: parts.timeout,
            metrics: parts.metrics,
            outstanding: parts.outstanding,
            delivery: Mutex::new(Some(delivery)),
            started: Instant::now(),
        }
    }

    pub(crate) fn id(&self) -> &SessionId {
        &self.id
    }

    /// Closes a pending session without delivering an outcome. A callback is
    /// dropped unused, a reply receives `reason`.
    pub(crate) fn close(&self, reason: HandshakeError) -> bool {
        if !self.gate.close() {
            return false;
        }
        trace!(id = %self.id, %reason, "negotiation closed without outcome");
        let delivery = self.delivery.lock().take();
        if let Some(Delivery::Reply(tx)) = delivery {
            let _ = tx.send(Err(reason));
        }
        true
    }

    /// Called once the last [`Done`] handle is gone. Without a deadline nothing
    /// else can complete the session, so it is closed and forgotten.
    fn abandon(&self) {
        if self.timeout.is_some() || !self.close(HandshakeError::Abandoned) {
            return;
        }
        debug!(id = %self.id, "negotiation abandoned by its modify step");
        self.metrics.inc_abandoned();
        if let Some(outstanding) = self.outstanding.upgrade() {
            outstanding.lock().remove(&self.id);
        }
    }

    /// Delivers `result` if no other outcome has been delivered yet.
    fn complete(&self, result: Result<(), NegotiationError>) {
        if !self.gate.try_begin() {
            trace!(id = %self.id, "late completion discarded");
            return;
        }

        if self.timeout.is_some() {
            self.timers.cancel(self.id.as_str());
        }
        if let Some(outstanding) = self.outstanding.upgrade() {
            outstanding.lock().remove(&self.id);
        }

        let error = result.err();
        let mut payload = self.payload.snapshot();
        if let Some(error) = &error {
            payload.insert(ERROR_FIELD.to_owned(), Value::String(error.to_string()));
        }
        let encoded = boundary::encode(self.encoder.as_ref(), &payload, &self.metrics);

        self.metrics.record_outcome(error.as_ref(), self.started.elapsed());
        match &error {
            None => debug!(id = %self.id, "negotiation completed"),
            Some(error) => debug!(id = %self.id, %error, "negotiation failed"),
        }

        let delivery = self.delivery.lock().take();
        match delivery {
            Some(Delivery::Callback(on_complete)) => on_complete(&*self.context, error, encoded),
            Some(Delivery::Reply(tx)) => {
                let _ = tx.send(Ok(Outcome { error, encoded }));
            }
            None => {}
        }
        self.gate.finish();
    }
}

impl<C: Send + Sync + 'static> Session<C> {
    /// Arms the deadline, if one is configured.
    pub(crate) fn arm_deadline(self: &Arc<Self>) {
        let Some(timeout) = self.timeout else {
            return;
        };

        let session = Arc::downgrade(self);
        self.timers.schedule(
            self.id.as_str(),
            timeout,
            Box::new(move || {
                if let Some(session) = session.upgrade() {
                    warn!(id = %session.id, ?timeout, "handshake deadline elapsed");
                    session.complete(Err(NegotiationError::Timeout(timeout)));
                }
            }),
        );
    }

    /// Runs the modify step against this session's payload.
    pub(crate) fn run(self: &Arc<Self>, modify: Modify<C>) {
        match modify {
            Modify::Sync(step) => {
                let result = self.payload.with(|payload| step(&*self.context, payload));
                self.complete(result.map_err(NegotiationError::from));
            }
            Modify::Deferred(step) => {
                let done = Done {
                    handle: Arc::new(DoneHandle {
                        session: Arc::clone(self) as Arc<dyn Completion>,
                    }),
                };
                step(&*self.context, self.payload.clone(), done);
            }
        }
    }
}

impl<C> fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("gate", &self.gate)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

trait Completion: Send + Sync {
    fn complete(&self, result: Result<(), NegotiationError>);

    fn is_pending(&self) -> bool;

    fn abandon(&self);
}

impl<C: Send + Sync> Completion for Session<C> {
    fn complete(&self, result: Result<(), NegotiationError>) {
        Session::complete(self, result)
    }

    fn is_pending(&self) -> bool {
        self.gate.is_pending()
    }

    fn abandon(&self) {
        Session::abandon(self)
    }
}

/// Shared by every clone of a [`Done`]; dropped with the last one.
struct DoneHandle {
    session: Arc<dyn Completion>,
}

impl Drop for DoneHandle {
    fn drop(&mut self) {
        self.session.abandon();
    }
}

/// Completion handle passed to a [`Modify::Deferred`] step.
///
/// Only the first call to [`complete`](Self::complete), across all clones, has
/// an effect. Dropping every clone without completing leaves the negotiation to
/// its deadline or, when no deadline is configured, abandons it: no outcome is
/// delivered and [`Handshake::negotiate_async`](crate::Handshake::negotiate_async)
/// resolves to [`HandshakeError::Abandoned`].
#[derive(Clone)]
pub struct Done {
    handle: Arc<DoneHandle>,
}

impl Done {
    pub fn complete(&self, result: Result<(), ModifyError>) {
        self.handle.session.complete(result.map_err(NegotiationError::from));
    }

    pub fn ok(&self) {
        self.complete(Ok(()));
    }

    pub fn fail(&self, error: impl Into<ModifyError>) {
        self.complete(Err(error.into()));
    }

    /// Whether the negotiation is still waiting for an outcome.
    pub fn is_pending(&self) -> bool {
        self.handle.session.is_pending()
    }
}

impl fmt::Debug for Done {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Done")
            .field("pending", &self.is_pending())
            .finish()
    }
}
