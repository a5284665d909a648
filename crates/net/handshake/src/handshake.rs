//! The handshake facade.

use std::{
    fmt,
    future::Future,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use accord_net_codec::{Encoder, Payload};
use accord_timers::{TimerRegistry, TokioTimers};
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::{
    ConfigError, FieldValue, HandshakeConfig, HandshakeError, IdGenerator, Modify,
    NegotiationError,
    metrics::HandshakeMetrics,
    session::{Delivery, Outstanding, Session, SessionParts},
    template::Template,
};

/// State released on disposal.
struct State<C> {
    template: Template<C>,
    payload: Payload,
    encoder: Arc<dyn Encoder>,
    id_generator: IdGenerator,
    context: Arc<C>,
    timers: Arc<dyn TimerRegistry>,
    timeout: Option<Duration>,
}

/// Builds, negotiates and encodes handshake payloads.
///
/// `C` is the context handed to field producers, modify steps and completion
/// callbacks. Dropping the handshake disposes it.
pub struct Handshake<C> {
    /// `None` once disposed.
    state: RwLock<Option<State<C>>>,
    outstanding: Arc<Outstanding<C>>,
    metrics: HandshakeMetrics,
}

impl<C: Send + Sync + 'static> Handshake<C> {
    /// Creates a handshake and builds its initial (empty) payload.
    ///
    /// Without an explicit timer registry in `config`, this must be called from
    /// within a tokio runtime.
    pub fn new(context: C, config: HandshakeConfig) -> Result<Self, HandshakeError> {
        Self::with_shared_context(Arc::new(context), config)
    }

    /// Like [`new`](Self::new), for a context shared with the rest of the
    /// application.
    pub fn with_shared_context(
        context: Arc<C>,
        config: HandshakeConfig,
    ) -> Result<Self, HandshakeError> {
        let timers: Arc<dyn TimerRegistry> = match config.timers {
            Some(timers) => timers,
            None => Arc::new(TokioTimers::new().map_err(ConfigError::from)?),
        };

        let handshake = Self {
            state: RwLock::new(Some(State {
                template: Template::new(),
                payload: Payload::new(),
                encoder: config.encoder,
                id_generator: config.id_generator,
                context,
                timers,
                timeout: config.timeout,
            })),
            outstanding: Arc::default(),
            metrics: HandshakeMetrics::default(),
        };
        handshake.refresh()?;
        Ok(handshake)
    }

    /// Registers a default field. Takes effect on the next [`refresh`](Self::refresh).
    ///
    /// Fails with [`ConfigError::AbsentValue`] for [`FieldValue::Absent`],
    /// leaving the template untouched.
    pub fn set(
        &self,
        name: impl Into<String>,
        value: impl Into<FieldValue<C>>,
    ) -> Result<&Self, HandshakeError> {
        let mut state = self.state.write();
        let state = state.as_mut().ok_or(HandshakeError::Disposed)?;
        state.template.set(name.into(), value.into())?;
        Ok(self)
    }

    /// Rebuilds the live payload from the template, evaluating producers
    /// against the context. The previous payload is replaced entirely.
    pub fn refresh(&self) -> Result<&Self, HandshakeError> {
        // Producers run without holding the lock.
        let (template, context) = {
            let state = self.state.read();
            let state = state.as_ref().ok_or(HandshakeError::Disposed)?;
            (state.template.clone(), Arc::clone(&state.context))
        };
        let payload = template.resolve(&context);

        let mut state = self.state.write();
        let state = state.as_mut().ok_or(HandshakeError::Disposed)?;
        trace!(fields = payload.len(), "handshake payload refreshed");
        state.payload = payload;
        Ok(self)
    }

    /// Negotiates a handshake.
    ///
    /// `modify` runs against a private clone of the live payload. Exactly one
    /// outcome is delivered to `on_complete`: the step's result or, if the
    /// deadline passes first, a [`NegotiationError::Timeout`]. On error the
    /// message is also written into the payload's `error` field before
    /// encoding.
    ///
    /// If the handshake is disposed, or the step abandons the negotiation,
    /// before an outcome is reached, `on_complete` is dropped without being
    /// called.
    pub fn negotiate<F>(&self, modify: Modify<C>, on_complete: F) -> Result<&Self, HandshakeError>
    where
        F: FnOnce(&C, Option<NegotiationError>, String) + Send + 'static,
    {
        self.start(modify, Delivery::Callback(Box::new(on_complete)))?;
        Ok(self)
    }

    /// Negotiates a handshake, resolving to its [`Outcome`].
    ///
    /// The returned future fails with [`HandshakeError::Disposed`] if the
    /// handshake is disposed before an outcome is reached, and with
    /// [`HandshakeError::Abandoned`] if a deferred step without a deadline drops
    /// its [`Done`](crate::Done) handle.
    pub fn negotiate_async(&self, modify: Modify<C>) -> Result<Negotiation, HandshakeError> {
        let (tx, rx) = oneshot::channel();
        self.start(modify, Delivery::Reply(tx))?;
        Ok(Negotiation { rx })
    }

    fn start(&self, modify: Modify<C>, delivery: Delivery<C>) -> Result<(), HandshakeError> {
        let session = {
            // Held until the deadline is armed so disposal cannot slip in between.
            let state = self.state.read();
            let state = state.as_ref().ok_or(HandshakeError::Disposed)?;

            let parts = SessionParts {
                id: (state.id_generator)(),
                payload: state.payload.clone(),
                context: Arc::clone(&state.context),
                encoder: Arc::clone(&state.encoder),
                timers: Arc::clone(&state.timers),
                timeout: state.timeout,
                metrics: self.metrics.clone(),
                outstanding: Arc::downgrade(&self.outstanding),
            };
            let session = Arc::new(Session::new(parts, delivery));
            self.outstanding
                .lock()
                .insert(session.id().clone(), Arc::clone(&session));
            session.arm_deadline();
            session
        };

        debug!(id = %session.id(), ?modify, "negotiation started");
        self.metrics.inc_started();
        session.run(modify);
        Ok(())
    }

    /// Snapshot of the live payload.
    pub fn payload(&self) -> Result<Payload, HandshakeError> {
        self.state
            .read()
            .as_ref()
            .map(|state| state.payload.clone())
            .ok_or(HandshakeError::Disposed)
    }

    pub fn context(&self) -> Option<Arc<C>> {
        self.state
            .read()
            .as_ref()
            .map(|state| Arc::clone(&state.context))
    }
}

impl<C> Handshake<C> {
    /// Cancels every pending deadline, closes outstanding negotiations and
    /// releases all state.
    ///
    /// Returns `true` on the first call and `false` afterwards.
    pub fn dispose(&self) -> bool {
        let Some(state) = self.state.write().take() else {
            return false;
        };

        let cancelled = state.timers.cancel_all();
        let sessions = mem::take(&mut *self.outstanding.lock());
        let closed = sessions
            .values()
            .filter(|session| session.close(HandshakeError::Disposed))
            .count();
        debug!(cancelled, closed, "handshake disposed");

        drop(sessions);
        drop(state);
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.state.read().is_none()
    }

    /// The deadline applied to each negotiation. `None` when disabled or
    /// disposed.
    pub fn timeout(&self) -> Option<Duration> {
        self.state.read().as_ref().and_then(|state| state.timeout)
    }

    /// Number of negotiations waiting for an outcome.
    pub fn pending(&self) -> usize {
        self.outstanding.lock().len()
    }
}

impl<C> Drop for Handshake<C> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<C> fmt::Debug for Handshake<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Handshake")
            .field("disposed", &state.is_none())
            .field("fields", &state.as_ref().map(|state| state.template.len()))
            .field("timeout", &state.as_ref().and_then(|state| state.timeout))
            .field("pending", &self.outstanding.lock().len())
            .finish()
    }
}

/// Result of a negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Why the negotiation failed, if it did. Encoding failures are never
    /// reported here, only inside `encoded`.
    pub error: Option<NegotiationError>,
    /// The encoded payload, ready for the transport.
    pub encoded: String,
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Future returned by [`Handshake::negotiate_async`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Negotiation {
    rx: oneshot::Receiver<Result<Outcome, HandshakeError>>,
}

impl Future for Negotiation {
    type Output = Result<Outcome, HandshakeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut()
            .rx
            .poll_unpin(cx)
            .map(|outcome| outcome.unwrap_or(Err(HandshakeError::Disposed)))
    }
}
