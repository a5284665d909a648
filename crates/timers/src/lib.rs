//! Named one-shot timers.
//!
//! A [`TimerRegistry`] arms callbacks under string keys so that each one can be
//! disarmed individually, or all at once when the owner shuts down. The
//! registry is an owned resource: every owner builds (or is handed) its own
//! instance and tears it down with [`TimerRegistry::cancel_all`].
//!
//! [`TokioTimers`] is the default registry, running each timer as a task on a
//! tokio runtime.

use std::time::Duration;

use auto_impl::auto_impl;

mod duration;
pub use duration::{DurationError, parse_duration};

mod tokio_timers;
pub use tokio_timers::TokioTimers;

/// Callback invoked when a timer fires.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Errors raised while setting up a timer registry.
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    /// No tokio runtime is available to drive the timers.
    #[error("no tokio runtime available to drive timers")]
    NoRuntime,
}

/// A registry of named, cancellable, one-shot timers.
#[auto_impl(&, Arc, Box)]
pub trait TimerRegistry: Send + Sync {
    /// Arms `callback` to run once after `after` has elapsed.
    ///
    /// Scheduling a key that is still armed replaces the earlier timer.
    fn schedule(&self, key: &str, after: Duration, callback: TimerCallback);

    /// Disarms the timer for `key`. Returns `false` if nothing was pending.
    fn cancel(&self, key: &str) -> bool;

    /// Disarms every pending timer, returning how many were cancelled.
    fn cancel_all(&self) -> usize;

    /// Returns whether a timer is armed for `key`.
    fn is_pending(&self, key: &str) -> bool;
}
