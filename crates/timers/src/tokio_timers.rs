//! Tokio-backed timer registry.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{runtime::Handle, task::AbortHandle};
use tracing::trace;

use crate::{TimerCallback, TimerError, TimerRegistry};

/// Armed timers, keyed by name.
///
/// A timer task only fires if its entry is still present with the generation it
/// was armed under, checked and removed under the lock. Cancelling therefore
/// wins against a task that has already woken up.
#[derive(Debug, Default)]
struct Slots {
    next_generation: u64,
    armed: HashMap<String, Armed>,
}

#[derive(Debug)]
struct Armed {
    generation: u64,
    task: AbortHandle,
}

impl Slots {
    /// Removes the entry for `key` if it still belongs to `generation`.
    fn claim(&mut self, key: &str, generation: u64) -> bool {
        match self.armed.get(key) {
            Some(armed) if armed.generation == generation => {
                self.armed.remove(key);
                true
            }
            _ => false,
        }
    }
}

/// Timer registry that runs each timer as a task on a tokio runtime.
///
/// Dropping the registry cancels every pending timer.
#[derive(Debug)]
pub struct TokioTimers {
    handle: Handle,
    slots: Arc<Mutex<Slots>>,
}

impl TokioTimers {
    /// Creates a registry on the runtime of the current context.
    pub fn new() -> Result<Self, TimerError> {
        Handle::try_current()
            .map(Self::with_handle)
            .map_err(|_| TimerError::NoRuntime)
    }

    /// Creates a registry that spawns its timers on `handle`.
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            slots: Arc::default(),
        }
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.slots.lock().armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TimerRegistry for TokioTimers {
    fn schedule(&self, key: &str, after: Duration, callback: TimerCallback) {
        let mut slots = self.slots.lock();
        let generation = slots.next_generation;
        slots.next_generation = slots.next_generation.wrapping_add(1);

        let shared = Arc::clone(&self.slots);
        let owned_key = key.to_owned();
        // The task cannot claim its slot before the insert below, the lock is
        // still held.
        let task = self.handle.spawn(async move {
            tokio::time::sleep(after).await;
            if shared.lock().claim(&owned_key, generation) {
                trace!(key = %owned_key, "timer fired");
                callback();
            }
        });

        trace!(key, ?after, "timer armed");
        let armed = Armed {
            generation,
            task: task.abort_handle(),
        };
        if let Some(previous) = slots.armed.insert(key.to_owned(), armed) {
            previous.task.abort();
        }
    }

    fn cancel(&self, key: &str) -> bool {
        match self.slots.lock().armed.remove(key) {
            Some(armed) => {
                armed.task.abort();
                trace!(key, "timer cancelled");
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self) -> usize {
        let drained: Vec<Armed> = {
            let mut slots = self.slots.lock();
            slots.armed.drain().map(|(_, armed)| armed).collect()
        };
        for armed in &drained {
            armed.task.abort();
        }
        if !drained.is_empty() {
            trace!(count = drained.len(), "cancelled all timers");
        }
        drained.len()
    }

    fn is_pending(&self, key: &str) -> bool {
        self.slots.lock().armed.contains_key(key)
    }
}

impl Drop for TokioTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
