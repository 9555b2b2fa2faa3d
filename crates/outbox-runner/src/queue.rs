//! Sequential delivery queue.
//!
//! A single-lane executor for asynchronous units of work. At most one unit
//! runs at a time and units complete in submission order, however fast they
//! are pushed.
//!
//! # Failure discipline
//!
//! When a unit fails, its failure action runs and the queue halts: later
//! pushes are buffered but nothing else executes until [`DeliveryQueue::clear`]
//! is called. Whoever owns the failure decides what happens to the backlog.
//! A unit that panics counts as a failed unit: the panic becomes an
//! [`UnitPanic`] error and goes through the same failure action.

use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, trace};

/// The asynchronous action of a delivery unit.
pub type UnitFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// Callback invoked with the error when a unit's action fails.
pub type FailureAction<E> = Box<dyn FnOnce(E) + Send>;

/// One unit of work: an action plus what to do if it fails.
///
/// The action is a future and does nothing until the queue polls it.
pub struct DeliveryUnit<E> {
    execute: UnitFuture<E>,
    on_error: FailureAction<E>,
}

impl<E> DeliveryUnit<E> {
    /// Create a unit from an action and a failure action.
    pub fn new<F, H>(execute: F, on_error: H) -> Self
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        H: FnOnce(E) + Send + 'static,
    {
        Self {
            execute: Box::pin(execute),
            on_error: Box::new(on_error),
        }
    }
}

/// A unit's action panicked instead of returning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPanic {
    message: String,
}

impl UnitPanic {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => message.to_string(),
                Err(_) => "non-string panic payload".to_string(),
            },
        };
        Self { message }
    }

    /// The panic message, when the payload was a string.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for UnitPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delivery unit panicked: {}", self.message)
    }
}

impl std::error::Error for UnitPanic {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Idle,
    Running,
    Halted,
}

struct QueueState<E> {
    pending: VecDeque<DeliveryUnit<E>>,
    lane: Lane,
}

struct Inner<E> {
    state: Mutex<QueueState<E>>,
    settled: Notify,
    /// Fired whenever a unit leaves `pending`.
    taken: Notify,
}

/// Strictly ordered, single-lane executor.
pub struct DeliveryQueue<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for DeliveryQueue<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: From<UnitPanic> + Send + 'static> Default for DeliveryQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: From<UnitPanic> + Send + 'static> DeliveryQueue<E> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    lane: Lane::Idle,
                }),
                settled: Notify::new(),
                taken: Notify::new(),
            }),
        }
    }

    /// Append a unit. Starts executing immediately if the lane is idle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn push(&self, unit: DeliveryUnit<E>) {
        let mut state = self.inner.state.lock();
        state.pending.push_back(unit);

        if state.lane == Lane::Idle {
            state.lane = Lane::Running;
            drop(state);
            tokio::spawn(drain(self.inner.clone()));
        }
    }

    /// Discard every unit that has not started yet.
    ///
    /// A unit already running is not cancelled. A halted queue becomes idle.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        let dropped = state.pending.len();
        state.pending.clear();

        if state.lane == Lane::Halted {
            state.lane = Lane::Idle;
        }
        drop(state);

        if dropped > 0 {
            debug!(dropped = dropped, "Discarded pending deliveries");
            self.inner.taken.notify_waiters();
        }
    }

    /// Number of units waiting to run.
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// True when nothing is running and nothing is pending.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.lane == Lane::Idle && state.pending.is_empty()
    }

    /// True when a failure halted the lane and `clear()` has not been called.
    pub fn is_halted(&self) -> bool {
        self.inner.state.lock().lane == Lane::Halted
    }

    /// Wait until fewer than `limit` units are waiting to run.
    pub async fn has_room(&self, limit: usize) {
        loop {
            let notified = self.inner.taken.notified();
            if self.pending_len() < limit {
                return;
            }
            notified.await;
        }
    }

    /// Wait until no unit is running (the lane is idle or halted).
    pub async fn settled(&self) {
        loop {
            let notified = self.inner.settled.notified();
            if self.inner.state.lock().lane != Lane::Running {
                return;
            }
            notified.await;
        }
    }
}

async fn drain<E: From<UnitPanic> + Send + 'static>(inner: Arc<Inner<E>>) {
    loop {
        let unit = {
            let mut state = inner.state.lock();
            match state.pending.pop_front() {
                Some(unit) => unit,
                None => {
                    state.lane = Lane::Idle;
                    drop(state);
                    inner.settled.notify_waiters();
                    return;
                }
            }
        };
        inner.taken.notify_waiters();

        let DeliveryUnit { execute, on_error } = unit;
        let outcome = AssertUnwindSafe(execute)
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                let panic = UnitPanic::from_payload(payload);
                error!(panic = %panic.message(), "Delivery unit panicked");
                Err(E::from(panic))
            });

        match outcome {
            Ok(()) => trace!("Delivery unit completed"),
            Err(err) => {
                inner.state.lock().lane = Lane::Halted;
                on_error(err);
                inner.settled.notify_waiters();
                return;
            }
        }
    }
}
