//! Cancellable poll-loop handle shared by every poller.
//!
//! A [`TaskSlot`] owns at most one live loop. Replacing or cancelling it
//! bumps a generation counter and fires the loop's abort signal, so a
//! response that lands late is recognised as stale by [`Epoch::is_current`]
//! and dropped instead of being published.
//!
//! Loops publish through [`Epoch::apply`], which holds the slot's gate. The
//! gate is also held while the slot is replaced or cancelled, so a superseded
//! loop can never write after its successor's start-up state.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::abort::{AbortController, AbortSignal};
use crate::error::PollError;

/// Consecutive failures after which logging escalates from `warn` to `error`.
pub const FAILURE_ESCALATION: u32 = 5;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Generation token handed to one loop run.
#[derive(Debug, Clone)]
pub struct Epoch {
    counter: Arc<AtomicU64>,
    gate: Arc<Mutex<()>>,
    mine: u64,
}

impl Epoch {
    /// `false` once the owning slot was replaced or cancelled.
    pub fn is_current(&self) -> bool {
        self.counter.load(Ordering::SeqCst) == self.mine
    }

    /// Run `f` if this run is still current and `signal` has not fired.
    ///
    /// Returns `None` without calling `f` for a stale run.
    pub fn apply<R>(&self, signal: &AbortSignal, f: impl FnOnce() -> R) -> Option<R> {
        let _gate = lock(&self.gate);
        (self.is_current() && !signal.is_aborted()).then(f)
    }
}

/// Handle to one spawned poll loop.
#[derive(Debug)]
pub struct PollTask {
    abort: AbortController,
    handle: JoinHandle<()>,
}

impl PollTask {
    /// Fire the abort signal. The loop observes it at its next await point.
    pub fn cancel(&self, reason: &str) -> bool {
        self.abort.abort(reason)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Holder of the single live loop of one poller instance.
#[derive(Debug, Default)]
pub struct TaskSlot {
    counter: Arc<AtomicU64>,
    gate: Arc<Mutex<()>>,
    current: Mutex<Option<PollTask>>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the live loop (if any) with `reason` and spawn a new one.
    ///
    /// `on_start` runs after the old loop is invalidated and before the new
    /// one can publish; use it to reset published state. Must be called from
    /// within a Tokio runtime.
    pub fn replace<S, F, Fut>(&self, reason: &str, on_start: S, run: F)
    where
        S: FnOnce(),
        F: FnOnce(Epoch, AbortSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut current = lock(&self.current);
        let _gate = lock(&self.gate);
        if let Some(old) = current.take() {
            old.cancel(reason);
        }
        let mine = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        on_start();

        let epoch = Epoch {
            counter: Arc::clone(&self.counter),
            gate: Arc::clone(&self.gate),
            mine,
        };
        let abort = AbortController::new();
        let handle = tokio::spawn(run(epoch, abort.signal()));
        *current = Some(PollTask { abort, handle });
    }

    /// Cancel the live loop. Safe to call any number of times.
    ///
    /// Returns `true` if a loop was still running.
    pub fn cancel(&self, reason: &str) -> bool {
        let mut current = lock(&self.current);
        let _gate = lock(&self.gate);
        self.counter.fetch_add(1, Ordering::SeqCst);
        match current.take() {
            Some(task) => {
                let live = !task.is_finished();
                task.cancel(reason);
                live
            }
            None => false,
        }
    }

    /// `true` while a spawned loop has not yet returned.
    pub fn is_live(&self) -> bool {
        lock(&self.current)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

/// Tracks consecutive fetch failures for one loop and logs them.
#[derive(Debug, Default)]
pub(crate) struct FailureStreak {
    consecutive: u32,
}

impl FailureStreak {
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn record(&mut self, poller: &'static str, tracked_id: &str, err: &PollError) {
        self.consecutive = self.consecutive.saturating_add(1);
        let consecutive_failures = self.consecutive;
        if consecutive_failures >= FAILURE_ESCALATION {
            error!(
                error = %err,
                poller,
                tracked_id,
                consecutive_failures,
                "poll failed repeatedly, will retry next tick"
            );
        } else {
            warn!(error = %err, poller, tracked_id, "poll failed, will retry next tick");
        }
    }

    #[cfg(test)]
    pub fn count(&self) -> u32 {
        self.consecutive
    }
}
