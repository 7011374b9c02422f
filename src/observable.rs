//! # Observable state cell
//!
//! ## Responsibility
//! Single-writer / multi-reader versioned cell that pollers publish into and
//! consumers read from. Backed by [`tokio::sync::watch`], so every update
//! bumps the version and wakes subscribers synchronously.
//!
//! ## Guarantees
//! - A new subscriber can read the last-emitted value immediately.
//! - Consumers only ever get read-only handles ([`watch::Receiver`] or
//!   [`WatchStream`]); writes stay with the owning poller.
//! - Writes never fail, even with zero subscribers.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// Shared observable value. Clones refer to the same cell.
#[derive(Debug)]
pub struct Observable<T> {
    tx: Arc<watch::Sender<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Snapshot of the current value.
    pub fn value(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Read the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Replace the value and notify subscribers.
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Mutate in place; subscribers are only notified when `f` returns `true`.
    pub fn update(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Stream yielding the current value first, then every change.
    pub fn stream(&self) -> WatchStream<T> {
        WatchStream::new(self.tx.subscribe())
    }
}
