//! Cancellation signal threaded through every outstanding request.
//!
//! An [`AbortController`] owns the signal; any number of [`AbortSignal`]
//! clones observe it. Aborting is one-shot and the first reason sticks.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::PollError;

/// Owner side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct AbortController {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Trigger the abort. Returns `false` when it had already been aborted.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn is_aborted(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

/// Observer side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<Option<String>>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Resolve with the abort reason once aborted.
    ///
    /// Never resolves if the controller is dropped without aborting.
    pub async fn aborted(&self) -> String {
        let mut rx = self.rx.clone();
        // The watch guard must not live across the pending await below.
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map(|reason| reason.clone().unwrap_or_default());
        match outcome {
            Ok(reason) => reason,
            Err(_) => std::future::pending().await,
        }
    }

    /// Race `fut` against the abort.
    ///
    /// # Errors
    /// Returns [`PollError::Aborted`] when the abort fires first (or had
    /// already fired), otherwise whatever `fut` resolves to.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, PollError>
    where
        F: Future<Output = Result<T, PollError>>,
    {
        if let Some(reason) = self.reason() {
            return Err(PollError::Aborted { reason });
        }
        tokio::select! {
            biased;
            reason = self.aborted() => Err(PollError::Aborted { reason }),
            res = fut => res,
        }
    }
}
