//! # Message Poller
//!
//! ## Responsibility
//! Tracks the top-level (parent interaction) message of an investigation and
//! republishes its latest state until the agent's final answer shows up.
//!
//! ## Guarantees
//! - One request in flight at a time: fetch, then sleep, then fetch again.
//! - Each successful fetch overwrites the published value; nothing is merged.
//! - A new [`setup`](MessagePoller::setup) supersedes the previous loop and
//!   results of the old loop are discarded even if they land late.
//! - Fetch failures are logged and retried next tick; aborts end the loop
//!   silently.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use crate::abort::AbortSignal;
use crate::api::{AgentApi, MessageRequest};
use crate::observable::Observable;
use crate::task::{lock, Epoch, FailureStreak, TaskSlot};
use crate::types::{final_answer_absent, MessageSearchResponse, TrackedId};

/// Decides, after each successful fetch, whether polling continues.
pub type MessagePredicate = Arc<dyn Fn(&MessageSearchResponse) -> bool + Send + Sync>;

pub const DEFAULT_MESSAGE_INTERVAL: Duration = Duration::from_secs(5);

/// Arguments to [`MessagePoller::setup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSetup {
    pub message_id: TrackedId,
    pub data_source_id: Option<String>,
}

pub struct MessagePoller {
    api: Arc<dyn AgentApi>,
    memory_container_id: TrackedId,
    interval: Duration,
    predicate: MessagePredicate,
    message: Observable<Option<MessageSearchResponse>>,
    tracked: Mutex<Option<MessageSetup>>,
    slot: TaskSlot,
}

impl std::fmt::Debug for MessagePoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePoller")
            .field("memory_container_id", &self.memory_container_id)
            .field("interval", &self.interval)
            .field("tracked", &*lock(&self.tracked))
            .finish_non_exhaustive()
    }
}

impl MessagePoller {
    /// Poller for messages of `memory_container_id`. Continues until the
    /// structured final answer is present unless overridden with
    /// [`continue_while`](Self::continue_while).
    pub fn new(api: Arc<dyn AgentApi>, memory_container_id: impl Into<TrackedId>) -> Self {
        Self {
            api,
            memory_container_id: memory_container_id.into(),
            interval: DEFAULT_MESSAGE_INTERVAL,
            predicate: Arc::new(|m: &MessageSearchResponse| final_answer_absent(Some(m))),
            message: Observable::new(None),
            tracked: Mutex::new(None),
            slot: TaskSlot::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn continue_while(
        mut self,
        predicate: impl Fn(&MessageSearchResponse) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    pub fn memory_container_id(&self) -> &str {
        &self.memory_container_id
    }

    /// Start polling `setup.message_id`, superseding any previous loop.
    ///
    /// The first fetch is issued immediately. Switching to a different
    /// message clears the published value. Must be called within a Tokio
    /// runtime.
    pub fn setup(&self, setup: MessageSetup) {
        let changed = {
            let mut tracked = lock(&self.tracked);
            let changed = tracked
                .as_ref()
                .map_or(true, |prev| prev.message_id != setup.message_id);
            *tracked = Some(setup.clone());
            changed
        };

        let run = MessageLoop {
            api: Arc::clone(&self.api),
            memory_container_id: self.memory_container_id.clone(),
            interval: self.interval,
            predicate: Arc::clone(&self.predicate),
            message: self.message.clone(),
            setup,
        };
        self.slot.replace(
            "Message poller re-setup",
            || {
                if changed {
                    self.message.set(None);
                }
            },
            move |epoch, signal| run.run(epoch, signal),
        );
    }

    /// Cancel the in-flight request and any scheduled tick. Idempotent.
    pub fn stop(&self, reason: &str) {
        if self.slot.cancel(reason) {
            debug!(reason, container = %self.memory_container_id, "message poller stopped");
        }
    }

    /// `true` while the poll loop is running.
    pub fn is_polling(&self) -> bool {
        self.slot.is_live()
    }

    /// Latest fetched value without subscribing.
    pub fn message_value(&self) -> Option<MessageSearchResponse> {
        self.message.value()
    }

    /// Read-only handle; `borrow()` gives the last-emitted value.
    pub fn subscribe(&self) -> watch::Receiver<Option<MessageSearchResponse>> {
        self.message.subscribe()
    }

    pub fn message_stream(&self) -> WatchStream<Option<MessageSearchResponse>> {
        self.message.stream()
    }
}

impl Drop for MessagePoller {
    fn drop(&mut self) {
        self.slot.cancel("Message poller dropped");
    }
}

struct MessageLoop {
    api: Arc<dyn AgentApi>,
    memory_container_id: TrackedId,
    interval: Duration,
    predicate: MessagePredicate,
    message: Observable<Option<MessageSearchResponse>>,
    setup: MessageSetup,
}

impl MessageLoop {
    async fn run(self, epoch: Epoch, signal: AbortSignal) {
        let mut failures = FailureStreak::default();
        let message_id = self.setup.message_id.as_str();

        loop {
            let req = MessageRequest {
                memory_container_id: self.memory_container_id.clone(),
                message_id: self.setup.message_id.clone(),
                data_source_id: self.setup.data_source_id.clone(),
            };

            match signal.guard(self.api.get_message(req, signal.clone())).await {
                Ok(resp) => {
                    failures.reset();
                    let keep_polling = (self.predicate)(&resp);
                    if epoch.apply(&signal, || self.message.set(Some(resp))).is_none() {
                        debug!(message_id, "discarding stale message response");
                        return;
                    }
                    if !keep_polling {
                        debug!(message_id, "message polling finished");
                        return;
                    }
                }
                Err(e) if e.is_abort() => {
                    debug!(message_id, reason = %e, "message poll aborted");
                    return;
                }
                Err(e) => failures.record("message", message_id, &e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = signal.aborted() => return,
            }
        }
    }
}
