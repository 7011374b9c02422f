//! # Trace Accumulator
//!
//! ## Responsibility
//! Collects the trace records (LLM calls, tool executions) of one executor
//! message on a fixed interval, paginating by the number of records already
//! held, until the step is known to be complete.
//!
//! ## Guarantees
//! - First tick fires immediately, then every `interval`; a tick's fetch is
//!   awaited before the next tick can fire.
//! - Within one session the list only ever grows. Opening a new target resets
//!   it to empty.
//! - Once [`should_load`] turns false the session is complete for that id and
//!   is not resumed until [`open`](TraceAccumulator::open) is called again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use crate::abort::AbortSignal;
use crate::api::{AgentApi, TraceRequest};
use crate::observable::Observable;
use crate::task::{lock, Epoch, FailureStreak, TaskSlot};
use crate::types::{final_answer_absent, AgentMessage, MessageSearchResponse, TraceRecord, TrackedId};

pub const DEFAULT_TRACE_INTERVAL: Duration = Duration::from_millis(5000);

/// Abort reason used when the accumulator is dropped.
pub const UNMOUNT_REASON: &str = "Flyout unmount.";

/// What a trace session is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceTarget {
    pub message_id: TrackedId,
    pub memory_container_id: TrackedId,
    pub executor_memory_id: TrackedId,
    pub data_source_id: Option<String>,
}

/// Whether the trace list for `message_id` may still grow.
///
/// Keeps loading while nothing has been fetched yet, or while the message is
/// the latest in its executor memory and either has no response or the
/// top-level final answer is still missing.
pub fn should_load(
    trace_count: usize,
    message_id: &str,
    executor_messages: &[AgentMessage],
    top_message: Option<&MessageSearchResponse>,
) -> bool {
    if trace_count == 0 {
        return true;
    }

    let is_last = executor_messages
        .last()
        .is_some_and(|m| m.message_id == message_id);
    if !is_last {
        return false;
    }

    let has_response = executor_messages
        .last()
        .is_some_and(AgentMessage::has_response);
    if !has_response {
        return true;
    }

    final_answer_absent(top_message)
}

pub struct TraceAccumulator {
    api: Arc<dyn AgentApi>,
    interval: Duration,
    message_rx: watch::Receiver<Option<MessageSearchResponse>>,
    executor_rx: watch::Receiver<Vec<AgentMessage>>,
    traces: Observable<Vec<TraceRecord>>,
    loading: Observable<bool>,
    target: Mutex<Option<TraceTarget>>,
    slot: TaskSlot,
}

impl std::fmt::Debug for TraceAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceAccumulator")
            .field("target", &*lock(&self.target))
            .field("interval", &self.interval)
            .field("traces", &self.traces.with(Vec::len))
            .finish_non_exhaustive()
    }
}

impl TraceAccumulator {
    /// `message_rx` carries the top-level message, `executor_rx` the executor
    /// memory's messages; both are read fresh after every tick.
    pub fn new(
        api: Arc<dyn AgentApi>,
        message_rx: watch::Receiver<Option<MessageSearchResponse>>,
        executor_rx: watch::Receiver<Vec<AgentMessage>>,
    ) -> Self {
        Self {
            api,
            interval: DEFAULT_TRACE_INTERVAL,
            message_rx,
            executor_rx,
            traces: Observable::new(Vec::new()),
            loading: Observable::new(false),
            target: Mutex::new(None),
            slot: TaskSlot::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Start accumulating traces for `target`, discarding any previous session.
    ///
    /// Must be called within a Tokio runtime.
    pub fn open(&self, target: TraceTarget) {
        *lock(&self.target) = Some(target.clone());

        let run = TraceLoop {
            api: Arc::clone(&self.api),
            interval: self.interval,
            message_rx: self.message_rx.clone(),
            executor_rx: self.executor_rx.clone(),
            traces: self.traces.clone(),
            loading: self.loading.clone(),
            target,
        };
        self.slot.replace(
            "Trace target changed.",
            || {
                self.traces.set(Vec::new());
                self.loading.set(true);
            },
            move |epoch, signal| run.run(epoch, signal),
        );
    }

    /// Abort the in-flight request and stop ticking. Idempotent.
    pub fn close(&self, reason: &str) {
        if self.slot.cancel(reason) {
            debug!(reason, "trace accumulator closed");
        }
        self.loading.set(false);
    }

    pub fn target(&self) -> Option<TraceTarget> {
        lock(&self.target).clone()
    }

    pub fn traces_value(&self) -> Vec<TraceRecord> {
        self.traces.value()
    }

    pub fn subscribe_traces(&self) -> watch::Receiver<Vec<TraceRecord>> {
        self.traces.subscribe()
    }

    pub fn traces_stream(&self) -> WatchStream<Vec<TraceRecord>> {
        self.traces.stream()
    }

    /// `true` until the session completes or is closed.
    pub fn is_loading(&self) -> bool {
        self.loading.value()
    }

    pub fn subscribe_loading(&self) -> watch::Receiver<bool> {
        self.loading.subscribe()
    }
}

impl Drop for TraceAccumulator {
    fn drop(&mut self) {
        self.slot.cancel(UNMOUNT_REASON);
    }
}

struct TraceLoop {
    api: Arc<dyn AgentApi>,
    interval: Duration,
    message_rx: watch::Receiver<Option<MessageSearchResponse>>,
    executor_rx: watch::Receiver<Vec<AgentMessage>>,
    traces: Observable<Vec<TraceRecord>>,
    loading: Observable<bool>,
    target: TraceTarget,
}

impl TraceLoop {
    fn should_continue(&self) -> bool {
        let trace_count = self.traces.with(Vec::len);
        let executor_messages = self.executor_rx.borrow();
        let top_message = self.message_rx.borrow();
        should_load(
            trace_count,
            &self.target.message_id,
            &executor_messages,
            (*top_message).as_ref(),
        )
    }

    async fn run(self, epoch: Epoch, signal: AbortSignal) {
        let mut failures = FailureStreak::default();
        let message_id = self.target.message_id.as_str();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = signal.aborted() => return,
            }

            let next_token = self.traces.with(Vec::len);
            let req = TraceRequest {
                memory_container_id: self.target.memory_container_id.clone(),
                executor_memory_id: self.target.executor_memory_id.clone(),
                message_id: self.target.message_id.clone(),
                next_token,
                data_source_id: self.target.data_source_id.clone(),
            };
            debug!(message_id, next_token, "trace tick");

            match signal.guard(self.api.list_traces(req, signal.clone())).await {
                Ok(batch) => {
                    failures.reset();
                    let applied = epoch.apply(&signal, || {
                        if !batch.is_empty() {
                            self.traces.update(|list| {
                                list.extend(batch);
                                true
                            });
                        }
                    });
                    if applied.is_none() {
                        return;
                    }
                }
                Err(e) if e.is_abort() => {
                    debug!(message_id, reason = %e, "trace poll aborted");
                    return;
                }
                Err(e) => failures.record("trace", message_id, &e),
            }

            if !self.should_continue() {
                debug!(
                    message_id,
                    traces = self.traces.with(Vec::len),
                    "trace loading complete"
                );
                epoch.apply(&signal, || self.loading.set(false));
                return;
            }
        }
    }
}
