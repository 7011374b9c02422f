//! # Memory Poller
//!
//! ## Responsibility
//! Keeps an ordered, de-duplicated list of the messages in one executor
//! memory, fetching incrementally from `next_token = known length`, and
//! publishes both the list and whether the poll loop is running.
//!
//! ## Guarantees
//! - The list only grows (or has entries replaced in place) while polling.
//! - The same `message_id` never appears twice; last write wins.
//! - The continuation predicate is re-evaluated after every tick and again
//!   when the wait ends; once it is false the loop ends at once and the
//!   polling state drops. A result already in flight is still applied.
//! - [`start_polling`](MemoryPoller::start_polling) never overlaps ticks and
//!   only wakes the loop that is live when it is called.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use crate::abort::AbortSignal;
use crate::api::{AgentApi, MemoryRequest};
use crate::observable::Observable;
use crate::task::{lock, Epoch, FailureStreak, TaskSlot};
use crate::types::{AgentMessage, TrackedId};

/// Caller-supplied continuation check, called fresh before each tick.
pub type ContinuePredicate = Arc<dyn Fn() -> bool + Send + Sync>;

pub const DEFAULT_MEMORY_INTERVAL: Duration = Duration::from_secs(5);

/// The memory container / executor memory pair a poller is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTarget {
    pub memory_container_id: TrackedId,
    pub executor_memory_id: TrackedId,
}

/// Arguments to [`MemoryPoller::setup`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemorySetup {
    pub data_source_id: Option<String>,
}

/// Merge `batch` into `list`: known ids are replaced in place, new ids are
/// appended in batch order. Returns `true` if `list` changed.
pub fn merge_messages(list: &mut Vec<AgentMessage>, batch: Vec<AgentMessage>) -> bool {
    let mut index: HashMap<String, usize> = list
        .iter()
        .enumerate()
        .map(|(i, m)| (m.message_id.clone(), i))
        .collect();
    let mut changed = false;

    for msg in batch {
        match index.get(&msg.message_id) {
            Some(&i) => {
                if list[i] != msg {
                    list[i] = msg;
                    changed = true;
                }
            }
            None => {
                index.insert(msg.message_id.clone(), list.len());
                list.push(msg);
                changed = true;
            }
        }
    }
    changed
}

pub struct MemoryPoller {
    api: Arc<dyn AgentApi>,
    target: MemoryTarget,
    interval: Duration,
    predicate: ContinuePredicate,
    messages: Observable<Vec<AgentMessage>>,
    polling: Observable<bool>,
    /// Wake handle of the current loop; replaced for every new loop.
    wake: Mutex<Arc<Notify>>,
    last_setup: Mutex<Option<MemorySetup>>,
    slot: TaskSlot,
}

impl std::fmt::Debug for MemoryPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPoller")
            .field("target", &self.target)
            .field("interval", &self.interval)
            .field("known", &self.messages.with(Vec::len))
            .finish_non_exhaustive()
    }
}

impl MemoryPoller {
    pub fn new(
        api: Arc<dyn AgentApi>,
        target: MemoryTarget,
        predicate: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            api,
            target,
            interval: DEFAULT_MEMORY_INTERVAL,
            predicate: Arc::new(predicate),
            messages: Observable::new(Vec::new()),
            polling: Observable::new(false),
            wake: Mutex::new(Arc::new(Notify::new())),
            last_setup: Mutex::new(None),
            slot: TaskSlot::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn target(&self) -> &MemoryTarget {
        &self.target
    }

    /// Begin polling. Replaces any running loop; the known list is kept so
    /// the next fetch resumes from its length. Must be called within a Tokio
    /// runtime.
    pub fn setup(&self, setup: MemorySetup) {
        *lock(&self.last_setup) = Some(setup.clone());
        self.spawn_loop(setup, "Memory poller re-setup");
    }

    /// Force an immediate extra tick.
    ///
    /// Wakes the live loop if there is one (a fetch already in flight is
    /// allowed to finish first), otherwise restarts polling with the last
    /// setup. A no-op before the first [`setup`](Self::setup).
    pub fn start_polling(&self) {
        if self.slot.is_live() {
            lock(&self.wake).notify_one();
            return;
        }
        let last = lock(&self.last_setup).clone();
        match last {
            Some(setup) => self.spawn_loop(setup, "Memory poller restart"),
            None => debug!(
                executor_memory_id = %self.target.executor_memory_id,
                "start_polling before setup ignored"
            ),
        }
    }

    /// Halt the loop and abort any in-flight request. Idempotent.
    pub fn stop(&self, reason: &str) {
        if self.slot.cancel(reason) {
            debug!(
                reason,
                executor_memory_id = %self.target.executor_memory_id,
                "memory poller stopped"
            );
        }
        self.polling.set(false);
    }

    pub fn messages_value(&self) -> Vec<AgentMessage> {
        self.messages.value()
    }

    pub fn subscribe_messages(&self) -> watch::Receiver<Vec<AgentMessage>> {
        self.messages.subscribe()
    }

    pub fn messages_stream(&self) -> WatchStream<Vec<AgentMessage>> {
        self.messages.stream()
    }

    pub fn is_polling(&self) -> bool {
        self.polling.value()
    }

    pub fn subscribe_polling_state(&self) -> watch::Receiver<bool> {
        self.polling.subscribe()
    }

    pub fn polling_state_stream(&self) -> WatchStream<bool> {
        self.polling.stream()
    }

    fn spawn_loop(&self, setup: MemorySetup, reason: &str) {
        let wake = Arc::new(Notify::new());
        *lock(&self.wake) = Arc::clone(&wake);
        let run = MemoryLoop {
            api: Arc::clone(&self.api),
            target: self.target.clone(),
            interval: self.interval,
            predicate: Arc::clone(&self.predicate),
            messages: self.messages.clone(),
            polling: self.polling.clone(),
            wake,
            setup,
        };
        self.slot.replace(
            reason,
            || self.polling.set(true),
            move |epoch, signal| run.run(epoch, signal),
        );
    }
}

impl Drop for MemoryPoller {
    fn drop(&mut self) {
        self.slot.cancel("Memory poller dropped");
    }
}

struct MemoryLoop {
    api: Arc<dyn AgentApi>,
    target: MemoryTarget,
    interval: Duration,
    predicate: ContinuePredicate,
    messages: Observable<Vec<AgentMessage>>,
    polling: Observable<bool>,
    wake: Arc<Notify>,
    setup: MemorySetup,
}

impl MemoryLoop {
    async fn run(self, epoch: Epoch, signal: AbortSignal) {
        let mut failures = FailureStreak::default();
        let executor_memory_id = self.target.executor_memory_id.as_str();

        loop {
            let next_token = self.messages.with(Vec::len);
            let req = MemoryRequest {
                memory_container_id: self.target.memory_container_id.clone(),
                executor_memory_id: self.target.executor_memory_id.clone(),
                next_token,
                data_source_id: self.setup.data_source_id.clone(),
            };
            debug!(executor_memory_id, next_token, "memory tick");

            match signal
                .guard(self.api.list_memory_messages(req, signal.clone()))
                .await
            {
                Ok(batch) => {
                    failures.reset();
                    let applied = epoch.apply(&signal, || {
                        self.messages.update(|list| merge_messages(list, batch))
                    });
                    if applied.is_none() {
                        return;
                    }
                }
                Err(e) if e.is_abort() => {
                    debug!(executor_memory_id, reason = %e, "memory poll aborted");
                    return;
                }
                Err(e) => failures.record("memory", executor_memory_id, &e),
            }

            if !(self.predicate)() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.wake.notified() => {
                    debug!(executor_memory_id, "memory poll woken early");
                }
                _ = signal.aborted() => return,
            }

            if !(self.predicate)() {
                break;
            }
        }

        debug!(executor_memory_id, "memory polling finished");
        epoch.apply(&signal, || self.polling.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::{msg, ScriptedApi};
    use crate::error::PollError;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn target() -> MemoryTarget {
        MemoryTarget {
            memory_container_id: "c1".into(),
            executor_memory_id: "e1".into(),
        }
    }

    fn ids(list: &[AgentMessage]) -> Vec<&str> {
        list.iter().map(|m| m.message_id.as_str()).collect()
    }

    #[test]
    fn merge_appends_new_and_replaces_known() {
        let mut list = vec![msg("a", None), msg("b", None)];
        let changed = merge_messages(&mut list, vec![msg("b", Some("done")), msg("c", None)]);
        assert!(changed);
        assert_eq!(ids(&list), vec!["a", "b", "c"]);
        assert_eq!(list[1].response.as_deref(), Some("done"));
    }

    #[test]
    fn merge_identical_batch_is_noop() {
        let mut list = vec![msg("a", Some("x"))];
        assert!(!merge_messages(&mut list, vec![msg("a", Some("x"))]));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn merge_dedups_within_batch() {
        let mut list = Vec::new();
        merge_messages(&mut list, vec![msg("a", None), msg("a", Some("second"))]);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].response.as_deref(), Some("second"));
    }

    proptest! {
        #[test]
        fn merge_never_duplicates_and_never_shrinks(
            batches in prop::collection::vec(prop::collection::vec(0u8..12, 0..6), 0..8)
        ) {
            let mut list = Vec::new();
            for batch in batches {
                let before = list.len();
                let batch: Vec<AgentMessage> =
                    batch.iter().map(|n| msg(&format!("m{n}"), None)).collect();
                merge_messages(&mut list, batch);
                prop_assert!(list.len() >= before);
                let mut seen = std::collections::HashSet::new();
                for m in &list {
                    prop_assert!(seen.insert(m.message_id.clone()));
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cursor_follows_known_length() {
        let api = Arc::new(ScriptedApi::default());
        api.push_memory(Ok(vec![msg("a", None), msg("b", None)]));
        api.push_memory(Ok(vec![]));
        api.push_memory(Ok(vec![msg("c", None), msg("d", None), msg("e", None)]));
        let poller = MemoryPoller::new(api.clone(), target(), || true);

        poller.setup(MemorySetup { data_source_id: Some("ds".into()) });
        tokio::time::sleep(Duration::from_secs(11)).await;
        poller.stop("test done");

        let tokens: Vec<usize> = api.memory_calls().iter().map(|c| c.next_token).collect();
        assert_eq!(tokens, vec![0, 2, 2]);
        assert_eq!(ids(&poller.messages_value()), vec!["a", "b", "c", "d", "e"]);
        assert_eq!(api.memory_calls()[0].data_source_id.as_deref(), Some("ds"));
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_false_after_first_tick_stops() {
        let api = Arc::new(ScriptedApi::default());
        api.push_memory(Ok(vec![msg("a", None)]));
        let poller = MemoryPoller::new(api.clone(), target(), || false);
        let mut state = poller.subscribe_polling_state();

        poller.setup(MemorySetup::default());
        assert!(poller.is_polling());
        state.wait_for(|p| !*p).await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.memory_calls().len(), 1);
        assert_eq!(poller.messages_value().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_state_drops_right_after_final_tick() {
        let api = Arc::new(ScriptedApi::default());
        api.push_memory(Ok(vec![msg("a", None)]));
        let poller = MemoryPoller::new(api.clone(), target(), || false)
            .with_interval(Duration::from_secs(60));

        poller.setup(MemorySetup::default());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(api.memory_calls().len(), 1);
        assert_eq!(poller.messages_value().len(), 1);
        assert!(!poller.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn wake_before_stop_does_not_leak_into_next_setup() {
        let api = Arc::new(ScriptedApi::with_latency(Duration::from_secs(2)));
        let poller = MemoryPoller::new(api.clone(), target(), || true)
            .with_interval(Duration::from_secs(60));

        poller.setup(MemorySetup::default());
        tokio::time::sleep(Duration::from_millis(500)).await;
        poller.start_polling();
        poller.stop("Component unmount");

        poller.setup(MemorySetup::default());
        tokio::time::sleep(Duration::from_secs(10)).await;
        poller.stop("test done");

        // One aborted fetch from the first setup, one from the second.
        assert_eq!(api.memory_calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_result_applied_when_predicate_flips() {
        let api = Arc::new(ScriptedApi::with_latency(Duration::from_secs(2)));
        api.push_memory(Ok(vec![msg("a", None)]));
        api.push_memory(Ok(vec![msg("b", None)]));
        let keep = Arc::new(AtomicBool::new(true));
        let keep2 = Arc::clone(&keep);
        let poller = MemoryPoller::new(api.clone(), target(), move || keep2.load(Ordering::SeqCst))
            .with_interval(Duration::from_secs(1));

        poller.setup(MemorySetup::default());
        // Second tick starts at t=3s and resolves at t=5s.
        tokio::time::sleep(Duration::from_secs(4)).await;
        keep.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(api.memory_calls().len(), 2);
        assert_eq!(ids(&poller.messages_value()), vec!["a", "b"]);
        assert!(!poller.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn start_polling_forces_extra_tick() {
        let api = Arc::new(ScriptedApi::default());
        let poller = MemoryPoller::new(api.clone(), target(), || true)
            .with_interval(Duration::from_secs(60));

        poller.setup(MemorySetup::default());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(api.memory_calls().len(), 1);

        poller.start_polling();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(api.memory_calls().len(), 2);
        poller.stop("done");
    }

    #[tokio::test(start_paused = true)]
    async fn start_polling_restarts_finished_loop() {
        let api = Arc::new(ScriptedApi::default());
        api.push_memory(Ok(vec![msg("a", None)]));
        api.push_memory(Ok(vec![msg("b", None)]));
        let poller = MemoryPoller::new(api.clone(), target(), || false);

        poller.start_polling();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(api.memory_calls().is_empty(), "no-op before setup");

        poller.setup(MemorySetup::default());
        tokio::time::sleep(Duration::from_secs(10)).await;
        poller.start_polling();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let tokens: Vec<usize> = api.memory_calls().iter().map(|c| c.next_token).collect();
        assert_eq!(tokens, vec![0, 1]);
        assert_eq!(ids(&poller.messages_value()), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_resolution_leaves_state_untouched() {
        let api = Arc::new(ScriptedApi::with_latency(Duration::from_secs(3)));
        api.push_memory(Ok(vec![msg("late", None)]));
        let poller = MemoryPoller::new(api.clone(), target(), || true);

        poller.setup(MemorySetup::default());
        tokio::time::sleep(Duration::from_secs(1)).await;
        poller.stop("Component unmount");
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(poller.messages_value().is_empty());
        assert!(!poller.is_polling());
        assert_eq!(api.memory_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_keeps_polling() {
        let api = Arc::new(ScriptedApi::default());
        api.push_memory(Err(PollError::Connect { url: "u".into(), detail: "refused".into() }));
        api.push_memory(Ok(vec![msg("a", None)]));
        let poller = MemoryPoller::new(api.clone(), target(), || true);

        poller.setup(MemorySetup::default());
        tokio::time::sleep(Duration::from_secs(6)).await;
        poller.stop("done");

        let tokens: Vec<usize> = api.memory_calls().iter().map(|c| c.next_token).collect();
        assert_eq!(tokens, vec![0, 0]);
        assert_eq!(poller.messages_value().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_container_keeps_polling_per_predicate() {
        let api = Arc::new(ScriptedApi::default());
        let poller = MemoryPoller::new(api.clone(), target(), || true);

        poller.setup(MemorySetup::default());
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert!(poller.messages_value().is_empty());
        assert!(poller.is_polling());
        assert_eq!(api.memory_calls().len(), 3);
        poller.stop("done");
    }
}
