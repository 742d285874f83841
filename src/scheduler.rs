// src/scheduler.rs
//
// The worker pool coordinator.
//
// Guarantees:
// - at most `max_parallel` transcodes in flight, never more
// - an id is never simultaneously queued and active
// - no item is dispatched twice for one admission
// - cancellation mid-flight never surfaces a stale result
//
// All shared state (item table, admission queue, active set, cancellation
// registry, event backlog) lives behind a single mutex so drain decisions
// always see one consistent view. The claim step runs entirely under that
// lock, which serializes concurrent drains. Listener callbacks run with no
// scheduler lock held, drained by a single pump at a time to keep per-id
// ordering.

mod events;
mod item;
mod queue;

pub use events::{StateChange, Subscription};
pub use item::{ItemId, ItemSnapshot, ItemState, Submission};

use crate::engine::common::run_with_panic_policy;
use crate::engine::pool;
use crate::engine::service::{TranscodeOutput, TranscodeRequest, TranscodeService};
use crate::error::Result;
use events::ListenerTable;
use item::Item;
use parking_lot::{Condvar, Mutex};
use queue::AdmissionQueue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default number of concurrently active transcodes.
pub const MAX_PARALLEL: usize = 3;

/// Hard upper bound for configured parallelism.
pub const MAX_CONCURRENCY: usize = 1024;

/// Scheduler tuning. `max_parallel` bounds in-flight transcodes; the worker
/// pool behind them is sized separately (see engine::pool).
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    pub max_parallel: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: MAX_PARALLEL,
        }
    }
}

impl SchedulerConfig {
    /// Default config with an optional BATCHPRESS_MAX_PARALLEL override.
    pub fn from_env() -> Self {
        let max_parallel = std::env::var("BATCHPRESS_MAX_PARALLEL")
            .ok()
            .and_then(|raw| raw.parse::<usize>().ok())
            .unwrap_or(MAX_PARALLEL);
        Self { max_parallel }.normalized()
    }

    pub fn with_max_parallel(max_parallel: usize) -> Self {
        Self { max_parallel }.normalized()
    }

    fn normalized(mut self) -> Self {
        self.max_parallel = self.max_parallel.clamp(1, MAX_CONCURRENCY);
        self
    }
}

struct State {
    items: HashMap<ItemId, Item>,
    queue: AdmissionQueue,
    active: HashSet<ItemId>,
    cancelled: HashSet<ItemId>,
    pending_events: VecDeque<StateChange>,
    pumping: bool,
}

impl State {
    fn new() -> Self {
        Self {
            items: HashMap::new(),
            queue: AdmissionQueue::new(),
            active: HashSet::new(),
            cancelled: HashSet::new(),
            pending_events: VecDeque::new(),
            pumping: false,
        }
    }

    fn is_idle(&self) -> bool {
        self.active.is_empty() && self.queue.is_empty()
    }
}

struct Inner {
    service: Arc<dyn TranscodeService>,
    max_parallel: usize,
    state: Mutex<State>,
    idle: Condvar,
    listeners: Mutex<ListenerTable>,
    next_id: AtomicU64,
}

/// Bounded-concurrency batch coordinator. Cheap to clone; all clones share
/// the same queue, slots and item table.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(service: impl TranscodeService) -> Self {
        Self::with_config(service, SchedulerConfig::from_env())
    }

    pub fn with_config(service: impl TranscodeService, config: SchedulerConfig) -> Self {
        let config = config.normalized();
        Self {
            inner: Arc::new(Inner {
                service: Arc::new(service),
                max_parallel: config.max_parallel,
                state: Mutex::new(State::new()),
                idle: Condvar::new(),
                listeners: Mutex::new(ListenerTable::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Admit a batch of items. Never blocks on transcode work.
    ///
    /// Idempotent per id: a submission reusing an id that is already queued
    /// or active is a no-op, and one reusing a `Complete` id is left alone.
    /// Reusing an `Error` or `Cancelled` id re-admits the item as a fresh
    /// submission. Returns the id of every submission, assigned or reused.
    pub fn submit(&self, submissions: Vec<Submission>) -> Vec<ItemId> {
        let ids = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            let mut ids = Vec::with_capacity(submissions.len());
            for submission in submissions {
                let id = submission
                    .id
                    .unwrap_or_else(|| ItemId(self.inner.next_id.fetch_add(1, Ordering::Relaxed)));
                ids.push(id);
                self.inner.admit(st, id, submission);
            }
            ids
        };
        self.inner.drain();
        ids
    }

    /// Best-effort cancellation. Queued items become `Cancelled` synchronously
    /// and are never dispatched. Active items keep their transcode running,
    /// but its eventual settle is discarded. Terminal items are untouched.
    pub fn cancel(&self, id: ItemId) {
        {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            let Some(item) = st.items.get_mut(&id) else {
                tracing::debug!(%id, "cancel for unknown id ignored");
                return;
            };
            match item.state {
                ItemState::Pending => {
                    st.queue.remove(id);
                    if item.transition(ItemState::Cancelled) {
                        st.cancelled.insert(id);
                        st.pending_events.push_back(StateChange::Cancelled { id });
                        tracing::debug!(%id, "cancelled while queued");
                    }
                }
                ItemState::Processing => {
                    if item.transition(ItemState::Cancelled) {
                        // Cooperative: the in-flight call runs to completion,
                        // settle() discards its payload.
                        st.cancelled.insert(id);
                        st.pending_events.push_back(StateChange::Cancelled { id });
                        tracing::debug!(%id, "cancelled while in flight; result will be discarded");
                    }
                }
                ItemState::Complete | ItemState::Error | ItemState::Cancelled => {}
            }
            self.inner.notify_if_idle(st);
        }
        self.inner.drain();
    }

    /// Re-admit a terminal `Error` or `Cancelled` item, reusing its stored
    /// source bytes and options. Returns whether the item was re-admitted.
    pub fn retry(&self, id: ItemId) -> bool {
        let readmitted = {
            let mut guard = self.inner.state.lock();
            let st = &mut *guard;
            match st.items.get_mut(&id) {
                Some(item)
                    if matches!(item.state, ItemState::Error | ItemState::Cancelled) =>
                {
                    if item.transition(ItemState::Pending) {
                        item.reset_for_readmission();
                        st.cancelled.remove(&id);
                        st.queue.push(id);
                        st.pending_events.push_back(StateChange::Queued { id });
                        tracing::debug!(%id, "re-admitted for retry");
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            }
        };
        if readmitted {
            self.inner.drain();
        }
        readmitted
    }

    /// Observe state transitions. Every transition is delivered exactly once,
    /// in per-id order. The callback runs without scheduler locks held and may
    /// call back into the scheduler.
    pub fn subscribe(
        &self,
        listener: impl Fn(&StateChange) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.listeners.lock().subscribe(Arc::new(listener))
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.inner.listeners.lock().unsubscribe(subscription)
    }

    /// Number of transcodes currently in flight.
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    /// Number of items waiting for a slot.
    pub fn queue_length(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn max_parallel(&self) -> usize {
        self.inner.max_parallel
    }

    /// Read-only view of one item.
    pub fn snapshot(&self, id: ItemId) -> Option<ItemSnapshot> {
        self.inner.state.lock().items.get(&id).map(ItemSnapshot::of)
    }

    /// Compressed bytes of a completed item, for download/preview.
    pub fn result(&self, id: ItemId) -> Option<Arc<Vec<u8>>> {
        self.inner
            .state
            .lock()
            .items
            .get(&id)
            .and_then(|item| item.result_bytes.clone())
    }

    /// Read-only view of every known item, ordered by id.
    pub fn snapshots(&self) -> Vec<ItemSnapshot> {
        let guard = self.inner.state.lock();
        let mut all: Vec<ItemSnapshot> = guard.items.values().map(ItemSnapshot::of).collect();
        all.sort_by_key(|snapshot| snapshot.id);
        all
    }

    /// Block until the queue and active set are both empty, or the timeout
    /// elapses. Returns whether the scheduler went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.state.lock();
        while !guard.is_idle() {
            if self
                .inner
                .idle
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return guard.is_idle();
            }
        }
        true
    }
}

impl Inner {
    /// Admission of one submission under the state lock.
    fn admit(&self, st: &mut State, id: ItemId, submission: Submission) {
        use std::collections::hash_map::Entry;

        match st.items.entry(id) {
            Entry::Occupied(mut entry) => {
                let item = entry.get_mut();
                match item.state {
                    ItemState::Pending | ItemState::Processing => {
                        // Already owned by the queue or a slot: duplicate
                        // submission is a no-op.
                        tracing::debug!(%id, state = ?item.state, "duplicate submission ignored");
                    }
                    ItemState::Complete => {
                        tracing::debug!(%id, "submission for completed id ignored");
                    }
                    ItemState::Error | ItemState::Cancelled => {
                        // Fresh submission reusing the id
                        if item.transition(ItemState::Pending) {
                            item.name = submission.name;
                            item.source_bytes = submission.bytes;
                            item.source_format = submission.source_format;
                            item.options = submission.options;
                            item.reset_for_readmission();
                            st.cancelled.remove(&id);
                            st.queue.push(id);
                            st.pending_events.push_back(StateChange::Queued { id });
                        }
                    }
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Item::new(id, submission));
                st.queue.push(id);
                st.pending_events.push_back(StateChange::Queued { id });
            }
        }
    }

    /// Move queued items into free slots and dispatch them.
    ///
    /// The claim step runs entirely under the state lock, so a drain racing
    /// another drain (or a settle) can never double-claim an item. Dispatch
    /// happens after the lock is released; each claimed item runs
    /// independently and settles on its own.
    fn drain(self: &Arc<Self>) {
        let jobs = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let mut jobs = Vec::new();
            while st.active.len() < self.max_parallel {
                let Some(id) = st.queue.pop_front() else { break };
                if st.cancelled.contains(&id) {
                    // Dropped permanently, never dispatched. cancel() already
                    // moved the state; this guard only covers a registry entry
                    // that outlived its queue removal.
                    if let Some(item) = st.items.get_mut(&id) {
                        if item.state != ItemState::Cancelled
                            && item.transition(ItemState::Cancelled)
                        {
                            st.pending_events.push_back(StateChange::Cancelled { id });
                        }
                    }
                    continue;
                }
                let Some(item) = st.items.get_mut(&id) else {
                    continue;
                };
                if !item.transition(ItemState::Processing) {
                    continue;
                }
                st.active.insert(id);
                st.pending_events.push_back(StateChange::Processing { id });
                jobs.push((
                    id,
                    TranscodeRequest::new(
                        Arc::clone(&item.source_bytes),
                        item.source_format,
                        item.options,
                    ),
                ));
            }
            if !jobs.is_empty() {
                tracing::debug!(
                    claimed = jobs.len(),
                    active = st.active.len(),
                    queued = st.queue.len(),
                    "drained queue into free slots"
                );
            }
            self.notify_if_idle(st);
            jobs
        };

        for (id, request) in jobs {
            let inner = Arc::clone(self);
            pool::get_pool().spawn(move || {
                // A panicking service must not take down the worker thread;
                // it settles this one item with an error instead.
                let result: Result<TranscodeOutput> =
                    run_with_panic_policy("transcode", || inner.service.transcode(&request));
                inner.settle(id, result);
            });
        }

        self.pump_events();
    }

    /// Reconcile one settled transcode: release the slot, consult the
    /// cancellation registry, record the outcome, re-drain.
    fn settle(self: &Arc<Self>, id: ItemId, result: Result<TranscodeOutput>) {
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if !st.active.remove(&id) {
                // Not in a slot: a stale or duplicate settle must be a no-op.
                tracing::warn!(%id, "stale settle ignored");
                return;
            }
            if st.cancelled.contains(&id) {
                tracing::debug!(%id, "settle for cancelled item discarded");
            } else if let Some(item) = st.items.get_mut(&id) {
                match result {
                    Ok(output) => {
                        if item.transition(ItemState::Complete) {
                            let bytes = Arc::new(output.bytes);
                            item.result_bytes = Some(Arc::clone(&bytes));
                            item.metrics = Some(output.metrics);
                            st.pending_events.push_back(StateChange::Completed { id, bytes });
                        }
                    }
                    Err(err) => {
                        if item.transition(ItemState::Error) {
                            let message = err.to_string();
                            item.error_message = Some(message.clone());
                            st.pending_events.push_back(StateChange::Failed { id, message });
                        }
                    }
                }
            }
            self.notify_if_idle(st);
        }
        self.drain();
    }

    /// Drain queued state-change events, one pump at a time.
    ///
    /// Events are queued under the state lock in transition order; a single
    /// active pump preserves that order while emitting with no locks held.
    fn pump_events(&self) {
        {
            let mut st = self.state.lock();
            if st.pumping {
                return;
            }
            st.pumping = true;
        }
        loop {
            let event = {
                let mut st = self.state.lock();
                match st.pending_events.pop_front() {
                    Some(event) => event,
                    None => {
                        st.pumping = false;
                        return;
                    }
                }
            };
            let listeners = self.listeners.lock().snapshot();
            for listener in listeners {
                listener(&event);
            }
        }
    }

    fn notify_if_idle(&self, st: &State) {
        if st.is_idle() {
            self.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BatchError;
    use crate::ops::{EncodeOptions, OutputFormat, SourceFormat};

    /// Instantly-settling service used for unit-level checks.
    struct EchoService;

    impl TranscodeService for EchoService {
        fn transcode(&self, request: &TranscodeRequest) -> Result<TranscodeOutput> {
            Ok(TranscodeOutput::from_bytes(request.bytes.as_ref().clone()))
        }
    }

    fn submission(name: &str) -> Submission {
        Submission::new(
            name,
            vec![1, 2, 3, 4],
            SourceFormat::Png,
            EncodeOptions::new(OutputFormat::WebP { quality: 75 }),
        )
    }

    #[test]
    fn test_submit_assigns_distinct_ids() {
        let scheduler = Scheduler::with_config(EchoService, SchedulerConfig::default());
        let ids = scheduler.submit(vec![submission("a"), submission("b")]);
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert!(scheduler.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_items_reach_complete() {
        let scheduler = Scheduler::with_config(EchoService, SchedulerConfig::default());
        let ids = scheduler.submit(vec![submission("a")]);
        assert!(scheduler.wait_idle(Duration::from_secs(5)));
        let snapshot = scheduler.snapshot(ids[0]).unwrap();
        assert_eq!(snapshot.state, ItemState::Complete);
        assert_eq!(snapshot.result_size, Some(4));
    }

    #[test]
    fn test_cancel_unknown_id_is_noop() {
        let scheduler = Scheduler::with_config(EchoService, SchedulerConfig::default());
        scheduler.cancel(ItemId(999));
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn test_retry_requires_terminal_failure() {
        let scheduler = Scheduler::with_config(EchoService, SchedulerConfig::default());
        let ids = scheduler.submit(vec![submission("a")]);
        assert!(scheduler.wait_idle(Duration::from_secs(5)));
        // Complete items are not retryable
        assert!(!scheduler.retry(ids[0]));
        assert!(!scheduler.retry(ItemId(424242)));
    }

    #[test]
    fn test_failed_item_records_message_and_retries() {
        struct FailingService;
        impl TranscodeService for FailingService {
            fn transcode(&self, _request: &TranscodeRequest) -> Result<TranscodeOutput> {
                Err(BatchError::decode_failed("simulated decode error"))
            }
        }

        let scheduler = Scheduler::with_config(FailingService, SchedulerConfig::default());
        let ids = scheduler.submit(vec![submission("a")]);
        assert!(scheduler.wait_idle(Duration::from_secs(5)));

        let snapshot = scheduler.snapshot(ids[0]).unwrap();
        assert_eq!(snapshot.state, ItemState::Error);
        let message = snapshot.error_message.unwrap();
        assert!(message.contains("simulated decode error"));

        assert!(scheduler.retry(ids[0]));
        assert!(scheduler.wait_idle(Duration::from_secs(5)));
        // Still failing, but it went around again
        assert_eq!(scheduler.snapshot(ids[0]).unwrap().state, ItemState::Error);
    }

    #[test]
    fn test_config_normalization() {
        assert_eq!(SchedulerConfig::with_max_parallel(0).max_parallel, 1);
        assert_eq!(
            SchedulerConfig::with_max_parallel(1 << 20).max_parallel,
            MAX_CONCURRENCY
        );
        assert_eq!(SchedulerConfig::default().max_parallel, MAX_PARALLEL);
    }
}
