//! Serialized task queue that owns a piece of state on a single worker task.
//!
//! Every operation runs to completion with exclusive `&mut` access to the
//! state before the next one starts, so the state never needs locking.
//! Delayed operations are tracked in a min-heap keyed by their target time
//! and can be cancelled or fast-forwarded through their [`DelayedOperation`]
//! handle. Operations that fail with a retryable persistence error go through
//! a separate retry lane that re-runs them, in order, with exponential backoff.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use chrono::{DateTime, Utc};
use futures::channel::oneshot;

use crate::firestore::error::{cancelled, is_retryable_persistence_error, FirestoreResult};
use crate::platform::runtime;
use crate::util::backoff::{BackoffSettings, ExponentialBackoff};

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;
type RetryableTask<S> = Box<dyn FnMut(&mut S) -> FirestoreResult<()> + Send>;

/// Identifies the purpose of a delayed operation so tests can fast-forward
/// specific kinds of timers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Matches every timer in [`AsyncQueue::run_delays_until`].
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    AsyncQueueRetry,
}

/// Receives cancel and skip requests for delayed operations it scheduled.
pub trait DelayedOperationHost: Send + Sync {
    fn cancel_delayed(&self, id: u64);
    fn skip_delay(&self, id: u64);
}

/// Handle to an operation scheduled to run later.
///
/// Dropping the handle does not cancel the operation.
#[derive(Clone)]
pub struct DelayedOperation {
    id: u64,
    timer_id: TimerId,
    host: Weak<dyn DelayedOperationHost>,
}

impl DelayedOperation {
    pub fn new(id: u64, timer_id: TimerId, host: Weak<dyn DelayedOperationHost>) -> Self {
        Self { id, timer_id, host }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Prevents the operation from running. No effect once it has run.
    pub fn cancel(&self) {
        if let Some(host) = self.host.upgrade() {
            host.cancel_delayed(self.id);
        }
    }

    /// Queues the operation to run now instead of waiting for its delay.
    pub fn skip_delay(&self) {
        if let Some(host) = self.host.upgrade() {
            host.skip_delay(self.id);
        }
    }
}

impl fmt::Debug for DelayedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedOperation")
            .field("id", &self.id)
            .field("timer_id", &self.timer_id)
            .finish()
    }
}

struct PendingDelay<S> {
    timer_id: TimerId,
    op: Task<S>,
}

struct DelayState<S> {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, u64)>>,
    pending: HashMap<u64, PendingDelay<S>>,
}

struct RetryLane<S> {
    ops: VecDeque<RetryableTask<S>>,
    running: bool,
    backoff: ExponentialBackoff,
}

struct Inner<S> {
    sender: Sender<Task<S>>,
    delays: Mutex<DelayState<S>>,
    retry: Mutex<RetryLane<S>>,
    next_delay_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl<S: 'static> Inner<S> {
    fn send(&self, task: Task<S>) -> FirestoreResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(cancelled("AsyncQueue is shutting down"));
        }
        self.sender
            .try_send(task)
            .map_err(|_| cancelled("AsyncQueue worker has stopped"))
    }

    fn take_delayed(&self, id: u64) -> Option<PendingDelay<S>> {
        let mut delays = self.delays.lock().unwrap();
        let DelayState { heap, pending } = &mut *delays;
        let taken = pending.remove(&id)?;
        heap.retain(|Reverse((_, queued))| pending.contains_key(queued));
        Some(taken)
    }

    fn fire(&self, id: u64) {
        if let Some(delayed) = self.take_delayed(id) {
            if self.send(delayed.op).is_err() {
                log::debug!("Dropping delayed operation {:?} after shutdown", delayed.timer_id);
            }
        }
    }
}

impl<S: 'static> DelayedOperationHost for Inner<S> {
    fn cancel_delayed(&self, id: u64) {
        self.take_delayed(id);
    }

    fn skip_delay(&self, id: u64) {
        self.fire(id);
    }
}

pub struct AsyncQueue<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for AsyncQueue<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Send + 'static> AsyncQueue<S> {
    /// Starts the worker. `init` runs on the worker and receives a handle to
    /// the queue so the state can schedule work onto it.
    pub fn start<F>(init: F) -> Self
    where
        F: FnOnce(AsyncQueue<S>) -> S + Send + 'static,
    {
        Self::start_with_backoff(BackoffSettings::default(), init)
    }

    pub fn start_with_backoff<F>(retry_backoff: BackoffSettings, init: F) -> Self
    where
        F: FnOnce(AsyncQueue<S>) -> S + Send + 'static,
    {
        let (sender, receiver) = async_channel::unbounded();
        let queue = Self {
            inner: Arc::new(Inner {
                sender,
                delays: Mutex::new(DelayState {
                    heap: BinaryHeap::new(),
                    pending: HashMap::new(),
                }),
                retry: Mutex::new(RetryLane {
                    ops: VecDeque::new(),
                    running: false,
                    backoff: ExponentialBackoff::new(retry_backoff),
                }),
                next_delay_id: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        };
        let handle = queue.clone();
        runtime::spawn_detached(Self::run_worker(receiver, handle, init));
        queue
    }

    async fn run_worker<F>(receiver: Receiver<Task<S>>, handle: AsyncQueue<S>, init: F)
    where
        F: FnOnce(AsyncQueue<S>) -> S + Send + 'static,
    {
        let mut state = init(handle);
        while let Ok(task) = receiver.recv().await {
            task(&mut state);
        }
        log::debug!("AsyncQueue worker stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Queues `op` and returns a future resolving to its result.
    ///
    /// The operation is queued immediately, not when the future is first
    /// polled, so ordering follows call order.
    pub fn enqueue<T, F>(&self, op: F) -> impl Future<Output = FirestoreResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let queued = self.inner.send(Box::new(move |state: &mut S| {
            let _ = tx.send(op(state));
        }));
        async move {
            queued?;
            rx.await
                .map_err(|_| cancelled("AsyncQueue stopped before the operation ran"))
        }
    }

    pub fn enqueue_and_forget<F>(&self, op: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if let Err(err) = self.inner.send(Box::new(op)) {
            log::debug!("Ignoring operation: {err}");
        }
    }

    /// Schedules `op` to run after `delay`.
    pub fn enqueue_after_delay<F>(&self, timer_id: TimerId, delay: Duration, op: F) -> DelayedOperation
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let id = self.inner.next_delay_id.fetch_add(1, Ordering::SeqCst);
        let weak: Weak<Inner<S>> = Arc::downgrade(&self.inner);
        let host: Weak<dyn DelayedOperationHost> = weak.clone();
        let handle = DelayedOperation::new(id, timer_id, host);
        if self.is_shutting_down() {
            return handle;
        }

        let target_time = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        {
            let mut delays = self.inner.delays.lock().unwrap();
            delays.heap.push(Reverse((target_time, id)));
            delays.pending.insert(
                id,
                PendingDelay {
                    timer_id,
                    op: Box::new(op),
                },
            );
        }

        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire(id);
            }
        });
        handle
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        let delays = self.inner.delays.lock().unwrap();
        delays
            .pending
            .values()
            .any(|delayed| timer_id == TimerId::All || delayed.timer_id == timer_id)
    }

    /// Runs pending delayed operations in target-time order, stopping after
    /// the first one matching `last_timer_id` (or after all of them for
    /// [`TimerId::All`]). Resolves once they have run.
    pub fn run_delays_until(&self, last_timer_id: TimerId) -> impl Future<Output = FirestoreResult<()>> {
        let mut due = Vec::new();
        {
            let mut delays = self.inner.delays.lock().unwrap();
            while let Some(Reverse((_, id))) = delays.heap.pop() {
                let Some(delayed) = delays.pending.remove(&id) else {
                    continue;
                };
                let matched = delayed.timer_id == last_timer_id;
                due.push(delayed.op);
                if matched && last_timer_id != TimerId::All {
                    break;
                }
            }
        }
        let mut queued = Ok(());
        for op in due {
            if let Err(err) = self.inner.send(op) {
                queued = Err(err);
            }
        }
        let drained = self.enqueue(|_| ());
        async move {
            queued?;
            drained.await
        }
    }

    /// Adds `op` to the retry lane. Lane operations run one at a time in the
    /// order they were added; a retryable persistence error re-runs the same
    /// operation after a backoff delay, any other error drops it.
    pub fn enqueue_retryable<F>(&self, op: F)
    where
        F: FnMut(&mut S) -> FirestoreResult<()> + Send + 'static,
    {
        let start = {
            let mut lane = self.inner.retry.lock().unwrap();
            lane.ops.push_back(Box::new(op));
            !std::mem::replace(&mut lane.running, true)
        };
        if start {
            let queue = self.clone();
            self.enqueue_and_forget(move |state| queue.run_next_retryable(state));
        }
    }

    fn run_next_retryable(&self, state: &mut S) {
        let next = self.inner.retry.lock().unwrap().ops.pop_front();
        let Some(mut op) = next else {
            self.inner.retry.lock().unwrap().running = false;
            return;
        };

        match op(state) {
            Ok(()) => {
                self.inner.retry.lock().unwrap().backoff.reset();
            }
            Err(err) if is_retryable_persistence_error(&err) => {
                log::debug!("Operation failed with retryable error: {err}");
                let delay = {
                    let mut lane = self.inner.retry.lock().unwrap();
                    lane.ops.push_front(op);
                    lane.backoff.next_delay()
                };
                let queue = self.clone();
                self.enqueue_after_delay(TimerId::AsyncQueueRetry, delay, move |state| {
                    queue.run_next_retryable(state)
                });
                return;
            }
            Err(err) => {
                log::error!("Dropping operation after non-retryable error: {err}");
            }
        }

        let more = {
            let mut lane = self.inner.retry.lock().unwrap();
            lane.running = !lane.ops.is_empty();
            lane.running
        };
        if more {
            let queue = self.clone();
            self.enqueue_and_forget(move |state| queue.run_next_retryable(state));
        }
    }

    /// Runs `op` as the final operation, cancels every delayed operation and
    /// rejects anything queued afterwards.
    pub fn shutdown<F>(&self, op: F) -> impl Future<Output = FirestoreResult<()>>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let finished = self.enqueue(op);
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        {
            let mut delays = self.inner.delays.lock().unwrap();
            delays.heap.clear();
            delays.pending.clear();
        }
        self.inner.retry.lock().unwrap().ops.clear();
        self.inner.sender.close();
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{internal_error, persistence_failure};

    fn start_recorder() -> AsyncQueue<Vec<&'static str>> {
        AsyncQueue::start(|_| Vec::new())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn runs_operations_in_order() {
        let queue = start_recorder();
        queue.enqueue_and_forget(|log| log.push("first"));
        let second = queue.enqueue(|log| {
            log.push("second");
            log.len()
        });
        queue.enqueue_and_forget(|log| log.push("third"));
        assert_eq!(second.await.unwrap(), 2);
        let log = queue.enqueue(|log| log.clone()).await.unwrap();
        assert_eq!(log, vec!["first", "second", "third"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn skip_delay_runs_operation_immediately() {
        let queue = start_recorder();
        let delayed = queue.enqueue_after_delay(
            TimerId::ListenStreamConnectionBackoff,
            Duration::from_secs(3600),
            |log| log.push("delayed"),
        );
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamConnectionBackoff));
        delayed.skip_delay();
        let log = queue.enqueue(|log| log.clone()).await.unwrap();
        assert_eq!(log, vec!["delayed"]);
        assert!(!queue.contains_delayed_operation(TimerId::All));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancelled_operations_never_run() {
        let queue = start_recorder();
        let delayed = queue.enqueue_after_delay(
            TimerId::OnlineStateTimeout,
            Duration::from_secs(3600),
            |log| log.push("cancelled"),
        );
        delayed.cancel();
        queue.run_delays_until(TimerId::All).await.unwrap();
        let log = queue.enqueue(|log| log.clone()).await.unwrap();
        assert!(log.is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn finished_delays_release_their_schedule_entries() {
        let queue = start_recorder();
        let kept = queue.enqueue_after_delay(TimerId::ListenStreamIdle, Duration::from_secs(3600), |log| {
            log.push("idle")
        });
        for round in 0..500 {
            let delayed = queue.enqueue_after_delay(
                TimerId::WriteStreamConnectionBackoff,
                Duration::from_secs(3600),
                |log| log.push("skipped"),
            );
            let abandoned = queue.enqueue_after_delay(
                TimerId::OnlineStateTimeout,
                Duration::from_secs(3600),
                |log| log.push("cancelled"),
            );
            if round % 2 == 0 {
                delayed.skip_delay();
                abandoned.cancel();
            } else {
                abandoned.cancel();
                delayed.skip_delay();
            }
        }

        {
            let delays = queue.inner.delays.lock().unwrap();
            assert_eq!(delays.pending.len(), 1);
            assert_eq!(delays.heap.len(), 1);
        }
        let log = queue.enqueue(|log| log.clone()).await.unwrap();
        assert_eq!(log.len(), 500);
        assert!(log.iter().all(|entry| *entry == "skipped"));

        kept.cancel();
        assert!(queue.inner.delays.lock().unwrap().heap.is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_delays_until_stops_at_requested_timer() {
        let queue = start_recorder();
        queue.enqueue_after_delay(TimerId::OnlineStateTimeout, Duration::from_secs(10), |log| {
            log.push("timeout")
        });
        queue.enqueue_after_delay(
            TimerId::ListenStreamConnectionBackoff,
            Duration::from_secs(20),
            |log| log.push("listen"),
        );
        queue.enqueue_after_delay(
            TimerId::WriteStreamConnectionBackoff,
            Duration::from_secs(30),
            |log| log.push("write"),
        );

        queue
            .run_delays_until(TimerId::ListenStreamConnectionBackoff)
            .await
            .unwrap();
        let log = queue.enqueue(|log| log.clone()).await.unwrap();
        assert_eq!(log, vec!["timeout", "listen"]);
        assert!(queue.contains_delayed_operation(TimerId::WriteStreamConnectionBackoff));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn retry_lane_reruns_retryable_failures() {
        let queue: AsyncQueue<u32> = AsyncQueue::start_with_backoff(
            BackoffSettings {
                initial_delay: Duration::from_millis(1),
                multiplier: 1.5,
                max_delay: Duration::from_millis(5),
            },
            |_| 0,
        );
        let (done_tx, done_rx) = oneshot::channel();
        let mut done_tx = Some(done_tx);
        queue.enqueue_retryable(move |attempts| {
            *attempts += 1;
            if *attempts < 3 {
                return Err(persistence_failure("disk unavailable"));
            }
            if let Some(tx) = done_tx.take() {
                let _ = tx.send(*attempts);
            }
            Ok(())
        });

        let attempts = tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .expect("retry lane stalled")
            .unwrap();
        assert_eq!(attempts, 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn retry_lane_drops_permanent_failures_and_continues() {
        let queue: AsyncQueue<Vec<&'static str>> = AsyncQueue::start(|_| Vec::new());
        queue.enqueue_retryable(|log| {
            log.push("failing");
            Err(internal_error("boom"))
        });
        queue.enqueue_retryable(|log| {
            log.push("next");
            Ok(())
        });
        // The lane hands off through the main queue, so poll until it settles.
        for _ in 0..10 {
            let log = queue.enqueue(|log| log.clone()).await.unwrap();
            if log.len() == 2 {
                assert_eq!(log, vec!["failing", "next"]);
                return;
            }
        }
        panic!("retry lane did not run the second operation");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn shutdown_rejects_later_operations() {
        let queue = start_recorder();
        queue.shutdown(|log| log.push("last")).await.unwrap();
        assert!(queue.is_shutting_down());
        let err = queue.enqueue(|log| log.len()).await.unwrap_err();
        assert_eq!(err.code, crate::firestore::error::FirestoreErrorCode::Cancelled);
    }
}
