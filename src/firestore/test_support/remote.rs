use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::firestore::remote::connection::{Connection, StreamKind, WatchRequest, WriteRequest};
use crate::firestore::remote::credentials::AuthToken;
use crate::firestore::remote::persistent_stream::{RemoteScheduler, TokenRequest};
use crate::util::async_queue::{DelayedOperation, DelayedOperationHost, TimerId};

/// Scheduler that records timers and token requests instead of running them.
/// Tests fire timers and answer tokens by hand.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    inner: Arc<ManualHost>,
}

#[derive(Default)]
struct ManualHost {
    state: Mutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    next_id: u64,
    timers: BTreeMap<u64, (TimerId, Duration)>,
    token_requests: Vec<TokenRequest>,
    invalidations: usize,
}

impl DelayedOperationHost for ManualHost {
    fn cancel_delayed(&self, id: u64) {
        self.state.lock().unwrap().timers.remove(&id);
    }

    fn skip_delay(&self, _id: u64) {}
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay of the oldest pending timer with this id.
    pub fn pending_delay(&self, timer_id: TimerId) -> Option<Duration> {
        self.inner
            .state
            .lock()
            .unwrap()
            .timers
            .values()
            .find(|(id, _)| *id == timer_id)
            .map(|(_, delay)| *delay)
    }

    pub fn has_timer(&self, timer_id: TimerId) -> bool {
        self.pending_delay(timer_id).is_some()
    }

    /// Removes the oldest pending timer with this id. The caller then invokes
    /// the matching engine callback.
    pub fn fire(&self, timer_id: TimerId) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        let id = state
            .timers
            .iter()
            .find(|(_, (pending, _))| *pending == timer_id)
            .map(|(id, _)| *id);
        match id {
            Some(id) => state.timers.remove(&id).is_some(),
            None => false,
        }
    }

    pub fn take_token_requests(&self) -> Vec<TokenRequest> {
        std::mem::take(&mut self.inner.state.lock().unwrap().token_requests)
    }

    pub fn invalidations(&self) -> usize {
        self.inner.state.lock().unwrap().invalidations
    }
}

impl RemoteScheduler for ManualScheduler {
    fn schedule_timer(&self, timer_id: TimerId, delay: Duration) -> DelayedOperation {
        let id = {
            let mut state = self.inner.state.lock().unwrap();
            state.next_id += 1;
            let id = state.next_id;
            state.timers.insert(id, (timer_id, delay));
            id
        };
        let weak: Weak<ManualHost> = Arc::downgrade(&self.inner);
        let host: Weak<dyn DelayedOperationHost> = weak;
        DelayedOperation::new(id, timer_id, host)
    }

    fn fetch_token(&self, request: TokenRequest) {
        self.inner.state.lock().unwrap().token_requests.push(request);
    }

    fn invalidate_token(&self) {
        self.inner.state.lock().unwrap().invalidations += 1;
    }
}

/// Transport double recording everything the remote store sends. Clones share
/// the same log, so a test can keep one handle while the engine owns another.
#[derive(Clone, Default)]
pub struct MockConnection {
    inner: Arc<Mutex<ConnectionLog>>,
}

#[derive(Default)]
struct ConnectionLog {
    opened: HashMap<StreamKind, usize>,
    closed: HashMap<StreamKind, usize>,
    tokens: Vec<Option<AuthToken>>,
    watch_requests: Vec<WatchRequest>,
    write_requests: Vec<WriteRequest>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self, kind: StreamKind) -> usize {
        self.inner.lock().unwrap().opened.get(&kind).copied().unwrap_or(0)
    }

    pub fn closed(&self, kind: StreamKind) -> usize {
        self.inner.lock().unwrap().closed.get(&kind).copied().unwrap_or(0)
    }

    /// Tokens passed to every `open`, oldest first.
    pub fn tokens(&self) -> Vec<Option<AuthToken>> {
        self.inner.lock().unwrap().tokens.clone()
    }

    pub fn take_watch_requests(&self) -> Vec<WatchRequest> {
        std::mem::take(&mut self.inner.lock().unwrap().watch_requests)
    }

    pub fn take_write_requests(&self) -> Vec<WriteRequest> {
        std::mem::take(&mut self.inner.lock().unwrap().write_requests)
    }
}

impl Connection for MockConnection {
    fn open(&mut self, stream: StreamKind, token: Option<&AuthToken>) {
        let mut log = self.inner.lock().unwrap();
        *log.opened.entry(stream).or_default() += 1;
        log.tokens.push(token.cloned());
    }

    fn send_watch(&mut self, request: WatchRequest) {
        self.inner.lock().unwrap().watch_requests.push(request);
    }

    fn send_write(&mut self, request: WriteRequest) {
        self.inner.lock().unwrap().write_requests.push(request);
    }

    fn close(&mut self, stream: StreamKind) {
        *self.inner.lock().unwrap().closed.entry(stream).or_default() += 1;
    }
}
