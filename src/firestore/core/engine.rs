use std::sync::Arc;

use crate::firestore::core::event_manager::{EventManager, ListenHost, QueryListener};
use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineEvent, WriteReceiver};
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::error::{is_retryable_persistence_error, FirestoreResult};
use crate::firestore::local::LocalStore;
use crate::firestore::model::{Document, DocumentKey, Mutation, User};
use crate::firestore::remote::{
    AuthToken, Connection, RemoteScheduler, RemoteStore, StreamKind, WatchStreamEvent, WriteStreamEvent,
};
use crate::firestore::settings::SyncSettings;
use crate::util::async_queue::TimerId;

/// Everything one client instance owns, driven from a single worker.
///
/// Each operation runs the sync engine and remote store to completion and
/// then routes the buffered sync engine output to listeners.
pub struct Engine {
    sync_engine: SyncEngine,
    remote_store: RemoteStore,
    event_manager: EventManager,
    needs_recovery: bool,
}

struct SyncEngineHost<'a> {
    sync_engine: &'a mut SyncEngine,
    remote_store: &'a mut RemoteStore,
}

impl ListenHost for SyncEngineHost<'_> {
    fn on_listen(&mut self, query: &Query, listen_to_remote: bool) -> FirestoreResult<ViewSnapshot> {
        self.sync_engine
            .listen(self.remote_store, query.clone(), listen_to_remote)
    }

    fn on_unlisten(&mut self, query: &Query, unlisten_from_remote: bool) -> FirestoreResult<()> {
        self.sync_engine
            .unlisten(self.remote_store, query, unlisten_from_remote)
    }

    fn on_first_remote_store_listen(&mut self, query: &Query) -> FirestoreResult<()> {
        self.sync_engine
            .trigger_remote_store_listen(self.remote_store, query)
    }

    fn on_last_remote_store_unlisten(&mut self, query: &Query) -> FirestoreResult<()> {
        self.sync_engine
            .trigger_remote_store_unlisten(self.remote_store, query);
        Ok(())
    }
}

impl Engine {
    pub fn new(
        local_store: LocalStore,
        settings: &SyncSettings,
        connection: Box<dyn Connection>,
        scheduler: Arc<dyn RemoteScheduler>,
    ) -> Self {
        Self {
            sync_engine: SyncEngine::new(local_store, settings),
            remote_store: RemoteStore::new(settings, connection, scheduler),
            event_manager: EventManager::new(),
            needs_recovery: false,
        }
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.sync_engine
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    pub fn start(&mut self) -> FirestoreResult<()> {
        self.sync_engine.local_store().start()?;
        let result = self.remote_store.start(&mut self.sync_engine);
        self.finish(result)
    }

    pub fn listen(&mut self, listener: QueryListener) {
        let mut host = SyncEngineHost {
            sync_engine: &mut self.sync_engine,
            remote_store: &mut self.remote_store,
        };
        self.event_manager.listen(&mut host, listener);
        self.flush();
    }

    pub fn unlisten(&mut self, query: &Query, listener_id: u64) -> FirestoreResult<()> {
        let mut host = SyncEngineHost {
            sync_engine: &mut self.sync_engine,
            remote_store: &mut self.remote_store,
        };
        let result = self.event_manager.unlisten(&mut host, query, listener_id);
        self.finish(result)
    }

    pub fn write(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<WriteReceiver> {
        let result = self.sync_engine.write(&mut self.remote_store, mutations);
        self.flush();
        result
    }

    pub fn register_pending_writes_callback(&mut self) -> FirestoreResult<WriteReceiver> {
        self.sync_engine
            .register_pending_writes_callback(&self.remote_store)
    }

    pub fn get_document_from_local_cache(&mut self, key: &DocumentKey) -> FirestoreResult<Option<Document>> {
        self.sync_engine.get_document_from_local_cache(key)
    }

    pub fn get_documents_from_local_cache(&mut self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        self.sync_engine.get_documents_from_local_cache(query)
    }

    pub fn enable_network(&mut self) -> FirestoreResult<()> {
        let result = self.remote_store.enable_network(&mut self.sync_engine);
        self.finish(result)
    }

    pub fn disable_network(&mut self) {
        self.remote_store.disable_network(&mut self.sync_engine);
        self.flush();
    }

    pub fn handle_connectivity_change(&mut self) -> FirestoreResult<()> {
        let result = self.remote_store.handle_connectivity_change(&mut self.sync_engine);
        self.finish(result)
    }

    pub fn handle_credential_change(&mut self, user: User) -> FirestoreResult<()> {
        let result = self
            .remote_store
            .handle_credential_change(&mut self.sync_engine, user);
        self.finish(result)
    }

    pub fn handle_watch_event(&mut self, event: WatchStreamEvent) -> FirestoreResult<()> {
        let result = self
            .remote_store
            .handle_watch_event(&mut self.sync_engine, event);
        self.finish(result)
    }

    pub fn handle_write_event(&mut self, event: WriteStreamEvent) -> FirestoreResult<()> {
        let result = self
            .remote_store
            .handle_write_event(&mut self.sync_engine, event);
        self.finish(result)
    }

    pub fn on_token(
        &mut self,
        stream: StreamKind,
        generation: u64,
        token: FirestoreResult<Option<AuthToken>>,
    ) -> FirestoreResult<()> {
        let result = self
            .remote_store
            .on_token(&mut self.sync_engine, stream, generation, token);
        self.finish(result)
    }

    pub fn on_timer(&mut self, timer_id: TimerId) -> FirestoreResult<()> {
        let result = self.remote_store.on_timer(&mut self.sync_engine, timer_id);
        self.finish(result)
    }

    /// Set after a retryable storage failure took the network down. The
    /// owner must schedule [`Engine::recover`] on its retry lane.
    pub fn take_recovery_request(&mut self) -> bool {
        std::mem::take(&mut self.needs_recovery)
    }

    /// Probes local storage and re-enables the network once it answers.
    pub fn recover(&mut self) -> FirestoreResult<()> {
        self.sync_engine
            .local_store()
            .get_last_remote_snapshot_version()?;
        let result = self.remote_store.recover_network(&mut self.sync_engine);
        self.finish(result)
    }

    pub fn shutdown(&mut self) -> FirestoreResult<()> {
        self.remote_store.shutdown(&mut self.sync_engine);
        self.flush();
        self.sync_engine.local_store().shutdown()
    }

    /// Routes buffered sync engine output to listeners.
    pub fn flush(&mut self) {
        for event in self.sync_engine.take_events() {
            match event {
                SyncEngineEvent::Snapshots(snapshots) => self.event_manager.on_watch_change(snapshots),
                SyncEngineEvent::ListenError(query, error) => self.event_manager.on_watch_error(&query, error),
                SyncEngineEvent::OnlineStateChanged(state) => self.event_manager.on_online_state_change(state),
            }
        }
    }

    /// Flushes and takes the network down on retryable storage failures
    /// instead of reporting them.
    fn finish(&mut self, result: FirestoreResult<()>) -> FirestoreResult<()> {
        let result = match result {
            Err(err) if is_retryable_persistence_error(&err) => {
                log::debug!("Local storage failed, disabling network until it recovers: {err}");
                self.remote_store
                    .disable_network_until_recovery(&mut self.sync_engine);
                self.needs_recovery = true;
                Ok(())
            }
            other => other,
        };
        self.flush();
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::firestore::core::event_manager::{ListenOptions, QueryObserver};
    use crate::firestore::core::types::OnlineState;
    use crate::firestore::error::unavailable;
    use crate::firestore::local::{MemoryPersistence, Persistence};
    use crate::firestore::remote::{
        DocumentChange, ResumeFrom, TargetChangeState, WatchChange, WatchRequest, WatchTargetChange, WriteResponse,
    };
    use crate::firestore::test_support::*;

    type Received = Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>>;

    struct Harness {
        engine: Engine,
        scheduler: ManualScheduler,
        connection: MockConnection,
    }

    impl Harness {
        fn new(persistence: Box<dyn Persistence>) -> Self {
            let scheduler = ManualScheduler::new();
            let connection = MockConnection::new();
            let local_store = LocalStore::new(persistence, User::unauthenticated());
            let mut engine = Engine::new(
                local_store,
                &SyncSettings::default(),
                Box::new(connection.clone()),
                Arc::new(scheduler.clone()),
            );
            engine.start().unwrap();
            Self {
                engine,
                scheduler,
                connection,
            }
        }

        fn listen(&mut self, id: u64, path: &str) -> Received {
            self.listen_with(id, path, ListenOptions::default())
        }

        fn listen_with(&mut self, id: u64, path: &str, options: ListenOptions) -> Received {
            let received: Received = Arc::default();
            let sink = Arc::clone(&received);
            let observer: QueryObserver = Box::new(move |result| sink.lock().unwrap().push(result));
            self.engine
                .listen(QueryListener::new(id, query(path), options, observer));
            received
        }

        fn grant_tokens(&mut self) {
            for request in self.scheduler.take_token_requests() {
                self.engine
                    .on_token(request.stream, request.generation, Ok(None))
                    .unwrap();
            }
        }

        fn watch(&mut self, event: WatchStreamEvent) {
            self.engine.handle_watch_event(event).unwrap();
        }

        fn open_watch(&mut self) {
            self.grant_tokens();
            self.watch(WatchStreamEvent::Open);
        }

        /// Adds `docs` to target 2 and marks it current at `seconds`.
        fn sync_target(&mut self, seconds: i64, token: &[u8], docs: Vec<Document>) {
            self.watch(target_change(TargetChangeState::Add, vec![2]));
            for document in docs {
                self.watch(WatchStreamEvent::Change(WatchChange::DocumentChange(DocumentChange {
                    updated_target_ids: vec![2],
                    removed_target_ids: Vec::new(),
                    key: document.key().clone(),
                    document: Some(document),
                })));
            }
            self.watch(WatchStreamEvent::Change(WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::Current, vec![2]).with_resume_token(token.to_vec()),
            )));
            self.watch(WatchStreamEvent::Change(WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::NoChange, Vec::new()).with_read_time(version(seconds)),
            )));
        }
    }

    fn target_change(state: TargetChangeState, ids: Vec<i32>) -> WatchStreamEvent {
        WatchStreamEvent::Change(WatchChange::TargetChange(WatchTargetChange::new(state, ids)))
    }

    fn last(received: &Received) -> ViewSnapshot {
        received
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("a snapshot")
            .expect("no error")
    }

    #[test]
    fn listener_sees_cache_then_server_results() {
        let mut h = Harness::new(Box::new(MemoryPersistence::new()));
        let received = h.listen(1, "rooms");
        let initial = last(&received);
        assert!(initial.docs.is_empty());
        assert!(initial.from_cache);

        h.open_watch();
        h.sync_target(1, b"R1", vec![doc("rooms/a", 1, map(&[("n", int(1))]))]);

        let synced = last(&received);
        assert_eq!(synced.docs.len(), 1);
        assert!(!synced.from_cache);
        assert_eq!(h.engine.remote_store().online_state(), OnlineState::Online);
    }

    #[test]
    fn reconnect_resumes_with_last_token() {
        let mut h = Harness::new(Box::new(MemoryPersistence::new()));
        h.listen(1, "rooms");
        h.open_watch();
        h.sync_target(1, b"R1", vec![doc("rooms/a", 1, map(&[]))]);
        h.connection.take_watch_requests();

        h.watch(WatchStreamEvent::Close(unavailable("connection reset")));
        assert!(h.scheduler.fire(TimerId::ListenStreamConnectionBackoff));
        h.engine.on_timer(TimerId::ListenStreamConnectionBackoff).unwrap();
        h.open_watch();

        let requests = h.connection.take_watch_requests();
        let added: Vec<_> = requests
            .iter()
            .filter_map(|request| match request {
                WatchRequest::AddTarget(listen) => Some((listen.target_id, listen.resume_from.clone())),
                WatchRequest::RemoveTarget(_) => None,
            })
            .collect();
        assert_eq!(added, vec![(2, ResumeFrom::Token(b"R1".to_vec()))]);
    }

    #[test]
    fn acknowledged_write_clears_pending_flag() {
        let mut h = Harness::new(Box::new(MemoryPersistence::new()));
        let options = ListenOptions {
            include_metadata_changes: true,
            ..ListenOptions::default()
        };
        let received = h.listen_with(1, "rooms", options);
        let mut done = h
            .engine
            .write(vec![set_mutation("rooms/a", map(&[("n", int(1))]))])
            .unwrap();
        assert!(last(&received).has_pending_write(&key("rooms/a")));

        h.grant_tokens();
        h.engine.handle_write_event(WriteStreamEvent::Open).unwrap();
        h.engine
            .handle_write_event(WriteStreamEvent::HandshakeComplete {
                stream_token: b"W1".to_vec(),
            })
            .unwrap();
        h.engine
            .handle_write_event(WriteStreamEvent::Response(WriteResponse {
                stream_token: b"W2".to_vec(),
                commit_version: version(3),
                mutation_results: vec![mutation_result(3)],
            }))
            .unwrap();

        assert!(!last(&received).has_pending_writes());
        assert_eq!(done.try_recv().unwrap(), Some(Ok(())));
    }

    #[test]
    fn unlisten_stops_watching() {
        let mut h = Harness::new(Box::new(MemoryPersistence::new()));
        h.listen(1, "rooms");
        assert!(h.engine.remote_store().is_listening(2));

        h.engine.unlisten(&query("rooms"), 1).unwrap();
        assert!(!h.engine.remote_store().is_listening(2));
    }

    #[test]
    fn storage_failure_takes_network_down_until_recovery() {
        let (persistence, switch) = FlakyPersistence::new();
        let mut h = Harness::new(Box::new(persistence));
        h.listen(1, "rooms");
        h.open_watch();

        switch.fail_next(1);
        h.sync_target(1, b"R1", vec![doc("rooms/a", 1, map(&[]))]);
        assert_eq!(switch.failed(), 1);
        assert!(h.engine.take_recovery_request());
        assert!(!h.engine.remote_store().can_use_network());
        assert_eq!(h.engine.remote_store().online_state(), OnlineState::Offline);

        h.engine.recover().unwrap();
        assert!(h.engine.remote_store().can_use_network());
        assert!(!h.engine.take_recovery_request());
    }
}
