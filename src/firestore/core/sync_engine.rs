use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use futures::channel::oneshot;

use crate::firestore::core::query::Query;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::types::OnlineState;
use crate::firestore::core::view::{LimboChangeType, LimboDocumentChange, View};
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::error::{
    cancelled, is_retryable_persistence_error, unavailable, FirestoreError, FirestoreResult,
};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::{LocalStore, LocalViewChanges, TargetData, TargetPurpose};
use crate::firestore::model::{
    Document, DocumentKey, Mutation, MutationBatch, MutationBatchResult, SnapshotVersion, User, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::{RemoteEvent, RemoteStore, RemoteSyncer, TargetChange};
use crate::firestore::settings::SyncSettings;
use crate::util::assert::{fail, hard_assert};

/// Sequence number for targets that are never persisted.
const INVALID_SEQUENCE_NUMBER: i64 = -1;

/// Resolves once the backend acknowledges or rejects a write.
pub type WriteReceiver = oneshot::Receiver<FirestoreResult<()>>;

/// Output of the sync engine, drained by the owner and routed to listeners.
#[derive(Debug)]
pub enum SyncEngineEvent {
    Snapshots(Vec<ViewSnapshot>),
    ListenError(Query, FirestoreError),
    OnlineStateChanged(OnlineState),
}

struct QueryView {
    query: Query,
    target_id: i32,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// Whether the backend has sent the document for this limbo target. An
    /// empty limbo target means the document no longer exists.
    received_document: bool,
}

/// Ties the local store to the remote store on behalf of query listeners.
///
/// Owns one [`View`] per listened query, applies local writes and remote
/// events to them, and resolves limbo documents by listening to them
/// individually. Snapshots and errors are buffered as [`SyncEngineEvent`]s
/// for the event manager.
pub struct SyncEngine {
    local_store: LocalStore,
    current_user: User,
    max_concurrent_limbo_resolutions: usize,
    online_state: OnlineState,

    query_views: HashMap<String, QueryView>,
    queries_by_target: BTreeMap<i32, Vec<Query>>,

    /// Limbo keys waiting for a free resolution slot, oldest first.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    enqueued_limbo_keys: BTreeSet<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, i32>,
    active_limbo_resolutions_by_target: BTreeMap<i32, LimboResolution>,
    /// Which query targets hold each limbo key.
    limbo_document_refs: ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,

    mutation_user_callbacks: HashMap<User, BTreeMap<i32, oneshot::Sender<FirestoreResult<()>>>>,
    pending_writes_callbacks: BTreeMap<i32, Vec<oneshot::Sender<FirestoreResult<()>>>>,

    pending_events: Vec<SyncEngineEvent>,
}

impl SyncEngine {
    pub fn new(local_store: LocalStore, settings: &SyncSettings) -> Self {
        let current_user = local_store.user().clone();
        Self {
            local_store,
            current_user,
            max_concurrent_limbo_resolutions: settings.max_concurrent_limbo_resolutions,
            online_state: OnlineState::Unknown,
            query_views: HashMap::new(),
            queries_by_target: BTreeMap::new(),
            enqueued_limbo_resolutions: VecDeque::new(),
            enqueued_limbo_keys: BTreeSet::new(),
            active_limbo_targets_by_key: BTreeMap::new(),
            active_limbo_resolutions_by_target: BTreeMap::new(),
            limbo_document_refs: ReferenceSet::new(),
            limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
            mutation_user_callbacks: HashMap::new(),
            pending_writes_callbacks: BTreeMap::new(),
            pending_events: Vec::new(),
        }
    }

    pub fn local_store(&mut self) -> &mut LocalStore {
        &mut self.local_store
    }

    pub fn current_user(&self) -> &User {
        &self.current_user
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    /// Drains buffered snapshots, listen errors and online state changes.
    pub fn take_events(&mut self) -> Vec<SyncEngineEvent> {
        std::mem::take(&mut self.pending_events)
    }

    /// Limbo keys with a running resolution target.
    pub fn active_limbo_documents(&self) -> BTreeMap<DocumentKey, i32> {
        self.active_limbo_targets_by_key.clone()
    }

    pub fn enqueued_limbo_documents(&self) -> Vec<DocumentKey> {
        self.enqueued_limbo_resolutions.iter().cloned().collect()
    }

    /// Starts tracking `query` and returns its initial snapshot computed from
    /// the local cache. The target is only watched when
    /// `should_listen_to_remote` is set.
    pub fn listen(
        &mut self,
        remote: &mut RemoteStore,
        query: Query,
        should_listen_to_remote: bool,
    ) -> FirestoreResult<ViewSnapshot> {
        if let Some(query_view) = self.query_views.get(&query.canonical_id()) {
            return Ok(query_view.view.compute_initial_snapshot());
        }

        let target_data = self.local_store.allocate_target(query.to_target())?;
        let snapshot = self.initialize_view_and_compute_snapshot(
            remote,
            query,
            target_data.target_id,
            target_data.resume_token.clone(),
        )?;
        if should_listen_to_remote {
            remote.listen(self, target_data);
        }
        Ok(snapshot)
    }

    fn initialize_view_and_compute_snapshot(
        &mut self,
        remote: &mut RemoteStore,
        query: Query,
        target_id: i32,
        resume_token: Vec<u8>,
    ) -> FirestoreResult<ViewSnapshot> {
        let query_result = self.local_store.execute_query(&query, true)?;
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let doc_changes = view.compute_doc_changes(&query_result.documents, None);
        let target_change = TargetChange::synthesized_for_current_change(false, resume_token);
        let view_change = view.apply_changes(doc_changes, true, Some(&target_change), false);
        self.update_tracked_limbos(remote, target_id, view_change.limbo_changes);

        let Some(snapshot) = view_change.snapshot else {
            fail(format!("Initial view for target {target_id} produced no snapshot"));
        };
        self.query_views.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        self.queries_by_target.entry(target_id).or_default().push(query);
        Ok(snapshot)
    }

    /// Stops tracking `query`. The target is released once no other query
    /// maps to it.
    pub fn unlisten(
        &mut self,
        remote: &mut RemoteStore,
        query: &Query,
        should_unlisten_from_remote: bool,
    ) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let Some(target_id) = self.query_views.get(&canonical_id).map(|view| view.target_id) else {
            fail(format!("Trying to unlisten on query not found: {canonical_id}"));
        };

        let queries = self.queries_by_target.entry(target_id).or_default();
        if queries.len() > 1 {
            queries.retain(|other| other != query);
            self.query_views.remove(&canonical_id);
            return Ok(());
        }

        self.local_store.release_target(target_id, false)?;
        if should_unlisten_from_remote {
            remote.unlisten(self, target_id);
        }
        self.remove_and_cleanup_target(remote, target_id, None);
        Ok(())
    }

    /// Starts watching an already tracked query, used when a listener that
    /// needs the backend joins cache-only listeners.
    pub fn trigger_remote_store_listen(&mut self, remote: &mut RemoteStore, query: &Query) -> FirestoreResult<()> {
        let target = query.to_target();
        let target_data = match self.local_store.get_target_data(&target)? {
            Some(target_data) => target_data,
            None => self.local_store.allocate_target(target)?,
        };
        remote.listen(self, target_data);
        Ok(())
    }

    /// Stops watching a query that stays tracked for cache-only listeners.
    pub fn trigger_remote_store_unlisten(&mut self, remote: &mut RemoteStore, query: &Query) {
        let Some(target_id) = self
            .query_views
            .get(&query.canonical_id())
            .map(|view| view.target_id)
        else {
            fail(format!("Trying to unlisten on query not found: {}", query.canonical_id()));
        };
        remote.unlisten(self, target_id);
    }

    /// Applies `mutations` locally, raises the optimistic snapshots and hands
    /// the batch to the write pipeline.
    pub fn write(&mut self, remote: &mut RemoteStore, mutations: Vec<Mutation>) -> FirestoreResult<WriteReceiver> {
        let (sender, receiver) = oneshot::channel();
        let result = match self.local_store.write_locally(mutations) {
            Ok(result) => result,
            Err(err) if is_retryable_persistence_error(&err) => {
                let _ = sender.send(Err(unavailable(format!("Failed to persist write: {err}"))));
                return Ok(receiver);
            }
            Err(err) => return Err(err),
        };

        self.mutation_user_callbacks
            .entry(self.current_user.clone())
            .or_default()
            .insert(result.batch_id, sender);
        self.emit_new_snaps_and_notify_local_store(remote, result.changes, None)?;
        remote.fill_write_pipeline(self)?;
        Ok(receiver)
    }

    /// Resolves once every write queued so far is acknowledged or rejected.
    pub fn register_pending_writes_callback(&mut self, remote: &RemoteStore) -> FirestoreResult<WriteReceiver> {
        if !remote.can_use_network() {
            log::debug!(
                "The network is disabled. Waiting for pending writes will not complete until the network is enabled."
            );
        }

        let (sender, receiver) = oneshot::channel();
        let highest_batch_id = self.local_store.get_highest_unacknowledged_batch_id()?;
        if highest_batch_id == BATCH_ID_UNKNOWN {
            let _ = sender.send(Ok(()));
        } else {
            self.pending_writes_callbacks
                .entry(highest_batch_id)
                .or_default()
                .push(sender);
        }
        Ok(receiver)
    }

    /// Runs `query` against the local cache only.
    pub fn get_documents_from_local_cache(&mut self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        let query_result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let doc_changes = view.compute_doc_changes(&query_result.documents, None);
        match view.apply_changes(doc_changes, false, None, false).snapshot {
            Some(snapshot) => Ok(snapshot),
            None => Ok(view.compute_initial_snapshot()),
        }
    }

    /// Local view of one document. `Ok(None)` means the cache knows the
    /// document does not exist.
    pub fn get_document_from_local_cache(&mut self, key: &DocumentKey) -> FirestoreResult<Option<Document>> {
        let document = self.local_store.read_document(key)?;
        if document.is_found_document() {
            Ok(Some(document))
        } else if document.is_no_document() {
            Ok(None)
        } else {
            Err(unavailable(
                "Failed to get document from cache. (However, this document may exist on the server. \
                 Run again without setting source to cache to attempt to retrieve the document from the server.)",
            ))
        }
    }

    fn emit_new_snaps_and_notify_local_store(
        &mut self,
        remote: &mut RemoteStore,
        changes: BTreeMap<DocumentKey, Document>,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        if self.query_views.is_empty() {
            return Ok(());
        }

        let mut new_snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let canonical_ids: Vec<String> = self.query_views.keys().cloned().collect();
        for canonical_id in canonical_ids {
            let Some(query_view) = self.query_views.get_mut(&canonical_id) else {
                continue;
            };
            let target_id = query_view.target_id;

            let mut doc_changes = query_view.view.compute_doc_changes(&changes, None);
            if doc_changes.needs_refill {
                // The limit moved; recompute from everything the query matches.
                let documents = self.local_store.execute_query(&query_view.query, false)?.documents;
                doc_changes = query_view.view.compute_doc_changes(&documents, Some(doc_changes));
            }
            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let target_is_pending_reset =
                remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
            let view_change =
                query_view
                    .view
                    .apply_changes(doc_changes, true, target_change, target_is_pending_reset);

            self.update_tracked_limbos(remote, target_id, view_change.limbo_changes);
            if let Some(snapshot) = view_change.snapshot {
                view_changes.push(LocalViewChanges::from_snapshot(target_id, &snapshot));
                new_snapshots.push(snapshot);
            }
        }

        self.pending_events.push(SyncEngineEvent::Snapshots(new_snapshots));
        self.local_store.notify_local_view_changes(&view_changes)
    }

    fn update_tracked_limbos(&mut self, remote: &mut RemoteStore, target_id: i32, changes: Vec<LimboDocumentChange>) {
        for change in changes {
            match change.change_type {
                LimboChangeType::Added => {
                    self.limbo_document_refs.add_reference(change.key.clone(), target_id);
                    self.track_limbo_change(remote, change.key);
                }
                LimboChangeType::Removed => {
                    log::debug!("Document no longer in limbo: {}", change.key);
                    self.limbo_document_refs.remove_reference(&change.key, target_id);
                    if !self.limbo_document_refs.contains_key(&change.key) {
                        self.remove_limbo_target(remote, &change.key);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, remote: &mut RemoteStore, key: DocumentKey) {
        if self.active_limbo_targets_by_key.contains_key(&key) || self.enqueued_limbo_keys.contains(&key) {
            return;
        }
        log::debug!("New document in limbo: {key}");
        self.enqueued_limbo_keys.insert(key.clone());
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions(remote);
    }

    /// Starts resolution targets for queued limbo keys while below the cap.
    fn pump_enqueued_limbo_resolutions(&mut self, remote: &mut RemoteStore) {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            self.enqueued_limbo_keys.remove(&key);

            let limbo_target_id = self.limbo_target_id_generator.next();
            self.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key.insert(key.clone(), limbo_target_id);
            let target_data = TargetData::new(
                Query::for_document(&key).to_target(),
                limbo_target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            );
            remote.listen(self, target_data);
        }
    }

    fn remove_limbo_target(&mut self, remote: &mut RemoteStore, key: &DocumentKey) {
        if self.enqueued_limbo_keys.remove(key) {
            self.enqueued_limbo_resolutions.retain(|queued| queued != key);
        }
        let Some(limbo_target_id) = self.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        remote.unlisten(self, limbo_target_id);
        self.active_limbo_resolutions_by_target.remove(&limbo_target_id);
        self.pump_enqueued_limbo_resolutions(remote);
    }

    fn remove_and_cleanup_target(&mut self, remote: &mut RemoteStore, target_id: i32, error: Option<FirestoreError>) {
        for query in self.queries_by_target.remove(&target_id).unwrap_or_default() {
            self.query_views.remove(&query.canonical_id());
            if let Some(error) = &error {
                self.pending_events
                    .push(SyncEngineEvent::ListenError(query, error.clone()));
            }
        }

        for limbo_key in self.limbo_document_refs.remove_references_for_id(target_id) {
            if !self.limbo_document_refs.contains_key(&limbo_key) {
                self.remove_limbo_target(remote, &limbo_key);
            }
        }
    }

    fn process_user_callback(&mut self, batch_id: i32, result: FirestoreResult<()>) {
        let Some(callbacks) = self.mutation_user_callbacks.get_mut(&self.current_user) else {
            return;
        };
        if let Some(callback) = callbacks.remove(&batch_id) {
            let _ = callback.send(result);
        }
    }

    fn trigger_pending_writes_callbacks(&mut self, batch_id: i32) {
        for callback in self.pending_writes_callbacks.remove(&batch_id).unwrap_or_default() {
            let _ = callback.send(Ok(()));
        }
    }

    fn reject_outstanding_pending_writes_callbacks(&mut self, message: &str) {
        for callback in std::mem::take(&mut self.pending_writes_callbacks)
            .into_values()
            .flatten()
        {
            let _ = callback.send(Err(cancelled(message)));
        }
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&mut self, remote: &mut RemoteStore, event: RemoteEvent) -> FirestoreResult<()> {
        let changes = self.local_store.apply_remote_event(&event)?;

        for (target_id, change) in &event.target_changes {
            let Some(resolution) = self.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            hard_assert(
                change.added_documents.len() + change.modified_documents.len() + change.removed_documents.len()
                    <= 1,
                "Limbo resolution for single document contains multiple changes.",
            );
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.modified_documents.is_empty() {
                hard_assert(
                    resolution.received_document,
                    "Received change for limbo target document without add.",
                );
            } else if !change.removed_documents.is_empty() {
                hard_assert(
                    resolution.received_document,
                    "Received remove for limbo target document without add.",
                );
                resolution.received_document = false;
            }
        }

        self.emit_new_snaps_and_notify_local_store(remote, changes, Some(&event))
    }

    fn reject_listen(&mut self, remote: &mut RemoteStore, target_id: i32, error: FirestoreError) -> FirestoreResult<()> {
        let limbo_key = self
            .active_limbo_resolutions_by_target
            .get(&target_id)
            .map(|resolution| resolution.key.clone());

        let Some(limbo_key) = limbo_key else {
            log::warn!("Listen for target {target_id} failed: {error}");
            self.local_store.release_target(target_id, false)?;
            self.remove_and_cleanup_target(remote, target_id, Some(error));
            return Ok(());
        };

        // The limbo document is treated as deleted. The remote store has
        // already dropped the target, so it must not be unlistened again.
        log::debug!("Limbo resolution for {limbo_key} failed: {error}");
        self.active_limbo_targets_by_key.remove(&limbo_key);
        self.active_limbo_resolutions_by_target.remove(&target_id);
        let mut event = RemoteEvent {
            snapshot_version: SnapshotVersion::min(),
            ..RemoteEvent::default()
        };
        event.document_updates.insert(
            limbo_key.clone(),
            Document::new_no_document(limbo_key.clone(), SnapshotVersion::min()),
        );
        event.resolved_limbo_documents.insert(limbo_key.clone());
        self.apply_remote_event(remote, event)?;
        self.pump_enqueued_limbo_resolutions(remote);
        Ok(())
    }

    fn apply_successful_write(&mut self, remote: &mut RemoteStore, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(&result)?;
        self.process_user_callback(batch_id, Ok(()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(remote, changes, None)
    }

    fn reject_failed_write(&mut self, remote: &mut RemoteStore, batch_id: i32, error: FirestoreError) -> FirestoreResult<()> {
        log::warn!("Write batch {batch_id} rejected: {error}");
        let changes = self.local_store.reject_batch(batch_id)?;
        self.process_user_callback(batch_id, Err(error));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(remote, changes, None)
    }

    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        if let Some(resolution) = self.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return BTreeSet::from([resolution.key.clone()]);
            }
        }

        let mut keys = BTreeSet::new();
        for query in self.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = self.query_views.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }

    fn next_mutation_batch(&mut self, after_batch_id: Option<i32>) -> FirestoreResult<Option<MutationBatch>> {
        self.local_store.next_mutation_batch(after_batch_id)
    }

    fn get_last_remote_snapshot_version(&mut self) -> FirestoreResult<SnapshotVersion> {
        self.local_store.get_last_remote_snapshot_version()
    }

    fn set_last_stream_token(&mut self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        self.local_store.set_last_stream_token(stream_token)
    }

    fn handle_online_state_change(&mut self, state: OnlineState) {
        let mut new_snapshots = Vec::new();
        for query_view in self.query_views.values_mut() {
            let view_change = query_view.view.apply_online_state_change(state);
            hard_assert(
                view_change.limbo_changes.is_empty(),
                "OnlineState should not affect limbo documents.",
            );
            if let Some(snapshot) = view_change.snapshot {
                new_snapshots.push(snapshot);
            }
        }
        self.online_state = state;
        self.pending_events.push(SyncEngineEvent::OnlineStateChanged(state));
        self.pending_events.push(SyncEngineEvent::Snapshots(new_snapshots));
    }

    fn handle_credential_change(&mut self, remote: &mut RemoteStore, user: User) -> FirestoreResult<()> {
        if self.current_user == user {
            return Ok(());
        }
        log::debug!("User change. New user: {:?}", user.uid());
        let result = self.local_store.handle_user_change(user.clone())?;
        self.current_user = user;
        self.reject_outstanding_pending_writes_callbacks(
            "'wait_for_pending_writes' was rejected due to a user change.",
        );
        self.emit_new_snaps_and_notify_local_store(remote, result.affected_documents, None)
    }
}
