use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use crate::firestore::core::types::OnlineState;
use crate::firestore::error::{is_permanent_error, is_permanent_write_error, FirestoreError, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::{DatabaseId, DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion, User};
use crate::firestore::remote::connection::{
    Connection, ListenRequest, ResumeFrom, StreamKind, WatchRequest, WatchStreamEvent, WriteRequest, WriteResponse,
    WriteStreamEvent,
};
use crate::firestore::remote::credentials::AuthToken;
use crate::firestore::remote::online_state_tracker::OnlineStateTracker;
use crate::firestore::remote::persistent_stream::{PersistentStream, RemoteScheduler, TokenOutcome};
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange, WatchTargetChange};
use crate::firestore::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::firestore::settings::SyncSettings;
use crate::util::assert::{fail, hard_assert};
use crate::util::async_queue::TimerId;
use crate::util::backoff::ExponentialBackoff;

/// Unauthenticated closes in a row after which the watch stream gives up.
const MAX_UNAUTHENTICATED_WATCH_FAILURES: u32 = 2;

/// Reasons the network is currently not used. The network is used only when
/// none is present.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OfflineCause {
    UserDisabled,
    /// A local storage failure is being retried.
    IoError,
    CredentialChange,
    Shutdown,
}

/// Metadata view the aggregator reads while the remote store is mutably
/// borrowed elsewhere.
struct ListenTargets<'a> {
    targets: &'a BTreeMap<i32, TargetData>,
    syncer: &'a dyn RemoteSyncer,
    database_id: &'a DatabaseId,
}

impl TargetMetadataProvider for ListenTargets<'_> {
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData> {
        self.targets.get(&target_id).cloned()
    }

    fn database_id(&self) -> &DatabaseId {
        self.database_id
    }
}

/// Owns the watch and write streams.
///
/// Listens registered here are replayed every time the watch stream opens.
/// Watch changes are aggregated until the backend marks a consistent
/// snapshot and then handed to the [`RemoteSyncer`] as one remote event.
/// Pending mutation batches are pipelined over the write stream, at most
/// `max_pending_writes` at a time, and acknowledged in order.
pub struct RemoteStore {
    database_id: DatabaseId,
    max_pending_writes: usize,
    connection: Box<dyn Connection>,
    watch_stream: PersistentStream,
    write_stream: PersistentStream,
    online_state: OnlineStateTracker,
    listen_targets: BTreeMap<i32, TargetData>,
    watch_aggregator: Option<WatchChangeAggregator>,
    write_pipeline: VecDeque<MutationBatch>,
    write_handshake_complete: bool,
    last_stream_token: Vec<u8>,
    offline_causes: BTreeSet<OfflineCause>,
}

impl RemoteStore {
    pub fn new(settings: &SyncSettings, connection: Box<dyn Connection>, scheduler: Arc<dyn RemoteScheduler>) -> Self {
        Self {
            database_id: settings.database_id.clone(),
            max_pending_writes: settings.max_pending_writes.max(1),
            connection,
            watch_stream: PersistentStream::new(
                StreamKind::Watch,
                ExponentialBackoff::new(settings.backoff),
                Arc::clone(&scheduler),
            ),
            write_stream: PersistentStream::new(
                StreamKind::Write,
                ExponentialBackoff::new(settings.backoff),
                Arc::clone(&scheduler),
            ),
            online_state: OnlineStateTracker::new(
                scheduler,
                settings.online_state_timeout,
                settings.max_watch_stream_failures,
            ),
            listen_targets: BTreeMap::new(),
            watch_aggregator: None,
            write_pipeline: VecDeque::new(),
            write_handshake_complete: false,
            last_stream_token: Vec::new(),
            offline_causes: BTreeSet::new(),
        }
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state.state()
    }

    pub fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    pub fn is_listening(&self, target_id: i32) -> bool {
        self.listen_targets.contains_key(&target_id)
    }

    pub fn pending_writes(&self) -> usize {
        self.write_pipeline.len()
    }

    pub fn start(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        self.enable_network(syncer)
    }

    pub fn enable_network(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        self.offline_causes.remove(&OfflineCause::UserDisabled);
        self.enable_network_internal(syncer)
    }

    pub fn disable_network(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.offline_causes.insert(OfflineCause::UserDisabled);
        self.disable_network_internal();
        let change = self.online_state.set(OnlineState::Offline);
        broadcast(syncer, change);
    }

    /// Stops both streams until [`RemoteStore::recover_network`] is called,
    /// after a local storage operation failed with a retryable error.
    pub fn disable_network_until_recovery(&mut self, syncer: &mut dyn RemoteSyncer) {
        if !self.offline_causes.insert(OfflineCause::IoError) {
            return;
        }
        log::debug!("Disabling network until local storage recovers");
        self.disable_network_internal();
        let change = self.online_state.set(OnlineState::Offline);
        broadcast(syncer, change);
    }

    pub fn recover_network(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        if self.offline_causes.remove(&OfflineCause::IoError) {
            log::debug!("Local storage recovered, re-enabling network");
            self.enable_network_internal(syncer)?;
        }
        Ok(())
    }

    pub fn shutdown(&mut self, syncer: &mut dyn RemoteSyncer) {
        log::debug!("RemoteStore shutting down");
        self.offline_causes.insert(OfflineCause::Shutdown);
        self.disable_network_internal();
        let change = self.online_state.set(OnlineState::Unknown);
        broadcast(syncer, change);
    }

    /// Restarts both streams under the new user's credentials.
    pub fn handle_credential_change(&mut self, syncer: &mut dyn RemoteSyncer, user: User) -> FirestoreResult<()> {
        log::debug!("RemoteStore received new credentials");
        self.offline_causes.insert(OfflineCause::CredentialChange);
        self.disable_network_internal();
        let change = self.online_state.set(OnlineState::Unknown);
        broadcast(syncer, change);
        let result = syncer.handle_credential_change(self, user);
        self.offline_causes.remove(&OfflineCause::CredentialChange);
        result?;
        self.enable_network_internal(syncer)
    }

    /// Restarts the streams after the host reports a reachability change,
    /// skipping any backoff still pending.
    pub fn handle_connectivity_change(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        if !self.can_use_network() {
            return Ok(());
        }
        log::debug!("Restarting streams for network reachability change");
        self.disable_network_internal();
        let change = self.online_state.set(OnlineState::Unknown);
        broadcast(syncer, change);
        self.enable_network_internal(syncer)
    }

    fn enable_network_internal(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        if !self.can_use_network() {
            return Ok(());
        }
        self.watch_stream.inhibit_backoff();
        if self.should_start_watch_stream() {
            self.start_watch_stream(syncer);
        } else {
            let change = self.online_state.set(OnlineState::Unknown);
            broadcast(syncer, change);
        }

        self.write_stream.inhibit_backoff();
        self.fill_write_pipeline(syncer)
    }

    fn disable_network_internal(&mut self) {
        self.watch_stream.stop(self.connection.as_mut());
        self.clean_up_watch_stream_state();

        self.write_stream.stop(self.connection.as_mut());
        self.write_handshake_complete = false;
        if !self.write_pipeline.is_empty() {
            log::debug!(
                "Stopping write stream with {} pending writes",
                self.write_pipeline.len()
            );
            self.write_pipeline.clear();
        }
    }

    /// Starts watching `target_data`. No-op if the target is already watched.
    pub fn listen(&mut self, syncer: &mut dyn RemoteSyncer, target_data: TargetData) {
        let target_id = target_data.target_id;
        if self.listen_targets.contains_key(&target_id) {
            return;
        }
        self.listen_targets.insert(target_id, target_data.clone());

        if self.should_start_watch_stream() {
            self.start_watch_stream(syncer);
        } else if self.watch_stream.is_open() {
            self.send_watch_request(&*syncer, &target_data);
        }
    }

    pub fn unlisten(&mut self, syncer: &mut dyn RemoteSyncer, target_id: i32) {
        let removed = self.listen_targets.remove(&target_id);
        hard_assert(
            removed.is_some(),
            format!("unlisten called on target not currently watched: {target_id}"),
        );

        if self.watch_stream.is_open() {
            self.send_unwatch_request(target_id);
        }
        if self.listen_targets.is_empty() {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle();
            } else if self.can_use_network() {
                // Without targets the watch stream has nothing to connect
                // for, so the online state is no longer known.
                let change = self.online_state.set(OnlineState::Unknown);
                broadcast(syncer, change);
            }
        }
    }

    fn send_watch_request(&mut self, syncer: &dyn RemoteSyncer, target_data: &TargetData) {
        let target_id = target_data.target_id;
        if let Some(aggregator) = self.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }

        let resume_from = if !target_data.resume_token.is_empty() {
            ResumeFrom::Token(target_data.resume_token.clone())
        } else if target_data.snapshot_version > SnapshotVersion::min() {
            ResumeFrom::ReadTime(target_data.snapshot_version)
        } else {
            ResumeFrom::Start
        };
        let expected_count = match resume_from {
            ResumeFrom::Start => None,
            _ => Some(syncer.get_remote_keys_for_target(target_id).len() as i32),
        };

        self.watch_stream.cancel_idle_check();
        self.connection.send_watch(WatchRequest::AddTarget(ListenRequest {
            target_id,
            target: target_data.target.clone(),
            resume_from,
            expected_count,
        }));
    }

    fn send_unwatch_request(&mut self, target_id: i32) {
        if let Some(aggregator) = self.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.cancel_idle_check();
        self.connection.send_watch(WatchRequest::RemoveTarget(target_id));
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch_stream.is_started() && !self.listen_targets.is_empty()
    }

    fn start_watch_stream(&mut self, syncer: &mut dyn RemoteSyncer) {
        hard_assert(
            self.should_start_watch_stream(),
            "start_watch_stream called when should_start_watch_stream is false",
        );
        self.watch_aggregator = Some(WatchChangeAggregator::new());
        self.watch_stream.start();
        let change = self.online_state.handle_watch_stream_start();
        broadcast(syncer, change);
    }

    fn clean_up_watch_stream_state(&mut self) {
        self.watch_aggregator = None;
    }

    /// Routes a watch stream event from the transport.
    pub fn handle_watch_event(&mut self, syncer: &mut dyn RemoteSyncer, event: WatchStreamEvent) -> FirestoreResult<()> {
        match event {
            WatchStreamEvent::Open => {
                self.on_watch_stream_open(&*syncer);
                Ok(())
            }
            WatchStreamEvent::Change(change) => self.on_watch_change(syncer, change),
            WatchStreamEvent::Close(error) => self.on_watch_stream_close(syncer, error),
        }
    }

    fn on_watch_stream_open(&mut self, syncer: &dyn RemoteSyncer) {
        if !self.watch_stream.on_open() {
            return;
        }
        let targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
        for target_data in &targets {
            self.send_watch_request(syncer, target_data);
        }
    }

    fn on_watch_change(&mut self, syncer: &mut dyn RemoteSyncer, change: WatchChange) -> FirestoreResult<()> {
        if !self.watch_stream.on_message() {
            return Ok(());
        }
        let online = self.online_state.set(OnlineState::Online);
        broadcast(syncer, online);

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Remove && target_change.cause.is_some() {
                return self.handle_target_error(syncer, target_change);
            }
        }

        let snapshot_version = change.snapshot_version();
        {
            let Some(aggregator) = self.watch_aggregator.as_mut() else {
                return Ok(());
            };
            let provider = ListenTargets {
                targets: &self.listen_targets,
                syncer: &*syncer,
                database_id: &self.database_id,
            };
            match change {
                WatchChange::TargetChange(target_change) => aggregator.handle_target_change(&provider, &target_change),
                WatchChange::ExistenceFilter(filter) => aggregator.handle_existence_filter(&provider, &filter),
                WatchChange::DocumentChange(document) => aggregator.handle_document_change(&provider, document.into()),
                WatchChange::DocumentDelete(delete) => aggregator.handle_document_change(&provider, delete.into()),
                WatchChange::DocumentRemove(remove) => aggregator.handle_document_change(&provider, remove.into()),
            }
        }

        if !snapshot_version.is_min() {
            let last_remote_snapshot_version = syncer.get_last_remote_snapshot_version()?;
            if snapshot_version >= last_remote_snapshot_version {
                self.raise_watch_snapshot(syncer, snapshot_version)?;
            }
        }
        Ok(())
    }

    fn raise_watch_snapshot(&mut self, syncer: &mut dyn RemoteSyncer, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        hard_assert(!snapshot_version.is_min(), "Can't raise event for unknown SnapshotVersion");
        let event = {
            let Some(aggregator) = self.watch_aggregator.as_mut() else {
                return Ok(());
            };
            let provider = ListenTargets {
                targets: &self.listen_targets,
                syncer: &*syncer,
                database_id: &self.database_id,
            };
            aggregator.create_remote_event(&provider, snapshot_version)
        };

        // Local storage persists the tokens when it applies the event.
        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = self.listen_targets.remove(target_id) {
                self.listen_targets.insert(
                    *target_id,
                    target_data.with_resume_token(change.resume_token.clone(), snapshot_version),
                );
            }
        }

        for (target_id, purpose) in &event.target_mismatches {
            let Some(target_data) = self.listen_targets.remove(target_id) else {
                continue;
            };
            let previous_version = target_data.snapshot_version;
            let cleared = target_data.with_resume_token(Vec::new(), previous_version);
            self.listen_targets.insert(*target_id, cleared.clone());

            // Re-listen from scratch for a full result. The purpose is only
            // attached to this request, not to the stored listen.
            self.send_unwatch_request(*target_id);
            let request = TargetData::new(cleared.target, *target_id, *purpose, cleared.sequence_number);
            self.send_watch_request(&*syncer, &request);
        }

        syncer.apply_remote_event(self, event)
    }

    fn handle_target_error(&mut self, syncer: &mut dyn RemoteSyncer, change: &WatchTargetChange) -> FirestoreResult<()> {
        let Some(error) = change.cause.clone() else {
            return Ok(());
        };
        for target_id in &change.target_ids {
            if self.listen_targets.contains_key(target_id) {
                log::debug!("Target {target_id} rejected by the backend: {error}");
                self.listen_targets.remove(target_id);
                if let Some(aggregator) = self.watch_aggregator.as_mut() {
                    aggregator.remove_target(*target_id);
                }
                syncer.reject_listen(self, *target_id, error.clone())?;
            }
        }
        Ok(())
    }

    fn on_watch_stream_close(&mut self, syncer: &mut dyn RemoteSyncer, error: FirestoreError) -> FirestoreResult<()> {
        if !self.watch_stream.on_close(&error) {
            return Ok(());
        }
        self.clean_up_watch_stream_state();

        if self.watch_stream.consecutive_unauthenticated() >= MAX_UNAUTHENTICATED_WATCH_FAILURES {
            log::warn!("Watch stream rejected refreshed credentials, failing all listens: {error}");
            self.watch_stream.clear_unauthenticated_failures();
            let target_ids: Vec<i32> = self.listen_targets.keys().copied().collect();
            self.listen_targets.clear();
            for target_id in target_ids {
                syncer.reject_listen(self, target_id, error.clone())?;
            }
        }

        if self.should_start_watch_stream() {
            let change = self.online_state.handle_watch_stream_failure(&error);
            broadcast(syncer, change);
            self.start_watch_stream(syncer);
        } else {
            let change = self.online_state.set(OnlineState::Unknown);
            broadcast(syncer, change);
        }
        Ok(())
    }

    /// Pulls pending batches from local storage into the write pipeline
    /// until it is full, starting the write stream if needed.
    pub fn fill_write_pipeline(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        let mut last_batch_id = self.write_pipeline.back().map(|batch| batch.batch_id);
        while self.can_add_to_write_pipeline() {
            match syncer.next_mutation_batch(last_batch_id)? {
                Some(batch) => {
                    last_batch_id = Some(batch.batch_id);
                    self.add_to_write_pipeline(batch);
                }
                None => {
                    if self.write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
            }
        }

        if self.should_start_write_stream() {
            self.write_stream.start();
        }
        Ok(())
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < self.max_pending_writes
    }

    fn add_to_write_pipeline(&mut self, batch: MutationBatch) {
        let request = (self.write_stream.is_open() && self.write_handshake_complete)
            .then(|| self.mutations_request(&batch));
        self.write_pipeline.push_back(batch);
        if let Some(request) = request {
            self.send_write(request);
        }
    }

    fn mutations_request(&self, batch: &MutationBatch) -> WriteRequest {
        WriteRequest::Mutations {
            stream_token: self.last_stream_token.clone(),
            mutations: batch.mutations.clone(),
        }
    }

    fn send_write(&mut self, request: WriteRequest) {
        self.write_stream.cancel_idle_check();
        self.connection.send_write(request);
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write_stream.is_started() && !self.write_pipeline.is_empty()
    }

    /// Routes a write stream event from the transport.
    pub fn handle_write_event(&mut self, syncer: &mut dyn RemoteSyncer, event: WriteStreamEvent) -> FirestoreResult<()> {
        match event {
            WriteStreamEvent::Open => {
                if self.write_stream.on_open() {
                    self.send_write(WriteRequest::Handshake);
                }
                Ok(())
            }
            WriteStreamEvent::HandshakeComplete { stream_token } => self.on_write_handshake_complete(syncer, stream_token),
            WriteStreamEvent::Response(response) => self.on_mutation_result(syncer, response),
            WriteStreamEvent::Close(error) => self.on_write_stream_close(syncer, error),
        }
    }

    fn on_write_handshake_complete(&mut self, syncer: &mut dyn RemoteSyncer, stream_token: Vec<u8>) -> FirestoreResult<()> {
        if !self.write_stream.on_message() {
            return Ok(());
        }
        self.write_handshake_complete = true;
        self.last_stream_token = stream_token.clone();
        syncer.set_last_stream_token(stream_token)?;

        let requests: Vec<WriteRequest> = self
            .write_pipeline
            .iter()
            .map(|batch| self.mutations_request(batch))
            .collect();
        for request in requests {
            self.send_write(request);
        }
        Ok(())
    }

    fn on_mutation_result(&mut self, syncer: &mut dyn RemoteSyncer, response: WriteResponse) -> FirestoreResult<()> {
        if !self.write_stream.on_message() {
            return Ok(());
        }
        hard_assert(
            self.write_handshake_complete,
            "Received a mutation result before the handshake completed",
        );
        let Some(batch) = self.write_pipeline.pop_front() else {
            fail("Got result for empty write pipeline");
        };
        self.last_stream_token = response.stream_token.clone();
        let result = MutationBatchResult::new(
            batch,
            response.commit_version,
            response.mutation_results,
            response.stream_token,
        );
        syncer.apply_successful_write(self, result)?;
        self.fill_write_pipeline(syncer)
    }

    fn on_write_stream_close(&mut self, syncer: &mut dyn RemoteSyncer, error: FirestoreError) -> FirestoreResult<()> {
        if !self.write_stream.on_close(&error) {
            return Ok(());
        }
        let handshake_complete = std::mem::replace(&mut self.write_handshake_complete, false);

        if !self.write_pipeline.is_empty() {
            if handshake_complete {
                self.handle_write_error(syncer, error)?;
            } else {
                self.handle_handshake_error(syncer, &error)?;
            }
        }

        if self.should_start_write_stream() {
            self.write_stream.start();
        }
        Ok(())
    }

    fn handle_handshake_error(&mut self, syncer: &mut dyn RemoteSyncer, error: &FirestoreError) -> FirestoreResult<()> {
        // A permanent handshake failure most likely means the stream token is
        // no longer valid.
        if is_permanent_error(error.code) {
            log::debug!("Write stream failed before the handshake completed, resetting stream token: {error}");
            self.last_stream_token.clear();
            syncer.set_last_stream_token(Vec::new())?;
        }
        Ok(())
    }

    fn handle_write_error(&mut self, syncer: &mut dyn RemoteSyncer, error: FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_write_error(error.code) {
            return Ok(());
        }
        let Some(batch) = self.write_pipeline.pop_front() else {
            return Ok(());
        };
        // The failing batch is dropped, so retrying the rest needs no delay.
        self.write_stream.inhibit_backoff();
        syncer.reject_failed_write(self, batch.batch_id, error)?;
        self.fill_write_pipeline(syncer)
    }

    /// Delivers an auth token fetched on behalf of one of the streams.
    pub fn on_token(
        &mut self,
        syncer: &mut dyn RemoteSyncer,
        stream: StreamKind,
        generation: u64,
        result: FirestoreResult<Option<AuthToken>>,
    ) -> FirestoreResult<()> {
        let target = match stream {
            StreamKind::Watch => &mut self.watch_stream,
            StreamKind::Write => &mut self.write_stream,
        };
        match target.on_token(generation, result, self.connection.as_mut()) {
            TokenOutcome::Ignored | TokenOutcome::Opened => Ok(()),
            TokenOutcome::Failed(error) => match stream {
                StreamKind::Watch => self.on_watch_stream_close(syncer, error),
                StreamKind::Write => self.on_write_stream_close(syncer, error),
            },
        }
    }

    /// Runs the expiry of a timer the remote store scheduled.
    pub fn on_timer(&mut self, syncer: &mut dyn RemoteSyncer, timer_id: TimerId) -> FirestoreResult<()> {
        match timer_id {
            TimerId::ListenStreamConnectionBackoff => self.watch_stream.on_backoff_elapsed(),
            TimerId::WriteStreamConnectionBackoff => self.write_stream.on_backoff_elapsed(),
            TimerId::ListenStreamIdle => {
                if self.watch_stream.on_idle_elapsed(self.connection.as_mut()) {
                    self.clean_up_watch_stream_state();
                    if self.should_start_watch_stream() {
                        self.start_watch_stream(syncer);
                    } else {
                        let change = self.online_state.set(OnlineState::Unknown);
                        broadcast(syncer, change);
                    }
                }
            }
            TimerId::WriteStreamIdle => {
                if self.write_stream.on_idle_elapsed(self.connection.as_mut()) {
                    self.write_handshake_complete = false;
                    if self.should_start_write_stream() {
                        self.write_stream.start();
                    }
                }
            }
            TimerId::OnlineStateTimeout => {
                let change = self.online_state.on_timeout();
                broadcast(syncer, change);
            }
            TimerId::All | TimerId::AsyncQueueRetry => {}
        }
        Ok(())
    }
}

fn broadcast(syncer: &mut dyn RemoteSyncer, change: Option<OnlineState>) {
    if let Some(state) = change {
        syncer.handle_online_state_change(state);
    }
}
