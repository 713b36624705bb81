use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::{Query, Target};
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::bundle_cache::{BundleMetadata, NamedQuery};
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::persistence::{run_transaction, Persistence, PersistenceTransaction, TransactionMode};
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::remote_document_cache::RemoteDocumentChangeBuffer;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    Document, DocumentKey, FieldMask, Mutation, MutationBatch, MutationBatchResult, SnapshotVersion, Timestamp,
    User, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::{RemoteEvent, TargetChange};
use crate::util::assert::{fail, hard_assert};

/// Maximum age of a resume token before it is persisted even without
/// document changes, so a restart does not replay a long stretch of changes.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: i32,
    pub changes: BTreeMap<DocumentKey, Document>,
}

#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: BTreeMap<DocumentKey, Document>,
    /// Keys the backend last reported as matching the query's target.
    pub remote_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Debug, Default)]
pub struct UserChangeResult {
    pub affected_documents: BTreeMap<DocumentKey, Document>,
    pub removed_batch_ids: Vec<i32>,
    pub added_batch_ids: Vec<i32>,
}

/// Documents that entered or left a view, used to pin them against
/// garbage collection while they are displayed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: i32,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

impl LocalViewChanges {
    pub fn from_snapshot(target_id: i32, snapshot: &ViewSnapshot) -> Self {
        let mut added_keys = BTreeSet::new();
        let mut removed_keys = BTreeSet::new();
        for change in &snapshot.doc_changes {
            match change.change_type {
                ChangeType::Added => {
                    added_keys.insert(change.document.key().clone());
                }
                ChangeType::Removed => {
                    removed_keys.insert(change.document.key().clone());
                }
                ChangeType::Modified | ChangeType::Metadata => {}
            }
        }
        Self {
            target_id,
            from_cache: snapshot.from_cache,
            added_keys,
            removed_keys,
        }
    }
}

/// The client's view of its data: the remote document cache combined with
/// the user's pending mutations.
///
/// Every operation runs in its own persistence transaction. Target metadata
/// advanced by remote events is kept in memory and only written back when
/// [`should_persist_target_data`] says it is worth it.
pub struct LocalStore {
    persistence: Box<dyn Persistence>,
    user: User,
    local_documents: LocalDocumentsView,
    query_engine: QueryEngine,
    target_data_by_target: BTreeMap<i32, TargetData>,
    target_id_by_canonical_id: BTreeMap<String, i32>,
}

impl LocalStore {
    pub fn new(persistence: Box<dyn Persistence>, user: User) -> Self {
        let local_documents = LocalDocumentsView::new();
        Self {
            persistence,
            user,
            local_documents,
            query_engine: QueryEngine::new(local_documents),
            target_data_by_target: BTreeMap::new(),
            target_id_by_canonical_id: BTreeMap::new(),
        }
    }

    pub fn start(&mut self) -> FirestoreResult<()> {
        if !self.persistence.is_started() {
            self.persistence.start()?;
        }
        Ok(())
    }

    pub fn shutdown(&mut self) -> FirestoreResult<()> {
        self.persistence.shutdown()
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// Switches to `user`'s mutation queue and reports the documents whose
    /// local view changed because a different set of writes now applies.
    pub fn handle_user_change(&mut self, user: User) -> FirestoreResult<UserChangeResult> {
        let old_batches = run_transaction(
            self.persistence.as_mut(),
            "Handle user change",
            TransactionMode::ReadOnly,
            &self.user,
            |txn| txn.mutation_queue.all_mutation_batches(),
        )?;
        self.user = user;

        let view = self.local_documents;
        run_transaction(
            self.persistence.as_mut(),
            "Handle user change",
            TransactionMode::ReadWrite,
            &self.user,
            |txn| {
                let new_batches = txn.mutation_queue.all_mutation_batches()?;
                let mut changed_keys = BTreeSet::new();
                let removed_batch_ids = old_batches
                    .iter()
                    .inspect(|batch| changed_keys.extend(batch.keys()))
                    .map(|batch| batch.batch_id)
                    .collect();
                let added_batch_ids = new_batches
                    .iter()
                    .inspect(|batch| changed_keys.extend(batch.keys()))
                    .map(|batch| batch.batch_id)
                    .collect();
                let affected_documents = view.get_documents(txn, &changed_keys)?;
                Ok(UserChangeResult {
                    affected_documents,
                    removed_batch_ids,
                    added_batch_ids,
                })
            },
        )
    }

    /// Queues `mutations` as one batch and returns the new local views of
    /// the documents it touches.
    pub fn write_locally(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|m| m.key().clone()).collect();
        let view = self.local_documents;

        run_transaction(
            self.persistence.as_mut(),
            "Locally write mutations",
            TransactionMode::ReadWrite,
            &self.user,
            |txn| {
                let remote_documents = txn.remote_documents.get_entries(&keys)?;
                let without_remote_version: BTreeSet<DocumentKey> = remote_documents
                    .values()
                    .filter(|document| !document.is_valid_document())
                    .map(|document| document.key().clone())
                    .collect();
                let mut overlayed = view.get_overlayed_documents(txn, remote_documents)?;

                // Increments are computed against the value the user saw, so
                // record that value as a base write for later recomputation.
                let mut base_mutations = Vec::new();
                for mutation in &mutations {
                    let Some(current) = overlayed.get(mutation.key()) else {
                        continue;
                    };
                    if let Some(base_value) = mutation.extract_transform_base_value(&current.document) {
                        let mask = FieldMask::from_map_value(&base_value);
                        base_mutations.push(Mutation::patch(mutation.key().clone(), base_value, mask));
                    }
                }

                let batch = txn
                    .mutation_queue
                    .add_mutation_batch(local_write_time, base_mutations, mutations)?;
                for key in &keys {
                    txn.index_manager
                        .add_to_collection_parent_index(&key.collection_path())?;
                }
                let overlays = batch.apply_to_local_document_set(&mut overlayed, &without_remote_version);
                txn.document_overlays.save_overlays(batch.batch_id, &overlays)?;

                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: overlayed
                        .into_iter()
                        .map(|(key, overlayed)| (key, overlayed.document))
                        .collect(),
                })
            },
        )
    }

    /// Applies a server-acknowledged batch to the remote document cache and
    /// drops it from the queue. Returns the affected documents' local views.
    pub fn acknowledge_batch(&mut self, result: &MutationBatchResult) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let view = self.local_documents;
        run_transaction(
            self.persistence.as_mut(),
            "Acknowledge batch",
            TransactionMode::ReadWritePrimary,
            &self.user,
            |txn| {
                let affected = result.batch.keys();
                txn.mutation_queue
                    .acknowledge_batch(&result.batch, result.stream_token.clone())?;

                let mut buffer = RemoteDocumentChangeBuffer::new();
                apply_write_to_remote_documents(txn, &mut buffer, result)?;
                buffer.apply(txn.remote_documents)?;
                for key in &affected {
                    txn.references.mark_potentially_orphaned(key);
                }
                txn.mutation_queue.remove_mutation_batch(&result.batch)?;
                txn.mutation_queue.perform_consistency_check()?;

                txn.document_overlays
                    .remove_overlays_for_batch_id(result.batch.batch_id)?;
                view.recalculate_overlays(txn, &affected)?;
                view.get_documents(txn, &affected)
            },
        )
    }

    /// Drops a batch the backend refused and rolls its keys back to the
    /// remaining pending writes.
    pub fn reject_batch(&mut self, batch_id: i32) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let view = self.local_documents;
        run_transaction(
            self.persistence.as_mut(),
            "Reject batch",
            TransactionMode::ReadWritePrimary,
            &self.user,
            |txn| {
                let Some(batch) = txn.mutation_queue.lookup_mutation_batch(batch_id)? else {
                    fail(format!("Attempt to reject nonexistent batch {batch_id}"));
                };
                let affected = batch.keys();
                txn.mutation_queue.remove_mutation_batch(&batch)?;
                for key in &affected {
                    txn.references.mark_potentially_orphaned(key);
                }
                txn.mutation_queue.perform_consistency_check()?;

                txn.document_overlays.remove_overlays_for_batch_id(batch_id)?;
                view.recalculate_overlays(txn, &affected)?;
                view.get_documents(txn, &affected)
            },
        )
    }

    pub fn get_highest_unacknowledged_batch_id(&mut self) -> FirestoreResult<i32> {
        run_transaction(
            self.persistence.as_mut(),
            "Get highest unacknowledged batch id",
            TransactionMode::ReadOnly,
            &self.user,
            |txn| txn.mutation_queue.highest_unacknowledged_batch_id(),
        )
    }

    pub fn get_last_stream_token(&mut self) -> FirestoreResult<Vec<u8>> {
        run_transaction(
            self.persistence.as_mut(),
            "Get last stream token",
            TransactionMode::ReadOnly,
            &self.user,
            |txn| txn.mutation_queue.last_stream_token(),
        )
    }

    pub fn set_last_stream_token(&mut self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        run_transaction(
            self.persistence.as_mut(),
            "Set last stream token",
            TransactionMode::ReadWritePrimary,
            &self.user,
            |txn| txn.mutation_queue.set_last_stream_token(stream_token),
        )
    }

    pub fn get_last_remote_snapshot_version(&mut self) -> FirestoreResult<SnapshotVersion> {
        run_transaction(
            self.persistence.as_mut(),
            "Get last remote snapshot version",
            TransactionMode::ReadOnly,
            &self.user,
            |txn| txn.targets.last_remote_snapshot_version(),
        )
    }

    /// Applies a watch snapshot to the caches and returns the local views of
    /// every document it changed.
    pub fn apply_remote_event(&mut self, event: &RemoteEvent) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let remote_version = event.snapshot_version;
        let mut new_target_data_by_target = self.target_data_by_target.clone();
        let view = self.local_documents;

        let changes = run_transaction(
            self.persistence.as_mut(),
            "Apply remote event",
            TransactionMode::ReadWritePrimary,
            &self.user,
            |txn| {
                for (target_id, change) in &event.target_changes {
                    let Some(old_target_data) = new_target_data_by_target.get(target_id).cloned() else {
                        continue;
                    };

                    remove_matching_keys(txn, &change.removed_documents, *target_id)?;
                    add_matching_keys(txn, &change.added_documents, *target_id)?;

                    let mut new_target_data = old_target_data
                        .clone()
                        .with_sequence_number(txn.current_sequence_number);
                    if event.target_mismatches.contains_key(target_id) {
                        new_target_data = new_target_data
                            .with_resume_token(Vec::new(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() {
                        new_target_data = new_target_data.with_resume_token(change.resume_token.clone(), remote_version);
                    }

                    new_target_data_by_target.insert(*target_id, new_target_data.clone());
                    if should_persist_target_data(&old_target_data, &new_target_data, change) {
                        txn.targets.update_target_data(new_target_data)?;
                    }
                }

                for key in event.document_updates.keys() {
                    if event.resolved_limbo_documents.contains(key) {
                        txn.references.update_limbo_document(key);
                    }
                }

                let mut buffer = RemoteDocumentChangeBuffer::new();
                let (changed_documents, existence_changed) =
                    populate_document_change_buffer(txn, &mut buffer, &event.document_updates)?;

                if !remote_version.is_min() {
                    let last_remote_version = txn.targets.last_remote_snapshot_version()?;
                    hard_assert(
                        remote_version >= last_remote_version,
                        format!("Watch stream reverted to previous snapshot?? {remote_version} < {last_remote_version}"),
                    );
                    txn.targets.set_target_snapshot_version(remote_version)?;
                }

                buffer.apply(txn.remote_documents)?;
                view.get_local_view_of_documents(txn, changed_documents, &existence_changed)
            },
        )?;

        self.target_data_by_target = new_target_data_by_target;
        Ok(changes)
    }

    /// Pins documents shown by live views and records the snapshot version
    /// at which synced views were free of limbo documents.
    pub fn notify_local_view_changes(&mut self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        run_transaction(
            self.persistence.as_mut(),
            "Notify local view changes",
            TransactionMode::ReadWrite,
            &self.user,
            |txn| {
                for change in view_changes {
                    for key in &change.added_keys {
                        txn.references.add_local_view_reference(key, change.target_id);
                    }
                    for key in &change.removed_keys {
                        txn.references.remove_local_view_reference(key, change.target_id);
                    }
                }
                Ok(())
            },
        )?;

        for change in view_changes.iter().filter(|change| !change.from_cache) {
            let Some(target_data) = self.target_data_by_target.get(&change.target_id) else {
                fail(format!(
                    "Can't set limbo-free snapshot version for unknown target: {}",
                    change.target_id
                ));
            };
            let last_limbo_free = target_data.snapshot_version;
            let updated = target_data
                .clone()
                .with_last_limbo_free_snapshot_version(last_limbo_free);
            self.target_data_by_target.insert(change.target_id, updated);
        }
        Ok(())
    }

    /// The oldest pending batch with an id greater than `after_batch_id`.
    pub fn next_mutation_batch(&mut self, after_batch_id: Option<i32>) -> FirestoreResult<Option<MutationBatch>> {
        let after_batch_id = after_batch_id.unwrap_or(BATCH_ID_UNKNOWN);
        run_transaction(
            self.persistence.as_mut(),
            "Get next mutation batch",
            TransactionMode::ReadOnly,
            &self.user,
            |txn| txn.mutation_queue.next_mutation_batch_after_batch_id(after_batch_id),
        )
    }

    pub fn read_document(&mut self, key: &DocumentKey) -> FirestoreResult<Document> {
        let view = self.local_documents;
        run_transaction(
            self.persistence.as_mut(),
            "Read document",
            TransactionMode::ReadOnly,
            &self.user,
            |txn| view.get_document(txn, key),
        )
    }

    /// Returns the target data for `target`, creating it with a fresh target
    /// id when no structurally equal target is known.
    pub fn allocate_target(&mut self, target: Target) -> FirestoreResult<TargetData> {
        let target_data = run_transaction(
            self.persistence.as_mut(),
            "Allocate target",
            TransactionMode::ReadWrite,
            &self.user,
            |txn| {
                if let Some(cached) = txn.targets.get_target_data(&target)? {
                    return Ok(cached);
                }
                let target_id = txn.targets.allocate_target_id()?;
                let target_data = TargetData::new(
                    target.clone(),
                    target_id,
                    TargetPurpose::Listen,
                    txn.current_sequence_number,
                );
                txn.targets.add_target_data(target_data.clone())?;
                Ok(target_data)
            },
        )?;

        let is_newer = self
            .target_data_by_target
            .get(&target_data.target_id)
            .map_or(true, |cached| target_data.snapshot_version > cached.snapshot_version);
        if is_newer {
            self.target_data_by_target
                .insert(target_data.target_id, target_data.clone());
            self.target_id_by_canonical_id
                .insert(target_data.target.canonical_id(), target_data.target_id);
        }
        Ok(target_data)
    }

    pub fn get_target_data(&mut self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        if let Some(target_data) = self
            .target_id_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|target_id| self.target_data_by_target.get(target_id))
        {
            return Ok(Some(target_data.clone()));
        }
        run_transaction(
            self.persistence.as_mut(),
            "Get target data",
            TransactionMode::ReadOnly,
            &self.user,
            |txn| txn.targets.get_target_data(target),
        )
    }

    /// Stops tracking a target. Its cached documents become eligible for
    /// garbage collection unless `keep_persisted_target_data` is set.
    pub fn release_target(&mut self, target_id: i32, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let Some(target_data) = self.target_data_by_target.get(&target_id).cloned() else {
            fail(format!("Tried to release nonexistent target: {target_id}"));
        };
        let mode = if keep_persisted_target_data {
            TransactionMode::ReadWrite
        } else {
            TransactionMode::ReadWritePrimary
        };

        run_transaction(self.persistence.as_mut(), "Release target", mode, &self.user, |txn| {
            txn.references.remove_local_view_references_for_target(target_id);
            if !keep_persisted_target_data {
                let matching_keys = txn.targets.get_matching_keys_for_target_id(target_id)?;
                txn.references.remove_target(target_id, &matching_keys);
                txn.targets.remove_target_data(&target_data)?;
            }
            Ok(())
        })?;

        self.target_data_by_target.remove(&target_id);
        self.target_id_by_canonical_id
            .remove(&target_data.target.canonical_id());
        Ok(())
    }

    /// Runs `query` against the local cache. With `use_previous_results`, the
    /// keys of the query's last synced result narrow the scan.
    pub fn execute_query(&mut self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let target = query.to_target();
        let known = self
            .target_id_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|target_id| self.target_data_by_target.get(target_id))
            .cloned();
        let engine = self.query_engine;

        run_transaction(
            self.persistence.as_mut(),
            "Execute query",
            TransactionMode::ReadWrite,
            &self.user,
            |txn| {
                let target_data = match known {
                    Some(target_data) => Some(target_data),
                    None => txn.targets.get_target_data(&target)?,
                };
                let (last_limbo_free, remote_keys) = match &target_data {
                    Some(target_data) => (
                        target_data.last_limbo_free_snapshot_version,
                        txn.targets.get_matching_keys_for_target_id(target_data.target_id)?,
                    ),
                    None => (SnapshotVersion::min(), BTreeSet::new()),
                };

                let documents = if use_previous_results {
                    engine.get_documents_matching_query(txn, query, last_limbo_free, &remote_keys)?
                } else {
                    engine.get_documents_matching_query(txn, query, SnapshotVersion::min(), &BTreeSet::new())?
                };
                Ok(QueryResult {
                    documents,
                    remote_keys,
                })
            },
        )
    }

    pub fn get_remote_document_keys(&mut self, target_id: i32) -> FirestoreResult<BTreeSet<DocumentKey>> {
        run_transaction(
            self.persistence.as_mut(),
            "Remote document keys",
            TransactionMode::ReadOnly,
            &self.user,
            |txn| txn.targets.get_matching_keys_for_target_id(target_id),
        )
    }

    /// Whether a bundle with the same id and an equal or later create time
    /// was already loaded.
    pub fn has_newer_bundle(&mut self, metadata: &BundleMetadata) -> FirestoreResult<bool> {
        run_transaction(
            self.persistence.as_mut(),
            "Has newer bundle",
            TransactionMode::ReadOnly,
            &self.user,
            |txn| {
                let cached = txn.bundles.get_bundle_metadata(&metadata.id)?;
                Ok(cached.is_some_and(|cached| cached.create_time >= metadata.create_time))
            },
        )
    }

    pub fn save_bundle(&mut self, metadata: BundleMetadata) -> FirestoreResult<()> {
        run_transaction(
            self.persistence.as_mut(),
            "Save bundle",
            TransactionMode::ReadWrite,
            &self.user,
            |txn| txn.bundles.save_bundle_metadata(metadata),
        )
    }

    /// Saves a named query and, when its read time is newer than what the
    /// target already knows, makes `documents` the target's matching keys.
    pub fn save_named_query(&mut self, query: NamedQuery, documents: &BTreeSet<DocumentKey>) -> FirestoreResult<()> {
        let allocated = self.allocate_target(query.query.to_target())?;
        let read_time = query.read_time;

        let mut updated = None;
        run_transaction(
            self.persistence.as_mut(),
            "Save named query",
            TransactionMode::ReadWrite,
            &self.user,
            |txn| {
                if allocated.snapshot_version >= read_time {
                    return txn.bundles.save_named_query(query);
                }
                let new_target_data = allocated.clone().with_resume_token(Vec::new(), read_time);
                txn.targets.update_target_data(new_target_data.clone())?;
                let previous = txn.targets.remove_matching_keys_for_target_id(allocated.target_id)?;
                for key in &previous {
                    txn.references.remove_reference(allocated.target_id, key);
                }
                add_matching_keys(txn, documents, allocated.target_id)?;
                updated = Some(new_target_data);
                txn.bundles.save_named_query(query)
            },
        )?;

        if let Some(target_data) = updated {
            self.target_data_by_target
                .insert(target_data.target_id, target_data);
        }
        Ok(())
    }

    pub fn get_named_query(&mut self, name: &str) -> FirestoreResult<Option<NamedQuery>> {
        run_transaction(
            self.persistence.as_mut(),
            "Get named query",
            TransactionMode::ReadOnly,
            &self.user,
            |txn| txn.bundles.get_named_query(name),
        )
    }
}

/// Whether updated target metadata should be written to the target cache
/// rather than kept only in memory.
pub(crate) fn should_persist_target_data(
    old_target_data: &TargetData,
    new_target_data: &TargetData,
    change: &TargetChange,
) -> bool {
    if old_target_data.resume_token.is_empty() {
        return true;
    }
    let time_delta = new_target_data.snapshot_version.to_micros() - old_target_data.snapshot_version.to_micros();
    if time_delta >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    let changes =
        change.added_documents.len() + change.modified_documents.len() + change.removed_documents.len();
    changes > 0
}

fn add_matching_keys(
    txn: &mut PersistenceTransaction<'_>,
    keys: &BTreeSet<DocumentKey>,
    target_id: i32,
) -> FirestoreResult<()> {
    txn.targets.add_matching_keys(keys, target_id)?;
    for key in keys {
        txn.references.add_reference(target_id, key);
    }
    Ok(())
}

fn remove_matching_keys(
    txn: &mut PersistenceTransaction<'_>,
    keys: &BTreeSet<DocumentKey>,
    target_id: i32,
) -> FirestoreResult<()> {
    txn.targets.remove_matching_keys(keys, target_id)?;
    for key in keys {
        txn.references.remove_reference(target_id, key);
    }
    Ok(())
}

fn apply_write_to_remote_documents(
    txn: &mut PersistenceTransaction<'_>,
    buffer: &mut RemoteDocumentChangeBuffer,
    result: &MutationBatchResult,
) -> FirestoreResult<()> {
    for key in result.batch.keys() {
        let mut document = buffer.get_entry(&*txn.remote_documents, &key)?;
        let Some(ack_version) = result.doc_versions.get(&key) else {
            fail("ackVersions should contain every doc in the write.");
        };
        if document.version() < *ack_version {
            result.batch.apply_to_remote_document(&mut document, result);
            if document.is_valid_document() {
                document.set_read_time(result.commit_version);
                buffer.add_entry(document);
            }
        }
    }
    Ok(())
}

/// Stages newer documents from a remote event. Returns the staged documents
/// and the keys whose existence flipped.
fn populate_document_change_buffer(
    txn: &mut PersistenceTransaction<'_>,
    buffer: &mut RemoteDocumentChangeBuffer,
    documents: &BTreeMap<DocumentKey, Document>,
) -> FirestoreResult<(BTreeMap<DocumentKey, Document>, BTreeSet<DocumentKey>)> {
    let keys: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
    let existing = buffer.get_entries(&*txn.remote_documents, &keys)?;

    let mut changed = BTreeMap::new();
    let mut existence_changed = BTreeSet::new();
    for (key, document) in documents {
        let Some(existing) = existing.get(key) else {
            continue;
        };
        if document.is_found_document() != existing.is_found_document() {
            existence_changed.insert(key.clone());
        }

        if document.is_no_document() && document.version().is_min() {
            // A rejected limbo resolution; forget the document entirely.
            buffer.remove_entry(key.clone(), document.read_time());
            changed.insert(key.clone(), document.clone());
        } else if !existing.is_valid_document()
            || document.version() > existing.version()
            || (document.version() == existing.version() && existing.has_pending_writes())
        {
            hard_assert(
                !document.read_time().is_min(),
                "Cannot add a document when the remote version is zero",
            );
            txn.index_manager
                .add_to_collection_parent_index(&key.collection_path())?;
            buffer.add_entry(document.clone());
            changed.insert(key.clone(), document.clone());
        } else {
            log::debug!(
                "Ignoring outdated watch update for {key}. Current version: {} Watch version: {}",
                existing.version(),
                document.version()
            );
        }
    }
    Ok((changed, existence_changed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::memory_persistence::MemoryPersistence;
    use crate::firestore::model::{MutationResult, Precondition};
    use crate::firestore::test_support::*;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn new_store() -> LocalStore {
        let mut store = LocalStore::new(Box::new(MemoryPersistence::new()), User::unauthenticated());
        store.start().unwrap();
        store
    }

    fn ack(batch: MutationBatch, seconds: i64) -> MutationBatchResult {
        let results = batch
            .mutations
            .iter()
            .map(|_| mutation_result(seconds))
            .collect();
        MutationBatchResult::new(batch, version(seconds), results, Vec::new())
    }

    fn pending_batch(store: &mut LocalStore, batch_id: i32) -> MutationBatch {
        store
            .next_mutation_batch(Some(batch_id - 1))
            .unwrap()
            .expect("pending batch")
    }

    fn listen(store: &mut LocalStore, path: &str) -> TargetData {
        store.allocate_target(query(path).to_target()).unwrap()
    }

    fn remote_event(seconds: i64, target_id: i32, docs: Vec<Document>) -> RemoteEvent {
        let mut change = TargetChange {
            resume_token: vec![seconds as u8],
            current: true,
            ..TargetChange::default()
        };
        let mut event = RemoteEvent {
            snapshot_version: version(seconds),
            ..RemoteEvent::default()
        };
        for document in docs {
            change.added_documents.insert(document.key().clone());
            event.document_updates.insert(document.key().clone(), document);
        }
        event.target_changes.insert(target_id, change);
        event
    }

    fn count(document: &Document) -> Option<FirestoreValue> {
        document.field(&field("count")).cloned()
    }

    #[test]
    fn local_write_is_visible_before_ack() {
        let mut store = new_store();
        let result = store
            .write_locally(vec![set_mutation("rooms/a", map(&[("name", string("lobby"))]))])
            .unwrap();
        assert_eq!(result.batch_id, 1);

        let document = store.read_document(&key("rooms/a")).unwrap();
        assert!(document.is_found_document());
        assert!(document.has_local_mutations());
        assert_eq!(document.field(&field("name")), Some(&string("lobby")));
    }

    #[test]
    fn acknowledged_write_reaches_remote_cache() {
        let mut store = new_store();
        store
            .write_locally(vec![set_mutation("rooms/a", map(&[("name", string("lobby"))]))])
            .unwrap();
        let batch = pending_batch(&mut store, 1);
        let target = listen(&mut store, "rooms");
        store
            .apply_remote_event(&remote_event(1, target.target_id, Vec::new()))
            .unwrap();

        let changes = store.acknowledge_batch(&ack(batch, 2)).unwrap();
        let document = &changes[&key("rooms/a")];
        assert!(document.has_committed_mutations());
        assert_eq!(document.version(), version(2));
        assert_eq!(store.get_highest_unacknowledged_batch_id().unwrap(), BATCH_ID_UNKNOWN);
    }

    #[test]
    fn rejected_write_rolls_back_to_server_state() {
        let mut store = new_store();
        let target = listen(&mut store, "rooms");
        store
            .apply_remote_event(&remote_event(1, target.target_id, vec![doc("rooms/a", 1, map(&[("n", int(1))]))]))
            .unwrap();
        store
            .write_locally(vec![patch_mutation("rooms/a", map(&[("n", int(2))]))])
            .unwrap();
        assert_eq!(store.read_document(&key("rooms/a")).unwrap().field(&field("n")), Some(&int(2)));

        let changes = store.reject_batch(1).unwrap();
        assert_eq!(changes[&key("rooms/a")].field(&field("n")), Some(&int(1)));
        assert!(!changes[&key("rooms/a")].has_local_mutations());
    }

    #[test]
    fn stale_remote_update_is_ignored() {
        let mut store = new_store();
        let target = listen(&mut store, "rooms");
        store
            .apply_remote_event(&remote_event(5, target.target_id, vec![doc("rooms/a", 5, map(&[("v", int(5))]))]))
            .unwrap();

        let mut stale = remote_event(6, target.target_id, Vec::new());
        stale
            .document_updates
            .insert(key("rooms/a"), doc("rooms/a", 3, map(&[("v", int(3))])));
        let changes = store.apply_remote_event(&stale).unwrap();
        assert!(changes.is_empty());

        let document = store.read_document(&key("rooms/a")).unwrap();
        assert_eq!(document.version(), version(5));
        assert_eq!(document.field(&field("v")), Some(&int(5)));
    }

    #[test]
    fn increments_compose_across_partial_ack() {
        let mut store = new_store();
        let target = listen(&mut store, "counters");
        store
            .apply_remote_event(&remote_event(
                1,
                target.target_id,
                vec![doc("counters/c", 1, map(&[("count", int(10))]))],
            ))
            .unwrap();

        store.write_locally(vec![increment("counters/c", "count", 1)]).unwrap();
        store.write_locally(vec![increment("counters/c", "count", 2)]).unwrap();
        assert_eq!(count(&store.read_document(&key("counters/c")).unwrap()), Some(int(13)));

        let first = pending_batch(&mut store, 1);
        let mut result = MutationResult::new(version(2));
        result.transform_results = vec![int(11)];
        let ack = MutationBatchResult::new(first, version(2), vec![result], Vec::new());
        store.acknowledge_batch(&ack).unwrap();

        let document = store.read_document(&key("counters/c")).unwrap();
        assert_eq!(count(&document), Some(int(13)));
        assert!(document.has_local_mutations());
    }

    #[test]
    fn incremental_overlay_matches_full_recalculation() {
        let mutations = vec![
            set_mutation("rooms/a", map(&[("a", int(1)), ("b", int(1))])),
            patch_mutation("rooms/a", map(&[("b", int(2))])),
            increment("rooms/a", "a", 5),
            patch_mutation("rooms/a", map(&[("c.d", string("x"))])),
            delete_mutation("rooms/a"),
            set_mutation("rooms/a", map(&[("z", int(0))])),
            increment("rooms/a", "z", 3),
        ];

        for prefix in 1..=mutations.len() {
            let mut incremental = new_store();
            for mutation in &mutations[..prefix] {
                incremental.write_locally(vec![mutation.clone()]).unwrap();
            }
            let incremental_view = incremental.read_document(&key("rooms/a")).unwrap();

            let mut recomputed = new_store();
            for mutation in &mutations[..prefix] {
                recomputed.write_locally(vec![mutation.clone()]).unwrap();
            }
            let view = recomputed.local_documents;
            let from_scratch = run_transaction(
                recomputed.persistence.as_mut(),
                "recalculate",
                TransactionMode::ReadWrite,
                &User::unauthenticated(),
                |txn| {
                    view.recalculate_overlays(txn, &keys(&["rooms/a"]))?;
                    view.get_document(txn, &key("rooms/a"))
                },
            )
            .unwrap();

            assert_eq!(incremental_view.contents(), from_scratch.contents(), "prefix {prefix}");
            assert_eq!(incremental_view.state(), from_scratch.state(), "prefix {prefix}");
        }
    }

    #[test]
    fn patch_without_base_document_stays_invisible() {
        let mut store = new_store();
        store
            .write_locally(vec![patch_mutation("rooms/a", map(&[("n", int(1))]))])
            .unwrap();
        let document = store.read_document(&key("rooms/a")).unwrap();
        assert!(!document.is_found_document());
    }

    #[test]
    fn executes_queries_with_local_writes() {
        let mut store = new_store();
        let target = listen(&mut store, "rooms");
        store
            .apply_remote_event(&remote_event(
                1,
                target.target_id,
                vec![doc("rooms/a", 1, MapValue::empty()), doc("rooms/b", 1, MapValue::empty())],
            ))
            .unwrap();
        store
            .write_locally(vec![delete_mutation("rooms/a"), set_mutation("rooms/c", MapValue::empty())])
            .unwrap();

        let result = store.execute_query(&query("rooms"), true).unwrap();
        let found: Vec<DocumentKey> = result.documents.keys().cloned().collect();
        assert_eq!(found, vec![key("rooms/b"), key("rooms/c")]);
        assert_eq!(result.remote_keys, keys(&["rooms/a", "rooms/b"]));
    }

    #[test]
    fn collection_group_queries_fan_out_over_parents() {
        let mut store = new_store();
        store
            .write_locally(vec![
                set_mutation("rooms/a/messages/1", MapValue::empty()),
                set_mutation("rooms/b/messages/2", MapValue::empty()),
                set_mutation("rooms/b/members/3", MapValue::empty()),
            ])
            .unwrap();

        let group = Query::collection_group(path(""), "messages");
        let result = store.execute_query(&group, false).unwrap();
        assert_eq!(result.documents.len(), 2);
    }

    #[test]
    fn allocate_reuses_structurally_equal_targets() {
        let mut store = new_store();
        let first = listen(&mut store, "rooms");
        let second = listen(&mut store, "rooms");
        let other = listen(&mut store, "games");
        assert_eq!(first.target_id, second.target_id);
        assert_eq!(first.target_id, 2);
        assert_eq!(other.target_id, 4);
    }

    #[test]
    fn releasing_target_collects_unreferenced_documents() {
        let mut store = new_store();
        let target = listen(&mut store, "rooms");
        store
            .apply_remote_event(&remote_event(1, target.target_id, vec![doc("rooms/a", 1, MapValue::empty())]))
            .unwrap();
        assert!(store.read_document(&key("rooms/a")).unwrap().is_found_document());

        store.release_target(target.target_id, false).unwrap();
        assert!(!store.read_document(&key("rooms/a")).unwrap().is_valid_document());
    }

    #[test]
    fn mismatch_clears_resume_token() {
        let mut store = new_store();
        let target = listen(&mut store, "rooms");
        store
            .apply_remote_event(&remote_event(1, target.target_id, Vec::new()))
            .unwrap();
        let mut mismatch = remote_event(2, target.target_id, Vec::new());
        mismatch
            .target_mismatches
            .insert(target.target_id, TargetPurpose::ExistenceFilterMismatch);
        store.apply_remote_event(&mismatch).unwrap();

        let data = store.get_target_data(&query("rooms").to_target()).unwrap().unwrap();
        assert!(data.resume_token.is_empty());
        assert!(data.snapshot_version.is_min());
    }

    #[test]
    fn user_change_swaps_mutation_queue() {
        let mut store = new_store();
        store
            .write_locally(vec![set_mutation("rooms/a", MapValue::empty())])
            .unwrap();

        let result = store.handle_user_change(User::new("alice")).unwrap();
        assert_eq!(result.removed_batch_ids, vec![1]);
        assert!(result.added_batch_ids.is_empty());
        assert!(!result.affected_documents[&key("rooms/a")].is_found_document());

        let back = store.handle_user_change(User::unauthenticated()).unwrap();
        assert_eq!(back.added_batch_ids, vec![1]);
        assert!(back.affected_documents[&key("rooms/a")].is_found_document());
    }

    #[test]
    fn stream_token_is_scoped_to_user() {
        let mut store = new_store();
        store.set_last_stream_token(b"W1".to_vec()).unwrap();
        assert_eq!(store.get_last_stream_token().unwrap(), b"W1".to_vec());

        store.handle_user_change(User::new("alice")).unwrap();
        assert!(store.get_last_stream_token().unwrap().is_empty());
    }

    #[test]
    fn resume_tokens_persist_on_age_or_changes() {
        let target = query("rooms").to_target();
        let old = TargetData::new(target, 2, TargetPurpose::Listen, 1).with_resume_token(vec![1], version(10));
        let fresh = old.clone().with_resume_token(vec![2], version(20));
        assert!(!should_persist_target_data(&old, &fresh, &TargetChange::default()));

        let aged = old.clone().with_resume_token(vec![2], version(10 + 5 * 60));
        assert!(should_persist_target_data(&old, &aged, &TargetChange::default()));

        let mut change = TargetChange::default();
        change.added_documents.insert(key("rooms/a"));
        assert!(should_persist_target_data(&old, &fresh, &change));
    }

    #[test]
    fn base_mutation_records_increment_operand() {
        let mut store = new_store();
        let target = listen(&mut store, "counters");
        store
            .apply_remote_event(&remote_event(1, target.target_id, vec![doc("counters/c", 1, map(&[("count", int(4))]))]))
            .unwrap();
        store.write_locally(vec![increment("counters/c", "count", 1)]).unwrap();

        let batch = pending_batch(&mut store, 1);
        assert_eq!(batch.base_mutations.len(), 1);
        assert_eq!(batch.base_mutations[0].precondition(), &Precondition::Exists(true));
    }

    #[test]
    fn named_queries_round_trip() {
        let mut store = new_store();
        let named = NamedQuery {
            name: "open-rooms".to_string(),
            query: query("rooms"),
            read_time: version(3),
        };
        store.save_named_query(named.clone(), &keys(&["rooms/a"])).unwrap();
        assert_eq!(store.get_named_query("open-rooms").unwrap(), Some(named));

        let target = store.get_target_data(&query("rooms").to_target()).unwrap().unwrap();
        assert_eq!(target.snapshot_version, version(3));
        assert_eq!(store.get_remote_document_keys(target.target_id).unwrap(), keys(&["rooms/a"]));

        let bundle = BundleMetadata {
            id: "b".to_string(),
            version: 1,
            create_time: version(5),
        };
        assert!(!store.has_newer_bundle(&bundle).unwrap());
        store.save_bundle(bundle.clone()).unwrap();
        assert!(store.has_newer_bundle(&bundle).unwrap());
    }
}
