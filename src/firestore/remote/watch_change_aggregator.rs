use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::view_snapshot::ChangeType;
use crate::firestore::local::{TargetData, TargetPurpose};
use crate::firestore::model::{DatabaseId, Document, DocumentKey, SnapshotVersion};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, TargetChangeState, WatchTargetChange,
};
use crate::util::assert::hard_assert;

/// What the aggregator needs to know about targets it does not own.
pub trait TargetMetadataProvider {
    /// Keys the local store considers part of the target's last synced result.
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey>;

    /// Target data of an actively listened target.
    fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData>;

    fn database_id(&self) -> &DatabaseId;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    Skipped,
    FalsePositive,
}

/// Folds watch frames into [`RemoteEvent`]s.
///
/// Changes accumulate per target until the backend marks a consistent
/// snapshot, at which point [`WatchChangeAggregator::create_remote_event`]
/// hands them over in one piece.
#[derive(Debug, Default)]
pub struct WatchChangeAggregator {
    target_states: BTreeMap<i32, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, Document>,
    /// Targets each pending document was added to or removed from.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<i32>>,
    pending_target_resets: BTreeMap<i32, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn handle_document_change<P>(&mut self, provider: &P, change: DocumentWatchChange)
    where
        P: TargetMetadataProvider + ?Sized,
    {
        let found = change
            .new_document
            .as_ref()
            .filter(|document| document.is_found_document());
        for target_id in &change.updated_target_ids {
            match found {
                Some(document) => self.add_document_to_target(provider, *target_id, document.clone()),
                None => self.remove_document_from_target(
                    provider,
                    *target_id,
                    change.key.clone(),
                    change.new_document.clone(),
                ),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(provider, *target_id, change.key.clone(), change.new_document.clone());
        }
    }

    pub fn handle_target_change<P>(&mut self, provider: &P, change: &WatchTargetChange)
    where
        P: TargetMetadataProvider + ?Sized,
    {
        for target_id in self.target_ids_for(change) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(provider, target_id) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Add => {
                    // The target is active once every request it was part of
                    // has been answered.
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        state.clear_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Remove => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                    hard_assert(
                        change.cause.is_none(),
                        "WatchChangeAggregator does not handle errored targets",
                    );
                }
                TargetChangeState::Current => {
                    if self.is_active_target(provider, target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(provider, target_id) {
                        self.reset_target(provider, target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Compares the backend's document count for a target with the local
    /// one. On a mismatch the bloom filter, when present, removes exactly the
    /// documents the backend no longer has; otherwise the target is reset and
    /// re-listened without a resume token.
    pub fn handle_existence_filter<P>(&mut self, provider: &P, change: &ExistenceFilterChange)
    where
        P: TargetMetadataProvider + ?Sized,
    {
        let target_id = change.target_id;
        let expected_count = change.count;
        let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
            return;
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The document was deleted; there is no delete frame for it.
                let key = match DocumentKey::from_path(target_data.target.path().clone()) {
                    Ok(key) => key,
                    Err(err) => {
                        log::warn!("Ignoring existence filter for malformed document target: {err}");
                        return;
                    }
                };
                let deleted = Document::new_no_document(key.clone(), SnapshotVersion::min());
                self.remove_document_from_target(provider, target_id, key, Some(deleted));
            } else if expected_count != 1 {
                log::warn!(
                    "Single document existence filter for target {target_id} has count {expected_count}, resetting target"
                );
                self.reset_target(provider, target_id);
                self.pending_target_resets
                    .insert(target_id, TargetPurpose::ExistenceFilterMismatch);
            }
            return;
        }

        let current_count = self.current_document_count_for_target(provider, target_id);
        if current_count == expected_count as i64 {
            return;
        }

        let status = match parse_bloom_filter(change) {
            Some(filter) => self.apply_bloom_filter(provider, &filter, change, current_count),
            None => BloomFilterApplication::Skipped,
        };
        log::debug!(
            "Existence filter mismatch for target {target_id}: expected {expected_count}, local {current_count}, bloom filter {status:?}"
        );
        if status != BloomFilterApplication::Success {
            self.reset_target(provider, target_id);
            let purpose = if status == BloomFilterApplication::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn apply_bloom_filter<P>(
        &mut self,
        provider: &P,
        filter: &BloomFilter,
        change: &ExistenceFilterChange,
        current_count: i64,
    ) -> BloomFilterApplication
    where
        P: TargetMetadataProvider + ?Sized,
    {
        let removed = self.filter_removed_documents(provider, filter, change.target_id);
        if change.count as i64 == current_count - removed {
            BloomFilterApplication::Success
        } else {
            BloomFilterApplication::FalsePositive
        }
    }

    /// Removes every synced document of the target that the filter does not
    /// contain and returns how many were removed.
    fn filter_removed_documents<P>(&mut self, provider: &P, filter: &BloomFilter, target_id: i32) -> i64
    where
        P: TargetMetadataProvider + ?Sized,
    {
        let database_id = provider.database_id().clone();
        let mut removed = 0;
        for key in provider.get_remote_keys_for_target(target_id) {
            let name = database_id.document_name(&key.path().canonical_string());
            if !filter.might_contain(&name) {
                self.remove_document_from_target(provider, target_id, key, None);
                removed += 1;
            }
        }
        removed
    }

    /// Packages everything accumulated so far into a [`RemoteEvent`] at
    /// `snapshot_version` and starts a new aggregation.
    pub fn create_remote_event<P>(&mut self, provider: &P, snapshot_version: SnapshotVersion) -> RemoteEvent
    where
        P: TargetMetadataProvider + ?Sized,
    {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<i32> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .is_some_and(|state| state.current);

            // A current document target whose document never arrived means
            // the document does not exist.
            if current && target_data.target.is_document_target() {
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    if !self.pending_document_updates.contains_key(&key)
                        && !self.target_contains_document(provider, target_id, &key)
                    {
                        let deleted = Document::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(provider, target_id, key, Some(deleted));
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|target_id| {
                self.target_data_for_active_target(provider, *target_id)
                    .map_or(true, |target_data| target_data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    /// Counts an outstanding listen or unlisten request for the target.
    /// Changes for a target with outstanding requests are ignored.
    pub fn record_pending_target_request(&mut self, target_id: i32) {
        self.ensure_target_state(target_id)
            .record_pending_target_request();
    }

    pub fn remove_target(&mut self, target_id: i32) {
        self.target_states.remove(&target_id);
    }

    fn add_document_to_target<P>(&mut self, provider: &P, target_id: i32, document: Document)
    where
        P: TargetMetadataProvider + ?Sized,
    {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(provider, target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    /// `updated_document` is the new state of the document when known, such
    /// as a `NoDocument` for a delete.
    fn remove_document_from_target<P>(
        &mut self,
        provider: &P,
        target_id: i32,
        key: DocumentKey,
        updated_document: Option<Document>,
    ) where
        P: TargetMetadataProvider + ?Sized,
    {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let contained = self.target_contains_document(provider, target_id, &key);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // The document was added in this aggregation and removed again.
            state.remove_document_change(&key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key, document);
        }
    }

    /// Drops all pending changes of the target and removes its synced
    /// documents, so the next snapshot rebuilds it from scratch.
    fn reset_target<P>(&mut self, provider: &P, target_id: i32)
    where
        P: TargetMetadataProvider + ?Sized,
    {
        hard_assert(
            !self
                .target_states
                .get(&target_id)
                .is_some_and(TargetState::is_pending),
            "Should only reset active targets",
        );
        self.target_states.insert(target_id, TargetState::new());
        for key in provider.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(provider, target_id, key, None);
        }
    }

    fn current_document_count_for_target<P>(&mut self, provider: &P, target_id: i32) -> i64
    where
        P: TargetMetadataProvider + ?Sized,
    {
        let change = self.ensure_target_state(target_id).to_target_change();
        provider.get_remote_keys_for_target(target_id).len() as i64 + change.added_documents.len() as i64
            - change.removed_documents.len() as i64
    }

    fn target_ids_for(&self, change: &WatchTargetChange) -> Vec<i32> {
        if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        }
    }

    fn ensure_target_state(&mut self, target_id: i32) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    fn is_active_target<P>(&self, provider: &P, target_id: i32) -> bool
    where
        P: TargetMetadataProvider + ?Sized,
    {
        self.target_data_for_active_target(provider, target_id)
            .is_some()
    }

    fn target_data_for_active_target<P>(&self, provider: &P, target_id: i32) -> Option<TargetData>
    where
        P: TargetMetadataProvider + ?Sized,
    {
        if self
            .target_states
            .get(&target_id)
            .is_some_and(TargetState::is_pending)
        {
            return None;
        }
        provider.get_target_data_for_target(target_id)
    }

    fn target_contains_document<P>(&self, provider: &P, target_id: i32, key: &DocumentKey) -> bool
    where
        P: TargetMetadataProvider + ?Sized,
    {
        provider.get_remote_keys_for_target(target_id).contains(key)
    }
}

fn parse_bloom_filter(change: &ExistenceFilterChange) -> Option<BloomFilter> {
    let payload = change.unchanged_names.as_ref()?;
    match BloomFilter::new(payload.bitmap.clone(), payload.padding, payload.hash_count) {
        Ok(filter) if filter.bit_count() == 0 => None,
        Ok(filter) => Some(filter),
        Err(err) => {
            log::warn!("Applying bloom filter failed: {err}");
            None
        }
    }
}

#[derive(Debug)]
struct TargetState {
    /// Listen and unlisten requests not yet acknowledged by the backend.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    /// Starts out set so a new target always produces a change, even an
    /// empty one.
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            let documents = match change_type {
                ChangeType::Added => &mut change.added_documents,
                ChangeType::Modified | ChangeType::Metadata => &mut change.modified_documents,
                ChangeType::Removed => &mut change.removed_documents,
            };
            documents.insert(key.clone());
        }
        change
    }

    fn clear_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
        hard_assert(
            self.pending_responses >= 0,
            "More target responses than pending requests",
        );
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::bloom_filter::bitmap_for;
    use crate::firestore::remote::watch_change::{BloomFilterPayload, DocumentChange, DocumentDelete, WatchChange};
    use crate::firestore::test_support::*;
    use crate::firestore::value::MapValue;

    struct Targets {
        targets: BTreeMap<i32, TargetData>,
        remote_keys: BTreeMap<i32, BTreeSet<DocumentKey>>,
        database_id: DatabaseId,
    }

    impl Targets {
        fn new() -> Self {
            Self {
                targets: BTreeMap::new(),
                remote_keys: BTreeMap::new(),
                database_id: DatabaseId::default("test-project"),
            }
        }

        fn listen(mut self, target_id: i32, query: Query, purpose: TargetPurpose) -> Self {
            self.targets
                .insert(target_id, TargetData::new(query.to_target(), target_id, purpose, 1));
            self
        }

        fn synced(mut self, target_id: i32, paths: &[&str]) -> Self {
            self.remote_keys.insert(target_id, keys(paths));
            self
        }
    }

    impl TargetMetadataProvider for Targets {
        fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData> {
            self.targets.get(&target_id).cloned()
        }

        fn database_id(&self) -> &DatabaseId {
            &self.database_id
        }
    }

    fn apply(aggregator: &mut WatchChangeAggregator, targets: &Targets, change: WatchChange) {
        match change {
            WatchChange::TargetChange(change) => aggregator.handle_target_change(targets, &change),
            WatchChange::DocumentChange(change) => aggregator.handle_document_change(targets, change.into()),
            WatchChange::DocumentDelete(delete) => aggregator.handle_document_change(targets, delete.into()),
            WatchChange::DocumentRemove(remove) => aggregator.handle_document_change(targets, remove.into()),
            WatchChange::ExistenceFilter(filter) => aggregator.handle_existence_filter(targets, &filter),
        }
    }

    fn added(target_id: i32, document: Document) -> WatchChange {
        WatchChange::DocumentChange(DocumentChange {
            updated_target_ids: vec![target_id],
            removed_target_ids: Vec::new(),
            key: document.key().clone(),
            document: Some(document),
        })
    }

    fn current(target_id: i32, token: u8) -> WatchChange {
        WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Current, vec![target_id]).with_resume_token(vec![token]),
        )
    }

    fn filter(target_id: i32, count: i32, payload: Option<BloomFilterPayload>) -> WatchChange {
        WatchChange::ExistenceFilter(ExistenceFilterChange {
            target_id,
            count,
            unchanged_names: payload,
        })
    }

    fn names(targets: &Targets, paths: &[&str]) -> Vec<String> {
        paths
            .iter()
            .map(|path| targets.database_id.document_name(path))
            .collect()
    }

    #[test]
    fn aggregates_documents_until_snapshot() {
        let targets = Targets::new().listen(2, query("rooms"), TargetPurpose::Listen);
        let mut aggregator = WatchChangeAggregator::new();
        apply(&mut aggregator, &targets, added(2, doc("rooms/a", 1, MapValue::empty())));
        apply(&mut aggregator, &targets, added(2, doc("rooms/b", 1, MapValue::empty())));
        apply(&mut aggregator, &targets, current(2, 7));

        let event = aggregator.create_remote_event(&targets, version(3));
        let change = &event.target_changes[&2];
        assert_eq!(change.added_documents, keys(&["rooms/a", "rooms/b"]));
        assert!(change.current);
        assert_eq!(change.resume_token, vec![7]);
        assert_eq!(event.document_updates[&key("rooms/a")].read_time(), version(3));

        let next = aggregator.create_remote_event(&targets, version(4));
        assert!(next.target_changes.is_empty());
        assert!(next.document_updates.is_empty());
    }

    #[test]
    fn ignores_changes_for_pending_targets() {
        let targets = Targets::new().listen(2, query("rooms"), TargetPurpose::Listen);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.record_pending_target_request(2);
        apply(&mut aggregator, &targets, added(2, doc("rooms/a", 1, MapValue::empty())));
        assert!(aggregator
            .create_remote_event(&targets, version(1))
            .target_changes
            .is_empty());

        apply(
            &mut aggregator,
            &targets,
            WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::Add, vec![2])),
        );
        apply(&mut aggregator, &targets, added(2, doc("rooms/a", 1, MapValue::empty())));
        let event = aggregator.create_remote_event(&targets, version(2));
        assert_eq!(event.target_changes[&2].added_documents, keys(&["rooms/a"]));
    }

    #[test]
    fn deletes_of_synced_documents_are_removals() {
        let targets = Targets::new()
            .listen(2, query("rooms"), TargetPurpose::Listen)
            .synced(2, &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new();
        apply(
            &mut aggregator,
            &targets,
            WatchChange::DocumentDelete(DocumentDelete {
                key: key("rooms/a"),
                read_time: Some(version(5)),
                removed_target_ids: vec![2],
            }),
        );
        let event = aggregator.create_remote_event(&targets, version(5));
        assert_eq!(event.target_changes[&2].removed_documents, keys(&["rooms/a"]));
        assert!(event.document_updates[&key("rooms/a")].is_no_document());
    }

    #[test]
    fn current_document_target_without_document_synthesizes_delete() {
        let targets = Targets::new().listen(1, query("rooms/a"), TargetPurpose::LimboResolution);
        let mut aggregator = WatchChangeAggregator::new();
        apply(&mut aggregator, &targets, current(1, 1));

        let event = aggregator.create_remote_event(&targets, version(9));
        let document = &event.document_updates[&key("rooms/a")];
        assert!(document.is_no_document());
        assert_eq!(document.version(), version(9));
        assert_eq!(event.resolved_limbo_documents, keys(&["rooms/a"]));
    }

    #[test]
    fn documents_in_listen_targets_are_not_resolved_limbo() {
        let targets = Targets::new()
            .listen(1, query("rooms/a"), TargetPurpose::LimboResolution)
            .listen(2, query("rooms"), TargetPurpose::Listen);
        let mut aggregator = WatchChangeAggregator::new();
        let document = doc("rooms/a", 1, MapValue::empty());
        apply(
            &mut aggregator,
            &targets,
            WatchChange::DocumentChange(DocumentChange {
                updated_target_ids: vec![1, 2],
                removed_target_ids: Vec::new(),
                key: document.key().clone(),
                document: Some(document),
            }),
        );
        let event = aggregator.create_remote_event(&targets, version(2));
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn document_target_count_zero_deletes_document() {
        let targets = Targets::new()
            .listen(2, query("rooms/a"), TargetPurpose::Listen)
            .synced(2, &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new();
        apply(&mut aggregator, &targets, filter(2, 0, None));
        let event = aggregator.create_remote_event(&targets, version(3));
        assert_eq!(event.target_changes[&2].removed_documents, keys(&["rooms/a"]));
        assert!(event.target_mismatches.is_empty());
    }

    #[test]
    fn document_target_with_impossible_count_is_reset() {
        let targets = Targets::new()
            .listen(2, query("rooms/a"), TargetPurpose::Listen)
            .synced(2, &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new();
        apply(&mut aggregator, &targets, filter(2, 1, None));
        assert!(aggregator.create_remote_event(&targets, version(3)).target_mismatches.is_empty());

        apply(&mut aggregator, &targets, filter(2, 3, None));
        let event = aggregator.create_remote_event(&targets, version(4));
        assert_eq!(event.target_mismatches[&2], TargetPurpose::ExistenceFilterMismatch);
        assert_eq!(event.target_changes[&2].removed_documents, keys(&["rooms/a"]));
    }

    #[test]
    fn mismatch_without_bloom_filter_resets_target() {
        let targets = Targets::new()
            .listen(2, query("rooms"), TargetPurpose::Listen)
            .synced(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new();
        apply(&mut aggregator, &targets, filter(2, 1, None));

        let event = aggregator.create_remote_event(&targets, version(3));
        assert_eq!(event.target_mismatches[&2], TargetPurpose::ExistenceFilterMismatch);
        assert_eq!(event.target_changes[&2].removed_documents, keys(&["rooms/a", "rooms/b"]));
    }

    #[test]
    fn bloom_filter_removes_only_missing_documents() {
        let targets = Targets::new()
            .listen(2, query("rooms"), TargetPurpose::Listen)
            .synced(2, &["rooms/a", "rooms/b", "rooms/c"]);
        let present = names(&targets, &["rooms/a", "rooms/c"]);
        let payload = BloomFilterPayload {
            bitmap: bitmap_for(present.iter().map(String::as_str), 128, 5),
            padding: 0,
            hash_count: 5,
        };
        let mut aggregator = WatchChangeAggregator::new();
        apply(&mut aggregator, &targets, filter(2, 2, Some(payload)));

        let event = aggregator.create_remote_event(&targets, version(3));
        assert!(event.target_mismatches.is_empty());
        assert_eq!(event.target_changes[&2].removed_documents, keys(&["rooms/b"]));
    }

    #[test]
    fn bloom_filter_false_positive_resets_target() {
        let targets = Targets::new()
            .listen(2, query("rooms"), TargetPurpose::Listen)
            .synced(2, &["rooms/a", "rooms/b", "rooms/c"]);
        // Every local document is in the filter, yet the backend has one less.
        let present = names(&targets, &["rooms/a", "rooms/b", "rooms/c"]);
        let payload = BloomFilterPayload {
            bitmap: bitmap_for(present.iter().map(String::as_str), 128, 5),
            padding: 0,
            hash_count: 5,
        };
        let mut aggregator = WatchChangeAggregator::new();
        apply(&mut aggregator, &targets, filter(2, 2, Some(payload)));

        let event = aggregator.create_remote_event(&targets, version(3));
        assert_eq!(event.target_mismatches[&2], TargetPurpose::ExistenceFilterMismatchBloom);
    }

    #[test]
    fn malformed_bloom_filter_is_treated_as_absent() {
        let targets = Targets::new()
            .listen(2, query("rooms"), TargetPurpose::Listen)
            .synced(2, &["rooms/a", "rooms/b"]);
        let payload = BloomFilterPayload {
            bitmap: vec![0xff],
            padding: 9,
            hash_count: 1,
        };
        let mut aggregator = WatchChangeAggregator::new();
        apply(&mut aggregator, &targets, filter(2, 1, Some(payload)));

        let event = aggregator.create_remote_event(&targets, version(3));
        assert_eq!(event.target_mismatches[&2], TargetPurpose::ExistenceFilterMismatch);
    }

    #[test]
    fn reset_drops_previous_changes() {
        let targets = Targets::new()
            .listen(2, query("rooms"), TargetPurpose::Listen)
            .synced(2, &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new();
        apply(&mut aggregator, &targets, added(2, doc("rooms/b", 1, MapValue::empty())));
        apply(
            &mut aggregator,
            &targets,
            WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::Reset, vec![2])),
        );
        let event = aggregator.create_remote_event(&targets, version(2));
        let change = &event.target_changes[&2];
        assert!(change.added_documents.is_empty());
        assert_eq!(change.removed_documents, keys(&["rooms/a"]));
    }
}
