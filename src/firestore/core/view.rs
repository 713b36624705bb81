use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::document_set::DocumentSet;
use crate::firestore::core::query::{DocumentComparator, LimitType, Query};
use crate::firestore::core::types::OnlineState;
use crate::firestore::core::view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot};
use crate::firestore::model::{Document, DocumentKey};
use crate::firestore::remote::TargetChange;
use crate::firestore::value::{values_equal, FirestoreValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimboChangeType {
    Added,
    Removed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimboDocumentChange {
    pub change_type: LimboChangeType,
    pub key: DocumentKey,
}

/// Intermediate result of [`View::compute_doc_changes`], applied with
/// [`View::apply_changes`].
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// The limit boundary moved so documents outside the previous result may
    /// now belong in it; the caller must recompute from a full query.
    pub needs_refill: bool,
    pub mutated_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncState {
    Local,
    Synced,
}

/// The materialized result of one query, kept in sync with local writes and
/// remote changes.
#[derive(Debug)]
pub struct View {
    query: Query,
    comparator: DocumentComparator,
    sync_state: Option<SyncState>,
    /// Whether the backend has told us the target is up to date.
    current: bool,
    document_set: DocumentSet,
    /// Keys the backend has confirmed belong to this view's target.
    synced_documents: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
    has_cached_results: bool,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let comparator = query.comparator();
        Self {
            document_set: DocumentSet::new(comparator.clone()),
            query,
            comparator,
            sync_state: None,
            current: false,
            synced_documents,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
            has_cached_results: false,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    /// Snapshot reporting the current contents as added, for a listener that
    /// joins a query other listeners already hold.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state != Some(SyncState::Synced),
            false,
            self.has_cached_results,
        )
    }

    /// Folds `doc_changes` into the view without committing them.
    ///
    /// Pass the result of a previous call as `previous` to continue from it,
    /// which is how a refill after a limit change is layered on.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &BTreeMap<DocumentKey, Document>,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, mut document_set, mut mutated_keys) = match previous {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut needs_refill = false;

        let limit = self.query.limit().map(|limit| limit as usize);
        let at_limit = limit.is_some_and(|limit| document_set.len() == limit);
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in doc_changes {
            let old_doc = document_set.get(key).cloned();
            let new_doc = self.query.matches(entry).then(|| entry.clone());

            let old_had_pending = old_doc.is_some() && self.mutated_keys.contains(key);
            // An acknowledged write is no longer pending, even before the
            // watch stream confirms its contents.
            let new_has_pending = new_doc.as_ref().is_some_and(Document::has_local_mutations);

            let mut change_applied = false;
            match (&old_doc, &new_doc) {
                (Some(old), Some(new)) => {
                    let same_data = values_equal(
                        &FirestoreValue::from(old.data()),
                        &FirestoreValue::from(new.data()),
                    );
                    if !same_data {
                        if !should_wait_for_synced_document(old, new) {
                            change_set.track(DocumentViewChange {
                                change_type: ChangeType::Modified,
                                document: new.clone(),
                            });
                            change_applied = true;

                            let past_last = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|last| self.comparator.compare(new, last) == Ordering::Greater);
                            let before_first = first_doc_in_limit
                                .as_ref()
                                .is_some_and(|first| self.comparator.compare(new, first) == Ordering::Less);
                            if past_last || before_first {
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange {
                            change_type: ChangeType::Metadata,
                            document: new.clone(),
                        });
                        change_applied = true;
                    }
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Added,
                        document: new.clone(),
                    });
                    change_applied = true;
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        document: old.clone(),
                    });
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new) => {
                        document_set.add(new);
                        if new_has_pending {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.delete(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while document_set.len() > limit {
                let dropped = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(dropped) = dropped else {
                    break;
                };
                document_set.delete(dropped.key());
                mutated_keys.remove(dropped.key());
                change_set.track(DocumentViewChange {
                    change_type: ChangeType::Removed,
                    document: dropped,
                });
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            needs_refill,
            mutated_keys,
        }
    }

    /// Commits computed changes and returns the snapshot to raise, if any.
    ///
    /// `target_change` carries the backend's view of the target; limbo
    /// tracking is skipped while the target is pending a reset.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set.clone());
        self.mutated_keys = doc_changes.mutated_keys.clone();

        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|left, right| {
            left.change_type
                .sort_order()
                .cmp(&right.change_type.sort_order())
                .then_with(|| self.comparator.compare(&left.document, &right.document))
        });

        self.apply_target_change(target_change);
        if let Some(change) = target_change {
            self.has_cached_results = !change.resume_token.is_empty();
        }
        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            docs: doc_changes.document_set,
            old_docs,
            doc_changes: changes,
            mutated_keys: doc_changes.mutated_keys,
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: self.has_cached_results,
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Going offline marks the view as no longer current so listeners see
    /// `from_cache` results.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            return self.apply_changes(unchanged, false, None, false);
        }
        ViewChange::default()
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        self.synced_documents.extend(change.added_documents.iter().cloned());
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.document_set.get(key) {
            // Local writes are expected to be missing from the server until acknowledged.
            Some(document) => !document.has_local_mutations(),
            None => false,
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }

        let old_limbo = std::mem::take(&mut self.limbo_documents);
        let new_limbo: BTreeSet<DocumentKey> = self
            .document_set
            .keys()
            .filter(|key| self.should_be_in_limbo(key))
            .cloned()
            .collect();

        let mut changes = Vec::new();
        for key in old_limbo.difference(&new_limbo) {
            changes.push(LimboDocumentChange {
                change_type: LimboChangeType::Removed,
                key: key.clone(),
            });
        }
        for key in new_limbo.difference(&old_limbo) {
            changes.push(LimboDocumentChange {
                change_type: LimboChangeType::Added,
                key: key.clone(),
            });
        }
        self.limbo_documents = new_limbo;
        changes
    }
}

/// A document acknowledged by the backend replaces its latency-compensated
/// version only once the watch stream delivers the committed contents.
fn should_wait_for_synced_document(old: &Document, new: &Document) -> bool {
    old.has_local_mutations() && new.has_committed_mutations() && !new.has_local_mutations()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::OrderBy;
    use crate::firestore::model::{FieldPath, ResourcePath, SnapshotVersion, Timestamp};
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, rank: i64) -> Document {
        let mut data = MapValue::empty();
        data.set(
            &FieldPath::from_dot_separated("rank").unwrap(),
            FirestoreValue::from_integer(rank),
        );
        Document::new_found(key(path), SnapshotVersion::new(Timestamp::new(1, 0)), data)
    }

    fn updates(docs: &[Document]) -> BTreeMap<DocumentKey, Document> {
        docs.iter().map(|doc| (doc.key().clone(), doc.clone())).collect()
    }

    fn rooms() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    fn current_change(added: &[&str]) -> TargetChange {
        TargetChange {
            resume_token: b"token".to_vec(),
            current: true,
            added_documents: added.iter().map(|path| key(path)).collect(),
            ..TargetChange::default()
        }
    }

    fn apply(view: &mut View, docs: &[Document], change: Option<&TargetChange>) -> ViewChange {
        let changes = view.compute_doc_changes(&updates(docs), None);
        view.apply_changes(changes, true, change, false)
    }

    #[test]
    fn initial_changes_are_added_and_from_cache() {
        let mut view = View::new(rooms(), BTreeSet::new());
        let change = apply(&mut view, &[doc("rooms/a", 1), doc("rooms/b", 2)], None);
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert_eq!(snapshot.doc_changes.len(), 2);
        assert!(snapshot
            .doc_changes
            .iter()
            .all(|c| c.change_type == ChangeType::Added));
    }

    #[test]
    fn diff_applied_to_old_documents_reproduces_new_documents() {
        let mut view = View::new(rooms(), BTreeSet::new());
        apply(&mut view, &[doc("rooms/a", 1), doc("rooms/b", 2), doc("rooms/c", 3)], None);

        let mut removed = Document::new_no_document(key("rooms/b"), SnapshotVersion::new(Timestamp::new(2, 0)));
        removed.set_read_time(SnapshotVersion::new(Timestamp::new(2, 0)));
        let snapshot = apply(&mut view, &[doc("rooms/a", 9), removed, doc("rooms/d", 4)], None)
            .snapshot
            .unwrap();

        let mut replayed = snapshot.old_docs.clone();
        for change in &snapshot.doc_changes {
            match change.change_type {
                ChangeType::Removed => {
                    replayed.delete(change.document.key());
                }
                _ => replayed.add(change.document.clone()),
            }
        }
        assert_eq!(replayed, snapshot.docs);
        let order: Vec<ChangeType> = snapshot.doc_changes.iter().map(|c| c.change_type).collect();
        assert_eq!(order, vec![ChangeType::Removed, ChangeType::Added, ChangeType::Modified]);
    }

    #[test]
    fn diff_replay_holds_for_random_document_sets() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let rank = || OrderBy::ascending(FieldPath::from_dot_separated("rank").unwrap());
        let queries = [
            rooms(),
            rooms().with_order_by(rank()).with_limit_to_first(4),
            rooms().with_order_by(rank()).with_limit_to_last(4),
        ];
        let pool: Vec<String> = (0..12).map(|i| format!("rooms/r{i:02}")).collect();
        let deleted_at = SnapshotVersion::new(Timestamp::new(2, 0));
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for query in &queries {
            for _ in 0..200 {
                let mut view = View::new(query.clone(), BTreeSet::new());
                let old_size = rng.gen_range(0..=pool.len());
                let old: Vec<Document> = pool[..old_size]
                    .iter()
                    .map(|path| doc(path, rng.gen_range(0..6)))
                    .collect();
                apply(&mut view, &old, None);

                let next: Vec<Document> = pool
                    .iter()
                    .map(|path| {
                        if rng.gen_bool(0.6) {
                            doc(path, rng.gen_range(0..6))
                        } else {
                            Document::new_no_document(key(path), deleted_at)
                        }
                    })
                    .collect();
                let Some(snapshot) = apply(&mut view, &next, None).snapshot else {
                    continue;
                };

                let mut replayed = snapshot.old_docs.clone();
                for change in &snapshot.doc_changes {
                    match change.change_type {
                        ChangeType::Removed => {
                            replayed.delete(change.document.key());
                        }
                        _ => replayed.add(change.document.clone()),
                    }
                }
                assert_eq!(replayed, snapshot.docs);
                if let Some(limit) = query.limit() {
                    assert!(snapshot.docs.len() <= limit as usize);
                }
            }
        }
    }

    #[test]
    fn unchanged_documents_raise_no_snapshot() {
        let mut view = View::new(rooms(), BTreeSet::new());
        apply(&mut view, &[doc("rooms/a", 1)], None);
        assert!(apply(&mut view, &[doc("rooms/a", 1)], None).snapshot.is_none());
    }

    #[test]
    fn limit_drops_documents_past_boundary() {
        let query = rooms()
            .with_order_by(OrderBy::ascending(FieldPath::from_dot_separated("rank").unwrap()))
            .with_limit_to_first(2);
        let mut view = View::new(query, BTreeSet::new());
        let snapshot = apply(
            &mut view,
            &[doc("rooms/a", 1), doc("rooms/b", 2), doc("rooms/c", 3)],
            None,
        )
        .snapshot
        .unwrap();
        let keys: Vec<&str> = snapshot.docs.keys().map(|k| k.id()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn removing_a_document_at_the_limit_needs_refill() {
        let query = rooms()
            .with_order_by(OrderBy::ascending(FieldPath::from_dot_separated("rank").unwrap()))
            .with_limit_to_first(2);
        let mut view = View::new(query, BTreeSet::new());
        apply(&mut view, &[doc("rooms/a", 1), doc("rooms/b", 2)], None);

        let deleted = Document::new_no_document(key("rooms/a"), SnapshotVersion::new(Timestamp::new(2, 0)));
        let changes = view.compute_doc_changes(&updates(&[deleted]), None);
        assert!(changes.needs_refill);

        let moved = view.compute_doc_changes(&updates(&[doc("rooms/a", 7)]), None);
        assert!(moved.needs_refill);
    }

    #[test]
    fn documents_not_synced_by_target_enter_limbo() {
        let mut view = View::new(rooms(), BTreeSet::new());
        let change = apply(
            &mut view,
            &[doc("rooms/a", 1), doc("rooms/b", 2)],
            Some(&current_change(&["rooms/a"])),
        );
        assert_eq!(
            change.limbo_changes,
            vec![LimboDocumentChange {
                change_type: LimboChangeType::Added,
                key: key("rooms/b"),
            }]
        );
        assert!(change.snapshot.unwrap().from_cache);

        let resolved = TargetChange {
            current: true,
            added_documents: BTreeSet::from([key("rooms/b")]),
            ..TargetChange::default()
        };
        let change = apply(&mut view, &[], Some(&resolved));
        assert_eq!(change.limbo_changes[0].change_type, LimboChangeType::Removed);
        let snapshot = change.snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert!(snapshot.doc_changes.is_empty());
    }

    #[test]
    fn locally_mutated_documents_are_not_in_limbo() {
        let mut view = View::new(rooms(), BTreeSet::new());
        let mut local = doc("rooms/a", 1);
        local.set_has_local_mutations();
        let change = apply(&mut view, &[local], Some(&current_change(&[])));
        assert!(change.limbo_changes.is_empty());
        assert!(change.snapshot.unwrap().has_pending_writes());
    }

    #[test]
    fn going_offline_marks_view_from_cache() {
        let mut view = View::new(rooms(), BTreeSet::new());
        apply(&mut view, &[doc("rooms/a", 1)], Some(&current_change(&["rooms/a"])));
        let change = view.apply_online_state_change(OnlineState::Offline);
        let snapshot = change.snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert!(view.apply_online_state_change(OnlineState::Offline).snapshot.is_none());
    }

    #[test]
    fn acknowledged_write_with_same_contents_clears_pending_flag() {
        let mut view = View::new(rooms(), BTreeSet::new());
        let mut local = doc("rooms/a", 1);
        local.set_has_local_mutations();
        assert!(apply(&mut view, &[local], None).snapshot.unwrap().has_pending_writes());

        let mut committed = doc("rooms/a", 1);
        committed.set_has_committed_mutations();
        let snapshot = apply(&mut view, &[committed], None).snapshot.unwrap();
        assert_eq!(snapshot.doc_changes.len(), 1);
        assert_eq!(snapshot.doc_changes[0].change_type, ChangeType::Metadata);
        assert!(!snapshot.has_pending_writes());

        assert!(apply(&mut view, &[doc("rooms/a", 1)], None).snapshot.is_none());
    }

    #[test]
    fn acknowledged_writes_wait_for_watch_contents() {
        let mut view = View::new(rooms(), BTreeSet::new());
        let mut local = doc("rooms/a", 1);
        local.set_has_local_mutations();
        apply(&mut view, &[local], None);

        let mut committed = doc("rooms/a", 5);
        committed.set_has_committed_mutations();
        let changes = view.compute_doc_changes(&updates(&[committed]), None);
        assert!(changes.change_set.is_empty());
    }
}
