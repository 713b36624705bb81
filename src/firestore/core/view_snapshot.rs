use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::document_set::DocumentSet;
use crate::firestore::core::query::Query;
use crate::firestore::model::{Document, DocumentKey};
use crate::util::assert::fail;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only the pending-write state of the document changed.
    Metadata,
}

impl ChangeType {
    /// Removals sort first, then additions, then modifications.
    pub(crate) fn sort_order(&self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: Document,
}

/// Accumulates view changes per key, folding successive changes to the same
/// document into the single change a listener should observe.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange {
                change_type: old_type,
                document: change.document,
            }),
            (Modified, Modified) => Some(change),
            (Added, Modified) => Some(DocumentViewChange {
                change_type: Added,
                document: change.document,
            }),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange {
                change_type: Removed,
                document: old.document.clone(),
            }),
            (Removed, Added) => Some(DocumentViewChange {
                change_type: Modified,
                document: change.document,
            }),
            (old_type, new_type) => fail(format!(
                "Unsupported combination of changes: {new_type:?} after {old_type:?}"
            )),
        };
        match merged {
            Some(change) => {
                self.changes.insert(key, change);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    /// Changes in key order.
    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Immutable result of one view computation, delivered to listeners.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// A snapshot that reports every document in `docs` as added.
    pub fn from_initial_documents(
        query: Query,
        docs: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        excludes_metadata_changes: bool,
        has_cached_results: bool,
    ) -> Self {
        let doc_changes = docs
            .iter()
            .map(|document| DocumentViewChange {
                change_type: ChangeType::Added,
                document: document.clone(),
            })
            .collect();
        let old_docs = DocumentSet::new(docs.comparator().clone());
        Self {
            query,
            docs,
            old_docs,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    /// Whether `key` is in the result with writes not yet acknowledged.
    pub fn has_pending_write(&self, key: &DocumentKey) -> bool {
        self.mutated_keys.contains(key)
    }
}

impl PartialEq for ViewSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.from_cache == other.from_cache
            && self.has_cached_results == other.has_cached_results
            && self.sync_state_changed == other.sync_state_changed
            && self.mutated_keys == other.mutated_keys
            && self.query == other.query
            && self.docs == other.docs
            && self.old_docs == other.old_docs
            && self.doc_changes == other.doc_changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::MapValue;

    fn doc(key: &str) -> Document {
        Document::new_found(DocumentKey::from_string(key).unwrap(), SnapshotVersion::min(), MapValue::empty())
    }

    fn change(change_type: ChangeType, key: &str) -> DocumentViewChange {
        DocumentViewChange {
            change_type,
            document: doc(key),
        }
    }

    #[test]
    fn added_then_removed_cancels_out() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, "rooms/a"));
        set.track(change(ChangeType::Removed, "rooms/a"));
        assert!(set.is_empty());
    }

    #[test]
    fn removed_then_added_becomes_modified() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Removed, "rooms/a"));
        set.track(change(ChangeType::Added, "rooms/a"));
        assert_eq!(set.changes()[0].change_type, ChangeType::Modified);
    }

    #[test]
    fn metadata_keeps_stronger_change() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, "rooms/a"));
        set.track(change(ChangeType::Metadata, "rooms/a"));
        assert_eq!(set.changes()[0].change_type, ChangeType::Added);

        set.track(change(ChangeType::Metadata, "rooms/b"));
        set.track(change(ChangeType::Modified, "rooms/b"));
        assert_eq!(set.changes()[1].change_type, ChangeType::Modified);
    }

    #[test]
    fn changes_are_in_key_order() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, "rooms/c"));
        set.track(change(ChangeType::Added, "rooms/a"));
        let keys: Vec<String> = set.changes().iter().map(|c| c.document.key().id().to_string()).collect();
        assert_eq!(keys, vec!["a", "c"]);
    }

    #[test]
    #[should_panic(expected = "INTERNAL ASSERT FAILED")]
    fn added_twice_is_fatal() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, "rooms/a"));
        set.track(change(ChangeType::Added, "rooms/a"));
    }
}
