use std::collections::BTreeSet;

use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::model::DocumentKey;
use crate::util::assert::hard_assert;

/// Tracks which cached documents are still needed so unreferenced ones can
/// be garbage collected.
pub trait ReferenceDelegate: Send {
    fn add_reference(&mut self, target_id: i32, key: &DocumentKey);

    fn remove_reference(&mut self, target_id: i32, key: &DocumentKey);

    fn mark_potentially_orphaned(&mut self, key: &DocumentKey);

    /// Called when a target is released with the keys it matched.
    fn remove_target(&mut self, target_id: i32, matching_keys: &BTreeSet<DocumentKey>);

    /// A limbo resolution finished for `key`.
    fn update_limbo_document(&mut self, key: &DocumentKey);

    /// Pins `key` because a live view displays it.
    fn add_local_view_reference(&mut self, key: &DocumentKey, target_id: i32);

    fn remove_local_view_reference(&mut self, key: &DocumentKey, target_id: i32);

    fn remove_local_view_references_for_target(&mut self, target_id: i32) -> BTreeSet<DocumentKey>;

    fn is_pinned_by_local_view(&self, key: &DocumentKey) -> bool;

    fn on_transaction_started(&mut self);

    /// Keys that lost a reference during the transaction.
    fn take_orphaned_documents(&mut self) -> BTreeSet<DocumentKey>;
}

/// Removes documents as soon as nothing references them.
#[derive(Debug, Default)]
pub struct MemoryEagerDelegate {
    local_view_references: ReferenceSet,
    orphaned_documents: Option<BTreeSet<DocumentKey>>,
}

impl MemoryEagerDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    fn orphaned(&mut self) -> &mut BTreeSet<DocumentKey> {
        self.orphaned_documents.get_or_insert_with(BTreeSet::new)
    }
}

impl ReferenceDelegate for MemoryEagerDelegate {
    fn add_reference(&mut self, _target_id: i32, key: &DocumentKey) {
        self.orphaned().remove(key);
    }

    fn remove_reference(&mut self, _target_id: i32, key: &DocumentKey) {
        self.orphaned().insert(key.clone());
    }

    fn mark_potentially_orphaned(&mut self, key: &DocumentKey) {
        self.orphaned().insert(key.clone());
    }

    fn remove_target(&mut self, _target_id: i32, matching_keys: &BTreeSet<DocumentKey>) {
        self.orphaned().extend(matching_keys.iter().cloned());
    }

    fn update_limbo_document(&mut self, key: &DocumentKey) {
        self.orphaned().insert(key.clone());
    }

    fn add_local_view_reference(&mut self, key: &DocumentKey, target_id: i32) {
        self.local_view_references.add_reference(key.clone(), target_id);
        self.add_reference(target_id, key);
    }

    fn remove_local_view_reference(&mut self, key: &DocumentKey, target_id: i32) {
        let existed = self.local_view_references.remove_reference(key, target_id);
        hard_assert(
            existed,
            format!("Local view reference underflow for {key} in target {target_id}"),
        );
        self.remove_reference(target_id, key);
    }

    fn remove_local_view_references_for_target(&mut self, target_id: i32) -> BTreeSet<DocumentKey> {
        let removed = self.local_view_references.remove_references_for_id(target_id);
        for key in &removed {
            self.remove_reference(target_id, key);
        }
        removed
    }

    fn is_pinned_by_local_view(&self, key: &DocumentKey) -> bool {
        self.local_view_references.contains_key(key)
    }

    fn on_transaction_started(&mut self) {
        self.orphaned_documents = Some(BTreeSet::new());
    }

    fn take_orphaned_documents(&mut self) -> BTreeSet<DocumentKey> {
        self.orphaned_documents.take().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn re_referenced_keys_are_not_orphaned() {
        let mut delegate = MemoryEagerDelegate::new();
        delegate.on_transaction_started();
        delegate.remove_reference(2, &key("rooms/a"));
        delegate.mark_potentially_orphaned(&key("rooms/b"));
        delegate.add_reference(4, &key("rooms/a"));
        assert_eq!(delegate.take_orphaned_documents(), BTreeSet::from([key("rooms/b")]));
    }

    #[test]
    fn local_view_references_pin_documents() {
        let mut delegate = MemoryEagerDelegate::new();
        delegate.on_transaction_started();
        delegate.add_local_view_reference(&key("rooms/a"), 2);
        assert!(delegate.is_pinned_by_local_view(&key("rooms/a")));

        let removed = delegate.remove_local_view_references_for_target(2);
        assert_eq!(removed.len(), 1);
        assert!(!delegate.is_pinned_by_local_view(&key("rooms/a")));
        assert!(delegate.take_orphaned_documents().contains(&key("rooms/a")));
    }

    #[test]
    #[should_panic(expected = "INTERNAL ASSERT FAILED")]
    fn removing_unknown_local_view_reference_is_fatal() {
        let mut delegate = MemoryEagerDelegate::new();
        delegate.remove_local_view_reference(&key("rooms/a"), 2);
    }
}
