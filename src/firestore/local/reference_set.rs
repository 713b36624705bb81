use std::collections::BTreeSet;

use crate::firestore::model::DocumentKey;

/// Bidirectional index between document keys and the ids that reference
/// them (target ids, or batch ids for local views).
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, i32)>,
    by_id: BTreeSet<(i32, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_id.insert((id, key.clone()));
        self.by_key.insert((key, id));
    }

    pub fn add_references(&mut self, keys: impl IntoIterator<Item = DocumentKey>, id: i32) {
        for key in keys {
            self.add_reference(key, id);
        }
    }

    /// Returns whether the reference existed.
    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) -> bool {
        self.by_id.remove(&(id, key.clone()));
        self.by_key.remove(&(key.clone(), id))
    }

    pub fn remove_references<'a>(&mut self, keys: impl IntoIterator<Item = &'a DocumentKey>, id: i32) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held by `id` and returns the keys it referenced.
    pub fn remove_references_for_id(&mut self, id: i32) -> BTreeSet<DocumentKey> {
        let keys = self.references_for_id(id);
        for key in &keys {
            self.remove_reference(key, id);
        }
        keys
    }

    pub fn remove_all_references(&mut self) -> BTreeSet<DocumentKey> {
        let keys = self.by_key.iter().map(|(key, _)| key.clone()).collect();
        self.by_key.clear();
        self.by_id.clear();
        keys
    }

    pub fn references_for_id(&self, id: i32) -> BTreeSet<DocumentKey> {
        self.by_id
            .iter()
            .skip_while(|(entry_id, _)| *entry_id < id)
            .take_while(|(entry_id, _)| *entry_id == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), i32::MIN)..)
            .next()
            .is_some_and(|(entry_key, _)| entry_key == key)
    }

    pub fn contains(&self, key: &DocumentKey, id: i32) -> bool {
        self.by_key.contains(&(key.clone(), id))
    }
}
