use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{DocumentKey, Mutation, Overlay, ResourcePath};

/// Per-user store of the single mutation that summarizes every pending
/// batch touching a document.
pub trait DocumentOverlayCache: Send {
    fn get_overlay(&self, key: &DocumentKey) -> FirestoreResult<Option<Overlay>>;

    fn get_overlays(&self, keys: &BTreeSet<DocumentKey>) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>>;

    /// Stores `overlays`, all computed up to `largest_batch_id`.
    fn save_overlays(&mut self, largest_batch_id: i32, overlays: &BTreeMap<DocumentKey, Mutation>) -> FirestoreResult<()>;

    fn remove_overlays_for_batch_id(&mut self, batch_id: i32) -> FirestoreResult<()>;

    /// Overlays for documents directly inside `collection` whose batch id is
    /// greater than `since_batch_id`.
    fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: i32,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>>;

    /// Overlays for the collection group after `since_batch_id`, returning
    /// whole batches until at least `count` overlays are collected.
    fn get_overlays_for_collection_group(
        &self,
        collection_group: &str,
        since_batch_id: i32,
        count: usize,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>>;
}

#[derive(Debug, Default)]
pub struct MemoryDocumentOverlayCache {
    overlays: BTreeMap<DocumentKey, Overlay>,
    overlay_by_batch_id: BTreeMap<i32, BTreeSet<DocumentKey>>,
}

impl MemoryDocumentOverlayCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn save_overlay(&mut self, largest_batch_id: i32, mutation: Mutation) {
        let key = mutation.key().clone();
        if let Some(existing) = self.overlays.get(&key) {
            let existing_batch_id = existing.largest_batch_id();
            if let Some(keys) = self.overlay_by_batch_id.get_mut(&existing_batch_id) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.overlay_by_batch_id.remove(&existing_batch_id);
                }
            }
        }

        self.overlays
            .insert(key.clone(), Overlay::new(largest_batch_id, mutation));
        self.overlay_by_batch_id
            .entry(largest_batch_id)
            .or_default()
            .insert(key);
    }
}

impl DocumentOverlayCache for MemoryDocumentOverlayCache {
    fn get_overlay(&self, key: &DocumentKey) -> FirestoreResult<Option<Overlay>> {
        Ok(self.overlays.get(key).cloned())
    }

    fn get_overlays(&self, keys: &BTreeSet<DocumentKey>) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>> {
        Ok(keys
            .iter()
            .filter_map(|key| self.overlays.get(key).map(|overlay| (key.clone(), overlay.clone())))
            .collect())
    }

    fn save_overlays(&mut self, largest_batch_id: i32, overlays: &BTreeMap<DocumentKey, Mutation>) -> FirestoreResult<()> {
        for mutation in overlays.values() {
            self.save_overlay(largest_batch_id, mutation.clone());
        }
        Ok(())
    }

    fn remove_overlays_for_batch_id(&mut self, batch_id: i32) -> FirestoreResult<()> {
        if let Some(keys) = self.overlay_by_batch_id.remove(&batch_id) {
            for key in keys {
                self.overlays.remove(&key);
            }
        }
        Ok(())
    }

    fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: i32,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>> {
        Ok(self
            .overlays
            .iter()
            .filter(|(key, overlay)| {
                collection.is_immediate_parent_of(key.path()) && overlay.largest_batch_id() > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect())
    }

    fn get_overlays_for_collection_group(
        &self,
        collection_group: &str,
        since_batch_id: i32,
        count: usize,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>> {
        let mut by_batch_id: BTreeMap<i32, BTreeMap<DocumentKey, Overlay>> = BTreeMap::new();
        for (key, overlay) in &self.overlays {
            if key.has_collection_id(collection_group) && overlay.largest_batch_id() > since_batch_id {
                by_batch_id
                    .entry(overlay.largest_batch_id())
                    .or_default()
                    .insert(key.clone(), overlay.clone());
            }
        }

        let mut result = BTreeMap::new();
        for overlays in by_batch_id.into_values() {
            result.extend(overlays);
            if result.len() >= count {
                break;
            }
        }
        Ok(result)
    }
}
