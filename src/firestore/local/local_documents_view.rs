use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{
    calculate_overlay_mutation, Document, DocumentKey, FieldMask, IndexOffset, Overlay, OverlayedDocument,
    ResourcePath, Timestamp,
};

/// Reads documents as the user sees them: the remote document cache with
/// the pending-write overlay applied on top.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalDocumentsView;

impl LocalDocumentsView {
    pub fn new() -> Self {
        Self
    }

    pub fn get_document(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<Document> {
        let overlay = txn.document_overlays.get_overlay(key)?;
        let mut document = Self::base_document(txn, key, overlay.as_ref())?;
        if let Some(overlay) = overlay {
            overlay
                .mutation()
                .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        }
        Ok(document)
    }

    /// Local views of `keys`. Unknown keys map to invalid documents.
    pub fn get_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let documents = txn.remote_documents.get_entries(keys)?;
        self.get_local_view_of_documents(txn, documents, &BTreeSet::new())
    }

    /// Applies overlays to already loaded remote documents.
    ///
    /// Documents in `existence_state_changed` flipped between existing and
    /// missing in the remote cache; their patch overlays are recomputed since
    /// a patch only applies to an existing document.
    pub fn get_local_view_of_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: BTreeMap<DocumentKey, Document>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let keys: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
        let overlays = txn.document_overlays.get_overlays(&keys)?;
        let views = self.compute_views(txn, documents, overlays, existence_state_changed)?;
        Ok(views
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect())
    }

    /// Like [`Self::get_local_view_of_documents`], also reporting which
    /// fields the overlays changed.
    pub fn get_overlayed_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: BTreeMap<DocumentKey, Document>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let keys: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
        let overlays = txn.document_overlays.get_overlays(&keys)?;
        self.compute_views(txn, documents, overlays, &BTreeSet::new())
    }

    fn compute_views(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        mut documents: BTreeMap<DocumentKey, Document>,
        overlays: BTreeMap<DocumentKey, Overlay>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let mut recalculate = BTreeMap::new();
        let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        for (key, document) in documents.iter_mut() {
            let overlay = overlays.get(key);
            let overlay_is_patch = overlay.map_or(true, |overlay| overlay.mutation().is_patch());
            if existence_state_changed.contains(key) && overlay_is_patch {
                recalculate.insert(key.clone(), document.clone());
            } else if let Some(overlay) = overlay {
                let mask = overlay.mutation().field_mask();
                overlay
                    .mutation()
                    .apply_to_local_view(document, mask.clone(), Timestamp::now());
                mutated_fields.insert(key.clone(), mask);
            } else {
                mutated_fields.insert(key.clone(), Some(FieldMask::empty()));
            }
        }

        let recalculated_masks = self.recalculate_and_save_overlays(txn, &mut recalculate)?;
        mutated_fields.extend(recalculated_masks);
        documents.extend(recalculate);

        Ok(documents
            .into_iter()
            .map(|(key, document)| {
                let mutated_fields = mutated_fields.get(&key).cloned().flatten();
                (
                    key,
                    OverlayedDocument {
                        document,
                        mutated_fields,
                    },
                )
            })
            .collect())
    }

    /// Replays every pending batch over `documents` and stores the resulting
    /// overlays. Returns the mask of changed fields per key, `None` when the
    /// whole document was replaced.
    pub fn recalculate_and_save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: &mut BTreeMap<DocumentKey, Document>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
        let keys: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
        let batches = txn
            .mutation_queue
            .all_mutation_batches_affecting_document_keys(&keys)?;

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut documents_by_batch_id: BTreeMap<i32, BTreeSet<DocumentKey>> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(base) = documents.get_mut(&key) else {
                    continue;
                };
                let mask = masks
                    .get(&key)
                    .cloned()
                    .unwrap_or(Some(FieldMask::empty()));
                let mask = batch.apply_to_local_view(base, mask);
                masks.insert(key.clone(), mask);
                documents_by_batch_id
                    .entry(batch.batch_id)
                    .or_default()
                    .insert(key);
            }
        }

        // Newest batches first, so each key is saved under its largest batch id.
        let mut processed = BTreeSet::new();
        for (batch_id, keys) in documents_by_batch_id.iter().rev() {
            let mut overlays = BTreeMap::new();
            for key in keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let Some(document) = documents.get(key) else {
                    continue;
                };
                let mask = masks.get(key).cloned().flatten();
                if let Some(mutation) = calculate_overlay_mutation(document, mask.as_ref()) {
                    overlays.insert(key.clone(), mutation);
                }
            }
            txn.document_overlays.save_overlays(*batch_id, &overlays)?;
        }
        Ok(masks)
    }

    /// Recomputes and stores the overlays of `keys` from the mutation queue.
    pub fn recalculate_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        let mut documents = txn.remote_documents.get_entries(keys)?;
        self.recalculate_and_save_overlays(txn, &mut documents)?;
        Ok(())
    }

    /// Every document matching `query` that changed after `offset`, with
    /// local writes applied.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        offset: &IndexOffset,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        if query.is_document_query() {
            self.get_documents_matching_document_query(txn, query.path())
        } else if query.is_collection_group_query() {
            self.get_documents_matching_collection_group_query(txn, query, offset)
        } else {
            self.get_documents_matching_collection_query(txn, query, offset)
        }
    }

    fn get_documents_matching_document_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        path: &ResourcePath,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let key = DocumentKey::from_path(path.clone())?;
        let document = self.get_document(txn, &key)?;
        let mut result = BTreeMap::new();
        if document.is_found_document() {
            result.insert(key, document);
        }
        Ok(result)
    }

    fn get_documents_matching_collection_group_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        offset: &IndexOffset,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let mut result = BTreeMap::new();
        let Some(collection_id) = query.collection_group_id() else {
            return Ok(result);
        };
        let parents = txn.index_manager.get_collection_parents(collection_id)?;
        for parent in parents {
            let collection_query = query.as_collection_query_at_path(parent.child([collection_id]));
            result.extend(self.get_documents_matching_collection_query(txn, &collection_query, offset)?);
        }
        Ok(result)
    }

    fn get_documents_matching_collection_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        offset: &IndexOffset,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let overlays = txn
            .document_overlays
            .get_overlays_for_collection(query.path(), offset.largest_batch_id)?;
        let mutated_keys: BTreeSet<DocumentKey> = overlays.keys().cloned().collect();
        let mut remote = txn
            .remote_documents
            .get_documents_matching_query(query, offset, &mutated_keys)?;

        // Documents created locally have an overlay but no cache entry yet.
        for key in &mutated_keys {
            remote
                .entry(key.clone())
                .or_insert_with(|| Document::new_invalid(key.clone()));
        }

        let mut results = BTreeMap::new();
        for (key, mut document) in remote {
            if let Some(overlay) = overlays.get(&key) {
                overlay
                    .mutation()
                    .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
            }
            if query.matches(&document) {
                results.insert(key, document);
            }
        }
        Ok(results)
    }

    fn base_document(
        txn: &PersistenceTransaction<'_>,
        key: &DocumentKey,
        overlay: Option<&Overlay>,
    ) -> FirestoreResult<Document> {
        match overlay {
            Some(overlay) if !overlay.mutation().is_patch() => Ok(Document::new_invalid(key.clone())),
            _ => txn.remote_documents.get_entry(key),
        }
    }
}
