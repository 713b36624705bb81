use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::{
    calculate_overlay_mutation, Document, DocumentKey, FieldMask, Mutation, MutationResult, OverlayedDocument,
    SnapshotVersion, Timestamp,
};
use crate::util::assert::hard_assert;

/// Batch id reported when the queue holds no unacknowledged batch.
pub const BATCH_ID_UNKNOWN: i32 = -1;

/// A group of mutations written together and acknowledged together.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: i32,
    pub local_write_time: Timestamp,
    /// Patches recording the values that non-idempotent transforms were computed against.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: i32,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations.iter().map(|m| m.key().clone()).collect()
    }

    pub fn applies_to(&self, key: &DocumentKey) -> bool {
        self.mutations.iter().any(|m| m.key() == key)
    }

    pub fn apply_to_remote_document(&self, document: &mut Document, result: &MutationBatchResult) {
        hard_assert(
            result.mutation_results.len() == self.mutations.len(),
            format!(
                "Mismatch between mutations length ({}) and results length ({})",
                self.mutations.len(),
                result.mutation_results.len()
            ),
        );
        for (mutation, mutation_result) in self.mutations.iter().zip(&result.mutation_results) {
            if mutation.key() == document.key() {
                mutation.apply_to_remote_document(document, mutation_result);
            }
        }
    }

    pub fn apply_to_local_view(&self, document: &mut Document, mask: Option<FieldMask>) -> Option<FieldMask> {
        let mut mask = mask;
        for mutation in self.base_mutations.iter().chain(&self.mutations) {
            if mutation.key() == document.key() {
                mask = mutation.apply_to_local_view(document, mask, self.local_write_time);
            }
        }
        mask
    }

    /// Applies this batch on top of already overlaid documents and returns the
    /// overlay mutation each touched key should now store.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for key in self.keys() {
            let Some(overlayed) = documents.get_mut(&key) else {
                continue;
            };
            let mut mask = self.apply_to_local_view(&mut overlayed.document, overlayed.mutated_fields.clone());
            if without_remote_version.contains(&key) {
                mask = None;
            }
            if let Some(overlay) = calculate_overlay_mutation(&overlayed.document, mask.as_ref()) {
                overlays.insert(key.clone(), overlay);
            }
            if !overlayed.document.is_valid_document() {
                overlayed.document.convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }
}

/// Server response for one batch, with the version each document was committed at.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn new(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> Self {
        hard_assert(
            batch.mutations.len() == mutation_results.len(),
            format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            ),
        );
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        }
    }

    /// Keys whose committed value depends on transform results from the server.
    pub fn keys_with_transform_results(&self) -> BTreeSet<DocumentKey> {
        self.batch
            .mutations
            .iter()
            .zip(&self.mutation_results)
            .filter(|(_, result)| !result.transform_results.is_empty())
            .map(|(mutation, _)| mutation.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, TransformOperation};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn counter_field() -> FieldPath {
        FieldPath::from_dot_separated("count").unwrap()
    }

    fn increment(by: i64) -> Mutation {
        Mutation::patch(key("c/1"), MapValue::empty(), FieldMask::empty()).with_transform(
            counter_field(),
            TransformOperation::NumericIncrement(FirestoreValue::from_integer(by)),
        )
    }

    #[test]
    fn base_mutations_run_before_mutations() {
        let mut base_value = MapValue::empty();
        base_value.set(&counter_field(), FirestoreValue::from_integer(10));
        let base = Mutation::patch(key("c/1"), base_value, FieldMask::new([counter_field()]));
        let batch = MutationBatch::new(1, Timestamp::now(), vec![base], vec![increment(2)]);

        let mut data = MapValue::empty();
        data.set(&counter_field(), FirestoreValue::from_integer(50));
        let mut doc = Document::new_found(key("c/1"), SnapshotVersion::min(), data);
        batch.apply_to_local_view(&mut doc, Some(FieldMask::empty()));
        assert_eq!(doc.field(&counter_field()), Some(&FirestoreValue::from_integer(12)));
    }

    #[test]
    fn result_tracks_versions_per_key() {
        let batch = MutationBatch::new(
            3,
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::delete(key("a/1")), increment(1)],
        );
        let version = SnapshotVersion::new(Timestamp::new(9, 0));
        let result = MutationBatchResult::new(
            batch,
            version,
            vec![
                MutationResult::new(version),
                MutationResult {
                    version,
                    transform_results: vec![FirestoreValue::from_integer(1)],
                },
            ],
            Vec::new(),
        );
        assert_eq!(result.doc_versions.len(), 2);
        assert_eq!(result.keys_with_transform_results(), BTreeSet::from([key("c/1")]));
    }

    #[test]
    #[should_panic(expected = "INTERNAL ASSERT FAILED")]
    fn mismatched_results_are_fatal() {
        let batch = MutationBatch::new(1, Timestamp::now(), Vec::new(), vec![increment(1)]);
        MutationBatchResult::new(batch, SnapshotVersion::min(), Vec::new(), Vec::new());
    }
}
