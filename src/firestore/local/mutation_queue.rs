use std::collections::{BTreeSet, VecDeque};

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN};
use crate::util::assert::hard_assert;

/// Per-user, append-only log of unacknowledged mutation batches.
pub trait MutationQueue: Send {
    fn is_empty(&self) -> FirestoreResult<bool>;

    fn acknowledge_batch(&mut self, batch: &MutationBatch, stream_token: Vec<u8>) -> FirestoreResult<()>;

    fn last_stream_token(&self) -> FirestoreResult<Vec<u8>>;

    fn set_last_stream_token(&mut self, stream_token: Vec<u8>) -> FirestoreResult<()>;

    fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch>;

    fn lookup_mutation_batch(&self, batch_id: i32) -> FirestoreResult<Option<MutationBatch>>;

    /// The first batch with an id strictly greater than `batch_id`.
    fn next_mutation_batch_after_batch_id(&self, batch_id: i32) -> FirestoreResult<Option<MutationBatch>>;

    fn highest_unacknowledged_batch_id(&self) -> FirestoreResult<i32>;

    fn all_mutation_batches(&self) -> FirestoreResult<Vec<MutationBatch>>;

    fn all_mutation_batches_affecting_document_key(&self, key: &DocumentKey) -> FirestoreResult<Vec<MutationBatch>>;

    fn all_mutation_batches_affecting_document_keys(
        &self,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<Vec<MutationBatch>>;

    fn all_mutation_batches_affecting_query(&self, query: &Query) -> FirestoreResult<Vec<MutationBatch>>;

    /// Removes `batch`, which must be the oldest batch in the queue.
    fn remove_mutation_batch(&mut self, batch: &MutationBatch) -> FirestoreResult<BTreeSet<DocumentKey>>;

    fn contains_key(&self, key: &DocumentKey) -> bool;

    fn perform_consistency_check(&self) -> FirestoreResult<()>;
}

#[derive(Debug)]
pub struct MemoryMutationQueue {
    queue: VecDeque<MutationBatch>,
    next_batch_id: i32,
    last_stream_token: Vec<u8>,
    /// `(key, batch_id)` pairs, ordered so every batch touching a key is contiguous.
    batches_by_document_key: BTreeSet<(DocumentKey, i32)>,
}

impl Default for MemoryMutationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMutationQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            next_batch_id: 1,
            last_stream_token: Vec::new(),
            batches_by_document_key: BTreeSet::new(),
        }
    }

    /// Position of `batch_id` in the queue if the ids were contiguous.
    fn index_of_batch_id(&self, batch_id: i32) -> Option<usize> {
        let first = self.queue.front()?;
        let index = batch_id - first.batch_id;
        usize::try_from(index).ok()
    }

    fn find_mutation_batch(&self, batch_id: i32) -> Option<&MutationBatch> {
        let index = self.index_of_batch_id(batch_id)?;
        let batch = self.queue.get(index)?;
        hard_assert(batch.batch_id == batch_id, "If found batch must match");
        Some(batch)
    }

    fn batch_ids_for_key(&self, key: &DocumentKey) -> impl Iterator<Item = i32> + '_ {
        let key = key.clone();
        self.batches_by_document_key
            .range((key.clone(), i32::MIN)..)
            .take_while(move |(entry_key, _)| *entry_key == key)
            .map(|(_, batch_id)| *batch_id)
    }

    fn batches_for_ids(&self, ids: BTreeSet<i32>) -> Vec<MutationBatch> {
        ids.into_iter()
            .filter_map(|batch_id| self.find_mutation_batch(batch_id).cloned())
            .collect()
    }
}

impl MutationQueue for MemoryMutationQueue {
    fn is_empty(&self) -> FirestoreResult<bool> {
        Ok(self.queue.is_empty())
    }

    fn acknowledge_batch(&mut self, batch: &MutationBatch, stream_token: Vec<u8>) -> FirestoreResult<()> {
        let index = self.index_of_batch_id(batch.batch_id);
        hard_assert(index == Some(0), "Can only acknowledge the first batch in the mutation queue");
        self.last_stream_token = stream_token;
        Ok(())
    }

    fn last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        Ok(self.last_stream_token.clone())
    }

    fn set_last_stream_token(&mut self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        self.last_stream_token = stream_token;
        Ok(())
    }

    fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        hard_assert(!mutations.is_empty(), "Mutation batches should not be empty");
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        if let Some(last) = self.queue.back() {
            hard_assert(
                last.batch_id < batch_id,
                "Mutation batch ids must be monotonically increasing",
            );
        }

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        for mutation in &batch.mutations {
            self.batches_by_document_key
                .insert((mutation.key().clone(), batch_id));
        }
        self.queue.push_back(batch.clone());
        Ok(batch)
    }

    fn lookup_mutation_batch(&self, batch_id: i32) -> FirestoreResult<Option<MutationBatch>> {
        Ok(self.find_mutation_batch(batch_id).cloned())
    }

    fn next_mutation_batch_after_batch_id(&self, batch_id: i32) -> FirestoreResult<Option<MutationBatch>> {
        let next_batch_id = batch_id + 1;
        // The requested id may already be acknowledged, so start at the head.
        let index = self.index_of_batch_id(next_batch_id).unwrap_or(0);
        Ok(self.queue.get(index).cloned())
    }

    fn highest_unacknowledged_batch_id(&self) -> FirestoreResult<i32> {
        Ok(if self.queue.is_empty() {
            BATCH_ID_UNKNOWN
        } else {
            self.next_batch_id - 1
        })
    }

    fn all_mutation_batches(&self) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(self.queue.iter().cloned().collect())
    }

    fn all_mutation_batches_affecting_document_key(&self, key: &DocumentKey) -> FirestoreResult<Vec<MutationBatch>> {
        let ids = self.batch_ids_for_key(key).collect();
        Ok(self.batches_for_ids(ids))
    }

    fn all_mutation_batches_affecting_document_keys(
        &self,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let ids = keys.iter().flat_map(|key| self.batch_ids_for_key(key)).collect();
        Ok(self.batches_for_ids(ids))
    }

    fn all_mutation_batches_affecting_query(&self, query: &Query) -> FirestoreResult<Vec<MutationBatch>> {
        hard_assert(
            !query.is_collection_group_query(),
            "Collection group queries are answered through the collection parent index",
        );
        let prefix = query.path();
        let ids = self
            .batches_by_document_key
            .iter()
            .filter(|(key, _)| prefix.is_immediate_parent_of(key.path()))
            .map(|(_, batch_id)| *batch_id)
            .collect();
        Ok(self.batches_for_ids(ids))
    }

    fn remove_mutation_batch(&mut self, batch: &MutationBatch) -> FirestoreResult<BTreeSet<DocumentKey>> {
        let index = self.index_of_batch_id(batch.batch_id);
        hard_assert(index == Some(0), "Can only remove the first entry of the mutation queue");
        self.queue.pop_front();

        let keys = batch.keys();
        for key in &keys {
            self.batches_by_document_key.remove(&(key.clone(), batch.batch_id));
        }
        Ok(keys)
    }

    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batch_ids_for_key(key).next().is_some()
    }

    fn perform_consistency_check(&self) -> FirestoreResult<()> {
        if self.queue.is_empty() {
            hard_assert(
                self.batches_by_document_key.is_empty(),
                "Document leak -- detected dangling mutation references when queue is empty.",
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::ResourcePath;
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn add(queue: &mut MemoryMutationQueue, paths: &[&str]) -> MutationBatch {
        let mutations = paths
            .iter()
            .map(|path| Mutation::set(key(path), MapValue::empty()))
            .collect();
        queue
            .add_mutation_batch(Timestamp::new(1, 0), Vec::new(), mutations)
            .unwrap()
    }

    #[test]
    fn assigns_increasing_batch_ids() {
        let mut queue = MemoryMutationQueue::new();
        assert_eq!(queue.highest_unacknowledged_batch_id().unwrap(), BATCH_ID_UNKNOWN);
        let first = add(&mut queue, &["rooms/a"]);
        let second = add(&mut queue, &["rooms/b"]);
        assert_eq!(first.batch_id, 1);
        assert_eq!(second.batch_id, 2);
        assert_eq!(queue.highest_unacknowledged_batch_id().unwrap(), 2);
    }

    #[test]
    fn finds_batches_by_key_and_query() {
        let mut queue = MemoryMutationQueue::new();
        add(&mut queue, &["rooms/a", "rooms/b"]);
        add(&mut queue, &["rooms/a/messages/1"]);
        add(&mut queue, &["rooms/c"]);

        let for_a = queue.all_mutation_batches_affecting_document_key(&key("rooms/a")).unwrap();
        assert_eq!(for_a.len(), 1);

        let query = Query::new(ResourcePath::from_string("rooms").unwrap());
        let ids: Vec<i32> = queue
            .all_mutation_batches_affecting_query(&query)
            .unwrap()
            .iter()
            .map(|b| b.batch_id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn next_batch_skips_acknowledged_ids() {
        let mut queue = MemoryMutationQueue::new();
        let first = add(&mut queue, &["rooms/a"]);
        add(&mut queue, &["rooms/b"]);
        queue.remove_mutation_batch(&first).unwrap();

        let next = queue.next_mutation_batch_after_batch_id(BATCH_ID_UNKNOWN).unwrap();
        assert_eq!(next.map(|b| b.batch_id), Some(2));
        assert!(queue.next_mutation_batch_after_batch_id(2).unwrap().is_none());
    }

    #[test]
    #[should_panic(expected = "INTERNAL ASSERT FAILED")]
    fn removing_non_head_batch_is_fatal() {
        let mut queue = MemoryMutationQueue::new();
        add(&mut queue, &["rooms/a"]);
        let second = add(&mut queue, &["rooms/b"]);
        let _ = queue.remove_mutation_batch(&second);
    }

    #[test]
    fn removing_head_clears_key_index() {
        let mut queue = MemoryMutationQueue::new();
        let batch = add(&mut queue, &["rooms/a"]);
        assert!(queue.contains_key(&key("rooms/a")));
        queue.remove_mutation_batch(&batch).unwrap();
        assert!(!queue.contains_key(&key("rooms/a")));
        queue.perform_consistency_check().unwrap();
    }
}
