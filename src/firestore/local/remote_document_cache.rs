use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{Document, DocumentKey, IndexOffset, SnapshotVersion};
use crate::util::assert::hard_assert;

/// Last known server state of every cached document.
///
/// Local writes never touch this cache; it only changes when the backend
/// confirms a document or acknowledges a write.
pub trait RemoteDocumentCache: Send {
    /// Stores `document`, whose read time must already be set.
    fn add_entry(&mut self, document: Document) -> FirestoreResult<()>;

    fn remove_entry(&mut self, key: &DocumentKey) -> FirestoreResult<()>;

    /// The cached document, or an invalid document when the key is unknown.
    fn get_entry(&self, key: &DocumentKey) -> FirestoreResult<Document>;

    fn get_entries(&self, keys: &BTreeSet<DocumentKey>) -> FirestoreResult<BTreeMap<DocumentKey, Document>>;

    /// Documents directly inside the query's collection that were read after
    /// `offset`. Keys in `mutated_keys` are returned even when they do not
    /// match, since a pending write may make them match.
    fn get_documents_matching_query(
        &self,
        query: &Query,
        offset: &IndexOffset,
        mutated_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>>;
}

#[derive(Debug, Default)]
pub struct MemoryRemoteDocumentCache {
    docs: BTreeMap<DocumentKey, Document>,
}

impl MemoryRemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.docs.contains_key(key)
    }
}

impl RemoteDocumentCache for MemoryRemoteDocumentCache {
    fn add_entry(&mut self, document: Document) -> FirestoreResult<()> {
        hard_assert(
            !document.read_time().is_min(),
            "Cannot add a document with a read time of zero",
        );
        self.docs.insert(document.key().clone(), document);
        Ok(())
    }

    fn remove_entry(&mut self, key: &DocumentKey) -> FirestoreResult<()> {
        self.docs.remove(key);
        Ok(())
    }

    fn get_entry(&self, key: &DocumentKey) -> FirestoreResult<Document> {
        Ok(self
            .docs
            .get(key)
            .cloned()
            .unwrap_or_else(|| Document::new_invalid(key.clone())))
    }

    fn get_entries(&self, keys: &BTreeSet<DocumentKey>) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        keys.iter()
            .map(|key| Ok((key.clone(), self.get_entry(key)?)))
            .collect()
    }

    fn get_documents_matching_query(
        &self,
        query: &Query,
        offset: &IndexOffset,
        mutated_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let collection = query.path();
        let mut results = BTreeMap::new();
        for (key, document) in &self.docs {
            if !collection.is_immediate_parent_of(key.path()) {
                continue;
            }
            if IndexOffset::from_document(document) <= *offset {
                continue;
            }
            if !mutated_keys.contains(key) && !query.matches(document) {
                continue;
            }
            results.insert(key.clone(), document.clone());
        }
        Ok(results)
    }
}

/// Collects cache changes made while applying one remote event or ack so
/// they are written together.
#[derive(Debug, Default)]
pub struct RemoteDocumentChangeBuffer {
    changes: BTreeMap<DocumentKey, Document>,
}

impl RemoteDocumentChangeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&mut self, document: Document) {
        self.changes.insert(document.key().clone(), document);
    }

    /// Records a removal as an invalid document at `read_time`.
    pub fn remove_entry(&mut self, key: DocumentKey, read_time: SnapshotVersion) {
        let mut document = Document::new_invalid(key.clone());
        document.set_read_time(read_time);
        self.changes.insert(key, document);
    }

    /// The buffered change for `key`, falling back to `cache`.
    pub fn get_entry(&self, cache: &dyn RemoteDocumentCache, key: &DocumentKey) -> FirestoreResult<Document> {
        match self.changes.get(key) {
            Some(document) => Ok(document.clone()),
            None => cache.get_entry(key),
        }
    }

    pub fn get_entries(
        &self,
        cache: &dyn RemoteDocumentCache,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        keys.iter()
            .map(|key| Ok((key.clone(), self.get_entry(cache, key)?)))
            .collect()
    }

    pub fn changed_keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.changes.keys()
    }

    pub fn apply(self, cache: &mut dyn RemoteDocumentCache) -> FirestoreResult<()> {
        for (key, document) in self.changes {
            if document.is_valid_document() {
                cache.add_entry(document)?;
            } else {
                cache.remove_entry(&key)?;
            }
        }
        Ok(())
    }
}
