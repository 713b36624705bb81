use std::collections::BTreeMap;

use crate::firestore::core::query::DocumentComparator;
use crate::firestore::model::{Document, DocumentKey};

/// Documents kept in query order with lookup by key.
#[derive(Clone, Debug)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, Document>,
    sorted: Vec<Document>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.sorted
            .binary_search_by(|probe| self.comparator.compare(probe, document))
            .ok()
    }

    pub fn comparator(&self) -> &DocumentComparator {
        &self.comparator
    }

    /// Inserts or replaces the document with the same key.
    pub fn add(&mut self, document: Document) {
        self.delete(document.key());
        let position = self
            .sorted
            .binary_search_by(|probe| self.comparator.compare(probe, &document))
            .unwrap_or_else(|insert_at| insert_at);
        self.by_key.insert(document.key().clone(), document.clone());
        self.sorted.insert(position, document);
    }

    pub fn delete(&mut self, key: &DocumentKey) -> Option<Document> {
        let index = self.index_of(key)?;
        self.by_key.remove(key);
        Some(self.sorted.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(Document::key)
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}
