use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Target;
use crate::firestore::error::FirestoreResult;
use crate::firestore::model::ResourcePath;

/// How well a target can be served from an index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    None,
    Partial,
    Full,
}

/// Query indexes. Only the collection parent index is maintained; field
/// indexes are never available so every target reports [`IndexType::None`].
pub trait IndexManager: Send {
    /// Records that `collection_path` holds documents, so collection group
    /// queries can find it.
    fn add_to_collection_parent_index(&mut self, collection_path: &ResourcePath) -> FirestoreResult<()>;

    /// Parent paths of every known collection with the given id.
    fn get_collection_parents(&self, collection_id: &str) -> FirestoreResult<BTreeSet<ResourcePath>>;

    fn get_index_type(&self, target: &Target) -> FirestoreResult<IndexType>;
}

#[derive(Debug, Default)]
pub struct MemoryIndexManager {
    collection_parent_index: BTreeMap<String, BTreeSet<ResourcePath>>,
}

impl MemoryIndexManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexManager for MemoryIndexManager {
    fn add_to_collection_parent_index(&mut self, collection_path: &ResourcePath) -> FirestoreResult<()> {
        let Some(collection_id) = collection_path.last_segment() else {
            return Ok(());
        };
        let parent = collection_path.without_last();
        self.collection_parent_index
            .entry(collection_id.to_string())
            .or_default()
            .insert(parent);
        Ok(())
    }

    fn get_collection_parents(&self, collection_id: &str) -> FirestoreResult<BTreeSet<ResourcePath>> {
        Ok(self
            .collection_parent_index
            .get(collection_id)
            .cloned()
            .unwrap_or_default())
    }

    fn get_index_type(&self, _target: &Target) -> FirestoreResult<IndexType> {
        Ok(IndexType::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexes_collection_parents_by_id() {
        let mut manager = MemoryIndexManager::new();
        manager
            .add_to_collection_parent_index(&ResourcePath::from_string("rooms/a/messages").unwrap())
            .unwrap();
        manager
            .add_to_collection_parent_index(&ResourcePath::from_string("rooms/b/messages").unwrap())
            .unwrap();
        manager
            .add_to_collection_parent_index(&ResourcePath::from_string("rooms").unwrap())
            .unwrap();

        let parents = manager.get_collection_parents("messages").unwrap();
        assert_eq!(parents.len(), 2);
        let roots = manager.get_collection_parents("rooms").unwrap();
        assert_eq!(roots, BTreeSet::from([ResourcePath::root()]));
    }
}
