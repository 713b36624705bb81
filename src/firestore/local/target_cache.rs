use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Target;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{DocumentKey, SnapshotVersion};
use crate::util::assert::hard_assert;

/// Stores target metadata and the document keys the backend reported as
/// matching each target.
pub trait TargetCache: Send {
    fn allocate_target_id(&mut self) -> FirestoreResult<i32>;

    fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion>;

    fn set_target_snapshot_version(&mut self, version: SnapshotVersion) -> FirestoreResult<()>;

    fn highest_sequence_number(&self) -> i64;

    fn add_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()>;

    fn update_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()>;

    fn remove_target_data(&mut self, target_data: &TargetData) -> FirestoreResult<()>;

    fn target_count(&self) -> usize;

    fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>>;

    fn add_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: i32) -> FirestoreResult<()>;

    fn remove_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: i32) -> FirestoreResult<()>;

    fn remove_matching_keys_for_target_id(&mut self, target_id: i32) -> FirestoreResult<BTreeSet<DocumentKey>>;

    fn get_matching_keys_for_target_id(&self, target_id: i32) -> FirestoreResult<BTreeSet<DocumentKey>>;

    fn contains_key(&self, key: &DocumentKey) -> bool;
}

#[derive(Debug)]
pub struct MemoryTargetCache {
    /// Keyed by canonical id; structurally equal targets share one entry.
    targets: BTreeMap<String, TargetData>,
    last_remote_snapshot_version: SnapshotVersion,
    highest_target_id: i32,
    highest_sequence_number: i64,
    references: ReferenceSet,
    target_id_generator: TargetIdGenerator,
}

impl Default for MemoryTargetCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTargetCache {
    pub fn new() -> Self {
        Self {
            targets: BTreeMap::new(),
            last_remote_snapshot_version: SnapshotVersion::min(),
            highest_target_id: 0,
            highest_sequence_number: 0,
            references: ReferenceSet::new(),
            target_id_generator: TargetIdGenerator::for_target_cache(),
        }
    }

    fn save_target_data(&mut self, target_data: TargetData) {
        if target_data.target_id > self.highest_target_id {
            self.target_id_generator = TargetIdGenerator::seeded(target_data.target_id);
            self.highest_target_id = target_data.target_id;
        }
        if target_data.sequence_number > self.highest_sequence_number {
            self.highest_sequence_number = target_data.sequence_number;
        }
        self.targets
            .insert(target_data.target.canonical_id(), target_data);
    }
}

impl TargetCache for MemoryTargetCache {
    fn allocate_target_id(&mut self) -> FirestoreResult<i32> {
        self.highest_target_id = self.target_id_generator.next();
        Ok(self.highest_target_id)
    }

    fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        Ok(self.last_remote_snapshot_version)
    }

    fn set_target_snapshot_version(&mut self, version: SnapshotVersion) -> FirestoreResult<()> {
        self.last_remote_snapshot_version = version;
        Ok(())
    }

    fn highest_sequence_number(&self) -> i64 {
        self.highest_sequence_number
    }

    fn add_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()> {
        hard_assert(
            !self.targets.contains_key(&target_data.target.canonical_id()),
            "Adding a target that already exists",
        );
        self.save_target_data(target_data);
        Ok(())
    }

    fn update_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()> {
        hard_assert(
            self.targets.contains_key(&target_data.target.canonical_id()),
            "Updating a non-existent target",
        );
        self.save_target_data(target_data);
        Ok(())
    }

    fn remove_target_data(&mut self, target_data: &TargetData) -> FirestoreResult<()> {
        let canonical_id = target_data.target.canonical_id();
        hard_assert(
            self.targets.contains_key(&canonical_id),
            "Removing a non-existent target",
        );
        self.targets.remove(&canonical_id);
        self.references
            .remove_references_for_id(target_data.target_id);
        Ok(())
    }

    fn target_count(&self) -> usize {
        self.targets.len()
    }

    fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        Ok(self.targets.get(&target.canonical_id()).cloned())
    }

    fn add_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: i32) -> FirestoreResult<()> {
        self.references.add_references(keys.iter().cloned(), target_id);
        Ok(())
    }

    fn remove_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: i32) -> FirestoreResult<()> {
        self.references.remove_references(keys, target_id);
        Ok(())
    }

    fn remove_matching_keys_for_target_id(&mut self, target_id: i32) -> FirestoreResult<BTreeSet<DocumentKey>> {
        Ok(self.references.remove_references_for_id(target_id))
    }

    fn get_matching_keys_for_target_id(&self, target_id: i32) -> FirestoreResult<BTreeSet<DocumentKey>> {
        Ok(self.references.references_for_id(target_id))
    }

    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.references.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::target_data::TargetPurpose;
    use crate::firestore::model::ResourcePath;

    fn target(path: &str) -> Target {
        Query::new(ResourcePath::from_string(path).unwrap()).to_target()
    }

    #[test]
    fn allocates_even_target_ids() {
        let mut cache = MemoryTargetCache::new();
        assert_eq!(cache.allocate_target_id().unwrap(), 2);
        assert_eq!(cache.allocate_target_id().unwrap(), 4);
    }

    #[test]
    fn looks_up_targets_structurally() {
        let mut cache = MemoryTargetCache::new();
        let id = cache.allocate_target_id().unwrap();
        cache
            .add_target_data(TargetData::new(target("rooms"), id, TargetPurpose::Listen, 7))
            .unwrap();

        let found = cache.get_target_data(&target("rooms")).unwrap().unwrap();
        assert_eq!(found.target_id, id);
        assert_eq!(cache.highest_sequence_number(), 7);
        assert!(cache.get_target_data(&target("games")).unwrap().is_none());
    }

    #[test]
    fn removing_target_drops_matching_keys() {
        let mut cache = MemoryTargetCache::new();
        let data = TargetData::new(target("rooms"), 2, TargetPurpose::Listen, 1);
        cache.add_target_data(data.clone()).unwrap();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        cache.add_matching_keys(&BTreeSet::from([key.clone()]), 2).unwrap();
        assert!(cache.contains_key(&key));

        cache.remove_target_data(&data).unwrap();
        assert!(!cache.contains_key(&key));
        assert_eq!(cache.target_count(), 0);
    }
}
