use std::collections::BTreeMap;

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::model::SnapshotVersion;

/// Metadata of a loaded data bundle.
#[derive(Clone, Debug, PartialEq)]
pub struct BundleMetadata {
    pub id: String,
    pub version: i32,
    pub create_time: SnapshotVersion,
}

/// A query saved from a bundle together with the time its results were read.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedQuery {
    pub name: String,
    pub query: Query,
    pub read_time: SnapshotVersion,
}

pub trait BundleCache: Send {
    fn get_bundle_metadata(&self, bundle_id: &str) -> FirestoreResult<Option<BundleMetadata>>;

    fn save_bundle_metadata(&mut self, metadata: BundleMetadata) -> FirestoreResult<()>;

    fn get_named_query(&self, name: &str) -> FirestoreResult<Option<NamedQuery>>;

    fn save_named_query(&mut self, query: NamedQuery) -> FirestoreResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryBundleCache {
    bundles: BTreeMap<String, BundleMetadata>,
    named_queries: BTreeMap<String, NamedQuery>,
}

impl MemoryBundleCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BundleCache for MemoryBundleCache {
    fn get_bundle_metadata(&self, bundle_id: &str) -> FirestoreResult<Option<BundleMetadata>> {
        Ok(self.bundles.get(bundle_id).cloned())
    }

    fn save_bundle_metadata(&mut self, metadata: BundleMetadata) -> FirestoreResult<()> {
        self.bundles.insert(metadata.id.clone(), metadata);
        Ok(())
    }

    fn get_named_query(&self, name: &str) -> FirestoreResult<Option<NamedQuery>> {
        Ok(self.named_queries.get(name).cloned())
    }

    fn save_named_query(&mut self, query: NamedQuery) -> FirestoreResult<()> {
        self.named_queries.insert(query.name.clone(), query);
        Ok(())
    }
}
