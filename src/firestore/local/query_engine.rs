use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::index_manager::IndexType;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{Document, DocumentKey, IndexOffset, SnapshotVersion, BATCH_ID_UNKNOWN};

/// Picks the cheapest way to answer a query from the local cache.
///
/// Field indexes are never available, so a query either reuses the keys
/// from its last limbo-free snapshot and only scans documents read since
/// then, or falls back to a full collection scan.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryEngine {
    local_documents: LocalDocumentsView,
}

impl QueryEngine {
    pub fn new(local_documents: LocalDocumentsView) -> Self {
        Self { local_documents }
    }

    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        if let Some(result) = self.perform_query_using_index(txn, query)? {
            return Ok(result);
        }
        if let Some(result) =
            self.perform_query_using_remote_keys(txn, query, remote_keys, last_limbo_free_snapshot_version)?
        {
            return Ok(result);
        }
        self.execute_full_collection_scan(txn, query)
    }

    fn perform_query_using_index(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
    ) -> FirestoreResult<Option<BTreeMap<DocumentKey, Document>>> {
        if query.matches_all_documents() {
            return Ok(None);
        }
        match txn.index_manager.get_index_type(&query.to_target())? {
            IndexType::None => Ok(None),
            // Index-backed reads need a persistent index store.
            IndexType::Partial | IndexType::Full => Ok(None),
        }
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        remote_keys: &BTreeSet<DocumentKey>,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<Option<BTreeMap<DocumentKey, Document>>> {
        // A full scan is as fast when every document matches.
        if query.matches_all_documents() {
            return Ok(None);
        }
        // Without a limbo-free snapshot the previous keys may be incomplete.
        if last_limbo_free_snapshot_version.is_min() {
            return Ok(None);
        }

        let documents = self.local_documents.get_documents(txn, remote_keys)?;
        let previous_results = apply_query(query, documents.into_values());
        if query.has_limit()
            && needs_refill(query, &previous_results, remote_keys, last_limbo_free_snapshot_version)
        {
            return Ok(None);
        }

        log::debug!(
            "Re-using previous result from {last_limbo_free_snapshot_version} to execute query: {query}"
        );
        let offset = IndexOffset::create_successor(last_limbo_free_snapshot_version, BATCH_ID_UNKNOWN);
        let mut results = self
            .local_documents
            .get_documents_matching_query(txn, query, &offset)?;
        for document in previous_results {
            results.insert(document.key().clone(), document);
        }
        Ok(Some(results))
    }

    fn execute_full_collection_scan(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        log::debug!("Using full collection scan to execute query: {query}");
        self.local_documents
            .get_documents_matching_query(txn, query, &IndexOffset::none())
    }
}

/// Matching documents in query order.
fn apply_query(query: &Query, documents: impl IntoIterator<Item = Document>) -> Vec<Document> {
    let comparator = query.comparator();
    let mut results: Vec<Document> = documents
        .into_iter()
        .filter(|document| query.matches(document))
        .collect();
    results.sort_by(|left, right| comparator.compare(left, right));
    results
}

/// Whether a limit query's previous results can no longer be trusted: a
/// document left the result, or the document at the limit edge changed
/// after the last limbo-free snapshot.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &[Document],
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        Some(document) => {
            document.has_pending_writes() || document.version() > limbo_free_snapshot_version
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::{Filter, Operator};
    use crate::firestore::local::memory_persistence::MemoryPersistence;
    use crate::firestore::local::persistence::{run_transaction, Persistence, TransactionMode};
    use crate::firestore::model::{FieldPath, ResourcePath, Timestamp, User};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, at: i64, open: bool) -> Document {
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("open".to_string(), FirestoreValue::from_bool(open));
        let mut document = Document::new_found(key(path), version(at), MapValue::new(fields));
        document.set_read_time(version(at));
        document
    }

    fn open_rooms() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap()).with_filter(Filter::field(
            FieldPath::from_dot_separated("open").unwrap(),
            Operator::Equal,
            FirestoreValue::from_bool(true),
        ))
    }

    fn persistence_with(docs: Vec<Document>) -> MemoryPersistence {
        let mut persistence = MemoryPersistence::new();
        persistence.start().unwrap();
        run_transaction(&mut persistence, "seed", TransactionMode::ReadOnly, &User::unauthenticated(), |txn| {
            for document in docs {
                txn.remote_documents.add_entry(document)?;
            }
            Ok(())
        })
        .unwrap();
        persistence
    }

    #[test]
    fn full_scan_without_limbo_free_version() {
        let mut persistence = persistence_with(vec![doc("rooms/a", 1, true), doc("rooms/b", 1, false)]);
        let engine = QueryEngine::default();
        let result = run_transaction(&mut persistence, "query", TransactionMode::ReadOnly, &User::unauthenticated(), |txn| {
            engine.get_documents_matching_query(txn, &open_rooms(), SnapshotVersion::min(), &BTreeSet::new())
        })
        .unwrap();
        assert_eq!(result.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/a")]);
    }

    #[test]
    fn reuses_previous_keys_and_scans_newer_reads() {
        // rooms/c was read before the limbo-free version but is not among the
        // remote keys, so the previous-results path must not see it.
        let mut persistence = persistence_with(vec![
            doc("rooms/a", 1, true),
            doc("rooms/c", 1, true),
            doc("rooms/d", 5, true),
        ]);
        let engine = QueryEngine::default();
        let remote_keys = BTreeSet::from([key("rooms/a")]);
        let result = run_transaction(&mut persistence, "query", TransactionMode::ReadOnly, &User::unauthenticated(), |txn| {
            engine.get_documents_matching_query(txn, &open_rooms(), version(2), &remote_keys)
        })
        .unwrap();
        assert_eq!(
            result.keys().cloned().collect::<Vec<_>>(),
            vec![key("rooms/a"), key("rooms/d")]
        );
    }

    #[test]
    fn refills_limit_queries_when_a_result_left() {
        let query = open_rooms().with_limit_to_first(1);
        let previous = vec![doc("rooms/a", 1, true)];
        let remote_keys = BTreeSet::from([key("rooms/a"), key("rooms/b")]);
        assert!(needs_refill(&query, &previous, &remote_keys, version(2)));

        let remote_keys = BTreeSet::from([key("rooms/a")]);
        assert!(!needs_refill(&query, &previous, &remote_keys, version(2)));
        assert!(needs_refill(&query, &[doc("rooms/a", 3, true)], &remote_keys, version(2)));
    }
}
