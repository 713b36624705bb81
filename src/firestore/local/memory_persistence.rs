use std::collections::BTreeMap;

use crate::firestore::error::{failed_precondition, FirestoreResult};
use crate::firestore::local::bundle_cache::MemoryBundleCache;
use crate::firestore::local::document_overlay_cache::MemoryDocumentOverlayCache;
use crate::firestore::local::index_manager::MemoryIndexManager;
use crate::firestore::local::mutation_queue::{MemoryMutationQueue, MutationQueue};
use crate::firestore::local::persistence::{Persistence, PersistenceTransaction, TransactionMode};
use crate::firestore::local::reference_delegate::{MemoryEagerDelegate, ReferenceDelegate};
use crate::firestore::local::remote_document_cache::{MemoryRemoteDocumentCache, RemoteDocumentCache};
use crate::firestore::local::target_cache::{MemoryTargetCache, TargetCache};
use crate::firestore::model::{DocumentKey, User};

/// In-memory persistence with eager garbage collection.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    mutation_queues: BTreeMap<User, MemoryMutationQueue>,
    overlays: BTreeMap<User, MemoryDocumentOverlayCache>,
    remote_documents: MemoryRemoteDocumentCache,
    target_cache: MemoryTargetCache,
    index_manager: MemoryIndexManager,
    bundle_cache: MemoryBundleCache,
    reference_delegate: MemoryEagerDelegate,
    sequence_number: i64,
    started: bool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remote_documents(&self) -> &MemoryRemoteDocumentCache {
        &self.remote_documents
    }

    fn is_referenced(&self, key: &DocumentKey) -> bool {
        self.reference_delegate.is_pinned_by_local_view(key)
            || self.target_cache.contains_key(key)
            || self.mutation_queues.values().any(|queue| queue.contains_key(key))
    }

    fn collect_orphaned_documents(&mut self) -> FirestoreResult<()> {
        let orphaned = self.reference_delegate.take_orphaned_documents();
        for key in orphaned {
            if !self.is_referenced(&key) {
                log::debug!("Removing orphaned document {key}");
                self.remote_documents.remove_entry(&key)?;
            }
        }
        Ok(())
    }
}

impl Persistence for MemoryPersistence {
    fn start(&mut self) -> FirestoreResult<()> {
        self.started = true;
        Ok(())
    }

    fn shutdown(&mut self) -> FirestoreResult<()> {
        self.started = false;
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }

    fn run_transaction(
        &mut self,
        label: &str,
        mode: TransactionMode,
        user: &User,
        f: &mut dyn FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<()>,
    ) -> FirestoreResult<()> {
        if !self.started {
            return Err(failed_precondition(format!(
                "Persistence is not started, cannot run '{label}'"
            )));
        }
        log::debug!("Starting transaction: {label}");

        self.sequence_number = self
            .sequence_number
            .max(self.target_cache.highest_sequence_number())
            + 1;
        self.reference_delegate.on_transaction_started();

        let result = {
            let mut txn = PersistenceTransaction {
                mutation_queue: self.mutation_queues.entry(user.clone()).or_default(),
                document_overlays: self.overlays.entry(user.clone()).or_default(),
                remote_documents: &mut self.remote_documents,
                targets: &mut self.target_cache,
                index_manager: &mut self.index_manager,
                bundles: &mut self.bundle_cache,
                references: &mut self.reference_delegate,
                current_sequence_number: self.sequence_number,
            };
            f(&mut txn)
        };

        match result {
            Ok(()) if !mode.is_read_only() => self.collect_orphaned_documents(),
            Ok(()) => Ok(()),
            Err(error) => {
                self.reference_delegate.take_orphaned_documents();
                Err(error)
            }
        }
    }
}
