use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::bundle_cache::BundleCache;
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::reference_delegate::ReferenceDelegate;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::model::User;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Read-write, only allowed on the primary client.
    ReadWritePrimary,
}

impl TransactionMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, TransactionMode::ReadOnly)
    }
}

/// Every store of a [`Persistence`], borrowed for the duration of one
/// transaction. The queue and overlay cache belong to the transaction's user.
pub struct PersistenceTransaction<'a> {
    pub mutation_queue: &'a mut dyn MutationQueue,
    pub document_overlays: &'a mut dyn DocumentOverlayCache,
    pub remote_documents: &'a mut dyn RemoteDocumentCache,
    pub targets: &'a mut dyn TargetCache,
    pub index_manager: &'a mut dyn IndexManager,
    pub bundles: &'a mut dyn BundleCache,
    pub references: &'a mut dyn ReferenceDelegate,
    pub current_sequence_number: i64,
}

/// Storage backend for the local store.
///
/// All reads and writes happen inside [`Persistence::run_transaction`]. The
/// memory backend has no rollback; a transaction only marks the boundary at
/// which orphaned documents are collected.
pub trait Persistence: Send {
    fn start(&mut self) -> FirestoreResult<()>;

    fn shutdown(&mut self) -> FirestoreResult<()>;

    fn is_started(&self) -> bool;

    fn run_transaction(
        &mut self,
        label: &str,
        mode: TransactionMode,
        user: &User,
        f: &mut dyn FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<()>,
    ) -> FirestoreResult<()>;
}

/// Runs `f` in a transaction and returns its value.
pub fn run_transaction<T, F>(
    persistence: &mut dyn Persistence,
    label: &str,
    mode: TransactionMode,
    user: &User,
    f: F,
) -> FirestoreResult<T>
where
    F: FnOnce(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
{
    let mut f = Some(f);
    let mut output = None;
    persistence.run_transaction(label, mode, user, &mut |txn| {
        let f = f
            .take()
            .ok_or_else(|| internal_error(format!("Transaction '{label}' ran its body twice")))?;
        output = Some(f(txn)?);
        Ok(())
    })?;
    output.ok_or_else(|| internal_error(format!("Transaction '{label}' did not run its body")))
}
