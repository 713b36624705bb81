use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::firestore::error::{persistence_failure, FirestoreResult};
use crate::firestore::local::{MemoryPersistence, Persistence, PersistenceTransaction, TransactionMode};
use crate::firestore::model::User;

/// Memory persistence that fails the next `n` transactions with a retryable
/// error. Arm it through a [`FailureSwitch`] kept by the test.
pub struct FlakyPersistence {
    inner: MemoryPersistence,
    switch: FailureSwitch,
}

/// Shared handle controlling how many transactions fail.
#[derive(Clone, Default)]
pub struct FailureSwitch {
    remaining: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
}

impl FailureSwitch {
    pub fn fail_next(&self, transactions: usize) {
        self.remaining.store(transactions, Ordering::SeqCst);
    }

    /// Transactions failed so far.
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl FlakyPersistence {
    pub fn new() -> (Self, FailureSwitch) {
        let switch = FailureSwitch::default();
        let persistence = Self {
            inner: MemoryPersistence::new(),
            switch: switch.clone(),
        };
        (persistence, switch)
    }
}

impl Persistence for FlakyPersistence {
    fn start(&mut self) -> FirestoreResult<()> {
        self.inner.start()
    }

    fn shutdown(&mut self) -> FirestoreResult<()> {
        self.inner.shutdown()
    }

    fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    fn run_transaction(
        &mut self,
        label: &str,
        mode: TransactionMode,
        user: &User,
        f: &mut dyn FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<()>,
    ) -> FirestoreResult<()> {
        if self.switch.should_fail() {
            self.switch.failed.fetch_add(1, Ordering::SeqCst);
            return Err(persistence_failure(format!("Transaction '{label}' failed: storage unavailable")));
        }
        self.inner.run_transaction(label, mode, user, f)
    }
}
