pub mod bundle_cache;
pub mod document_overlay_cache;
pub mod index_manager;
pub mod local_documents_view;
pub mod local_store;
pub mod memory_persistence;
pub mod mutation_queue;
pub mod persistence;
pub mod query_engine;
pub mod reference_delegate;
pub mod reference_set;
pub mod remote_document_cache;
pub mod target_cache;
pub mod target_data;

#[doc(inline)]
pub use bundle_cache::{BundleCache, BundleMetadata, MemoryBundleCache, NamedQuery};
#[doc(inline)]
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult};
#[doc(inline)]
pub use memory_persistence::MemoryPersistence;
#[doc(inline)]
pub use persistence::{run_transaction, Persistence, PersistenceTransaction, TransactionMode};
#[doc(inline)]
pub use target_data::{TargetData, TargetPurpose};
