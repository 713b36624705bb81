//! Query-facing half of the engine: queries and their views, the sync
//! engine that keeps views current, listener fan-out, and the client that
//! serializes all of it on one queue.

pub mod client;
pub mod document_set;
pub mod engine;
pub mod event_manager;
pub mod query;
pub mod sync_engine;
pub mod target_id_generator;
pub mod types;
pub mod view;
pub mod view_snapshot;

pub use client::{FirestoreClient, ListenerRegistration};
pub use document_set::DocumentSet;
pub use engine::Engine;
pub use event_manager::{EventManager, ListenOptions, ListenSource, QueryListener, QueryObserver};
pub use query::{Bound, Direction, Filter, FieldFilter, LimitType, Operator, OrderBy, Query, Target};
pub use sync_engine::{SyncEngine, SyncEngineEvent, WriteReceiver};
pub use target_id_generator::TargetIdGenerator;
pub use types::OnlineState;
pub use view::{View, ViewChange};
pub use view_snapshot::{ChangeType, DocumentViewChange, ViewSnapshot};
