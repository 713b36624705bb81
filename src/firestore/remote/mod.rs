//! Network side of the engine: the watch and write streams, the aggregation
//! of watch changes into remote events, and the online state derived from
//! stream health.

pub mod bloom_filter;
pub mod connection;
pub mod credentials;
pub mod online_state_tracker;
pub mod persistent_stream;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::BloomFilter;
pub use connection::{
    Connection, ListenRequest, ResumeFrom, StreamKind, WatchRequest, WatchStreamEvent, WriteRequest, WriteResponse,
    WriteStreamEvent,
};
pub use credentials::{AuthToken, CredentialsProvider, EmptyCredentialsProvider, StaticCredentialsProvider};
pub use online_state_tracker::OnlineStateTracker;
pub use persistent_stream::{PersistentStream, RemoteScheduler, StreamState, TokenRequest};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{OfflineCause, RemoteStore};
pub use remote_syncer::RemoteSyncer;
pub use watch_change::{
    BloomFilterPayload, DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange, TargetChangeState,
    WatchChange, WatchTargetChange,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
