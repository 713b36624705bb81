use crate::firestore::core::query::Target;
use crate::firestore::error::FirestoreError;
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::credentials::AuthToken;
use crate::firestore::remote::watch_change::WatchChange;
use crate::util::async_queue::TimerId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Watch,
    Write,
}

impl StreamKind {
    pub fn backoff_timer(&self) -> TimerId {
        match self {
            StreamKind::Watch => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        }
    }

    pub fn idle_timer(&self) -> TimerId {
        match self {
            StreamKind::Watch => TimerId::ListenStreamIdle,
            StreamKind::Write => TimerId::WriteStreamIdle,
        }
    }
}

/// Where the backend should resume a target from.
#[derive(Clone, Debug, PartialEq)]
pub enum ResumeFrom {
    Start,
    Token(Vec<u8>),
    ReadTime(SnapshotVersion),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ListenRequest {
    pub target_id: i32,
    pub target: Target,
    pub resume_from: ResumeFrom,
    /// Number of documents the client holds for a resumed target, so the
    /// backend can send an existence filter when it differs.
    pub expected_count: Option<i32>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WatchRequest {
    AddTarget(ListenRequest),
    RemoveTarget(i32),
}

#[derive(Clone, Debug, PartialEq)]
pub enum WriteRequest {
    /// First message on a write stream; answered with a stream token.
    Handshake,
    Mutations {
        stream_token: Vec<u8>,
        mutations: Vec<Mutation>,
    },
}

/// Response to the oldest batch in flight on the write stream.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
}

/// Inbound events of the watch stream, decoded by the transport.
#[derive(Clone, Debug)]
pub enum WatchStreamEvent {
    Open,
    Change(WatchChange),
    Close(FirestoreError),
}

/// Inbound events of the write stream, decoded by the transport.
#[derive(Clone, Debug)]
pub enum WriteStreamEvent {
    Open,
    HandshakeComplete { stream_token: Vec<u8> },
    Response(WriteResponse),
    Close(FirestoreError),
}

/// Outbound half of the transport.
///
/// Calls only enqueue work; their outcome comes back later as
/// [`WatchStreamEvent`]s and [`WriteStreamEvent`]s.
pub trait Connection: Send {
    fn open(&mut self, stream: StreamKind, token: Option<&AuthToken>);

    fn send_watch(&mut self, request: WatchRequest);

    fn send_write(&mut self, request: WriteRequest);

    /// Tears the stream down without reporting a close event.
    fn close(&mut self, stream: StreamKind);
}
