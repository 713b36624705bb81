use std::collections::BTreeSet;

use crate::firestore::core::types::OnlineState;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion, User};
use crate::firestore::remote::remote_event::RemoteEvent;
use crate::firestore::remote::remote_store::RemoteStore;

/// Bridge between the remote store and the sync engine.
///
/// The remote store drives the streams and calls back into the syncer for
/// every event it has to apply locally. Callbacks that may start or stop
/// listens receive the remote store back so they can do so synchronously.
pub trait RemoteSyncer {
    /// Applies a consistent batch of watch changes.
    fn apply_remote_event(&mut self, remote: &mut RemoteStore, event: RemoteEvent) -> FirestoreResult<()>;

    /// The backend rejected the listen for `target_id`.
    fn reject_listen(&mut self, remote: &mut RemoteStore, target_id: i32, error: FirestoreError) -> FirestoreResult<()>;

    fn apply_successful_write(&mut self, remote: &mut RemoteStore, result: MutationBatchResult) -> FirestoreResult<()>;

    /// The backend rejected the batch with a permanent error.
    fn reject_failed_write(&mut self, remote: &mut RemoteStore, batch_id: i32, error: FirestoreError) -> FirestoreResult<()>;

    /// Keys the client believes match `target_id` on the backend.
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey>;

    /// First unacknowledged batch with an id above `after_batch_id`.
    fn next_mutation_batch(&mut self, after_batch_id: Option<i32>) -> FirestoreResult<Option<MutationBatch>>;

    fn get_last_remote_snapshot_version(&mut self) -> FirestoreResult<SnapshotVersion>;

    fn set_last_stream_token(&mut self, stream_token: Vec<u8>) -> FirestoreResult<()>;

    fn handle_online_state_change(&mut self, state: OnlineState);

    /// Switches local state to `user`. Called while the network is disabled.
    fn handle_credential_change(&mut self, remote: &mut RemoteStore, user: User) -> FirestoreResult<()>;
}
