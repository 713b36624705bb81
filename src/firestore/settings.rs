use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::DatabaseId;
use crate::util::backoff::BackoffSettings;

pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;
pub const DEFAULT_MAX_PENDING_WRITES: usize = 10;
pub const DEFAULT_ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// Tunables for one client instance.
///
/// Deserializes from camelCase JSON; missing fields keep their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncSettings {
    pub database_id: DatabaseId,
    /// Upper bound on limbo resolution targets listened to at once.
    pub max_concurrent_limbo_resolutions: usize,
    /// Upper bound on batches in flight on the write stream.
    pub max_pending_writes: usize,
    pub backoff: BackoffSettings,
    /// How long the first watch stream may take to connect before the client
    /// reports itself offline.
    pub online_state_timeout: Duration,
    /// Consecutive watch stream failures tolerated before going offline.
    pub max_watch_stream_failures: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            database_id: DatabaseId::default("(default)"),
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
            backoff: BackoffSettings::default(),
            online_state_timeout: DEFAULT_ONLINE_STATE_TIMEOUT,
            max_watch_stream_failures: DEFAULT_MAX_WATCH_STREAM_FAILURES,
        }
    }
}

impl SyncSettings {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            ..Self::default()
        }
    }

    /// Parses settings from a JSON document such as
    /// `{"maxPendingWrites": 5, "onlineStateTimeout": {"secs": 2, "nanos": 0}}`.
    pub fn from_json(json: &str) -> FirestoreResult<Self> {
        serde_json::from_str(json).map_err(|err| invalid_argument(format!("Invalid sync settings: {err}")))
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, value: usize) -> Self {
        self.max_concurrent_limbo_resolutions = value;
        self
    }

    pub fn with_max_pending_writes(mut self, value: usize) -> Self {
        self.max_pending_writes = value;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSettings) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_online_state_timeout(mut self, timeout: Duration) -> Self {
        self.online_state_timeout = timeout;
        self
    }

    pub fn with_max_watch_stream_failures(mut self, value: u32) -> Self {
        self.max_watch_stream_failures = value;
        self
    }
}
