use crate::firestore::core::query::Target;
use crate::firestore::model::SnapshotVersion;

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetPurpose {
    Listen,
    /// Re-listen after an existence filter reported a different count.
    ExistenceFilterMismatch,
    /// Same as above, but a bloom filter was present and could not resolve it.
    ExistenceFilterMismatchBloom,
    LimboResolution,
}

/// Everything the local store tracks about one listened target.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: i32,
    pub purpose: TargetPurpose,
    pub sequence_number: i64,
    /// Version of the last consistent snapshot the backend sent for this target.
    pub snapshot_version: SnapshotVersion,
    /// Version at which every document in the target's view was known to be
    /// free of limbo. Queries may reuse previous results up to this version.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: Vec<u8>,
    /// Number of documents the client expects the backend to report on the
    /// next listen, sent so the backend can answer with an existence filter.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(target: Target, target_id: i32, purpose: TargetPurpose, sequence_number: i64) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(mut self, sequence_number: i64) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// Advances the token and version. Clears any expected count, since a
    /// new token makes the previous count meaningless.
    pub fn with_resume_token(mut self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self.expected_count = None;
        self
    }

    pub fn with_expected_count(mut self, expected_count: i32) -> Self {
        self.expected_count = Some(expected_count);
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }

    pub fn with_purpose(mut self, purpose: TargetPurpose) -> Self {
        self.purpose = purpose;
        self
    }
}
