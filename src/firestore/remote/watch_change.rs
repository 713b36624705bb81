use crate::firestore::error::FirestoreError;
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion};

/// One decoded frame of the watch stream.
#[derive(Debug, Clone)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentChange),
    DocumentDelete(DocumentDelete),
    DocumentRemove(DocumentRemove),
    ExistenceFilter(ExistenceFilterChange),
}

impl WatchChange {
    /// The global snapshot version carried by this frame, or `min()` when it
    /// does not mark a consistent snapshot.
    ///
    /// Only a target change without target ids and with a read time means
    /// every target is consistent up to that time.
    pub fn snapshot_version(&self) -> SnapshotVersion {
        match self {
            WatchChange::TargetChange(change) if change.target_ids.is_empty() => {
                change.read_time.unwrap_or_else(SnapshotVersion::min)
            }
            _ => SnapshotVersion::min(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means the change applies to every target.
    pub target_ids: Vec<i32>,
    pub resume_token: Vec<u8>,
    pub read_time: Option<SnapshotVersion>,
    /// Set for a removal caused by an error.
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: TargetChangeState, target_ids: Vec<i32>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            read_time: None,
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Vec<u8>) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_read_time(mut self, read_time: SnapshotVersion) -> Self {
        self.read_time = Some(read_time);
        self
    }

    pub fn with_cause(mut self, cause: FirestoreError) -> Self {
        self.cause = Some(cause);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

/// A document entered, changed in, or left the listed targets.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub updated_target_ids: Vec<i32>,
    pub removed_target_ids: Vec<i32>,
    pub key: DocumentKey,
    pub document: Option<Document>,
}

/// The document was deleted at `read_time`.
#[derive(Debug, Clone)]
pub struct DocumentDelete {
    pub key: DocumentKey,
    pub read_time: Option<SnapshotVersion>,
    pub removed_target_ids: Vec<i32>,
}

/// The document no longer matches the listed targets. Its contents are not
/// known to have changed.
#[derive(Debug, Clone)]
pub struct DocumentRemove {
    pub key: DocumentKey,
    pub read_time: Option<SnapshotVersion>,
    pub removed_target_ids: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilterPayload {
    pub bitmap: Vec<u8>,
    pub padding: i32,
    pub hash_count: i32,
}

#[derive(Debug, Clone)]
pub struct ExistenceFilterChange {
    pub target_id: i32,
    pub count: i32,
    /// Names of the documents that still match, when the backend sent them.
    pub unchanged_names: Option<BloomFilterPayload>,
}

/// The shape every document frame is reduced to before aggregation.
#[derive(Debug, Clone)]
pub(crate) struct DocumentWatchChange {
    pub updated_target_ids: Vec<i32>,
    pub removed_target_ids: Vec<i32>,
    pub key: DocumentKey,
    /// Found document, a `NoDocument` for deletes, or `None` when only the
    /// target membership changed.
    pub new_document: Option<Document>,
}

impl From<DocumentChange> for DocumentWatchChange {
    fn from(change: DocumentChange) -> Self {
        Self {
            updated_target_ids: change.updated_target_ids,
            removed_target_ids: change.removed_target_ids,
            key: change.key,
            new_document: change.document,
        }
    }
}

impl From<DocumentDelete> for DocumentWatchChange {
    fn from(delete: DocumentDelete) -> Self {
        let version = delete.read_time.unwrap_or_else(SnapshotVersion::min);
        Self {
            updated_target_ids: Vec::new(),
            removed_target_ids: delete.removed_target_ids,
            new_document: Some(Document::new_no_document(delete.key.clone(), version)),
            key: delete.key,
        }
    }
}

impl From<DocumentRemove> for DocumentWatchChange {
    fn from(remove: DocumentRemove) -> Self {
        Self {
            updated_target_ids: Vec::new(),
            removed_target_ids: remove.removed_target_ids,
            key: remove.key,
            new_document: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;
    use crate::firestore::test_support::{key, version};

    #[test]
    fn only_global_target_changes_carry_snapshot_versions() {
        let global = WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::NoChange, Vec::new()).with_read_time(version(4)),
        );
        assert_eq!(global.snapshot_version(), version(4));

        let scoped = WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Current, vec![2]).with_read_time(version(4)),
        );
        assert!(scoped.snapshot_version().is_min());

        let errored = WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Remove, vec![2]).with_cause(unavailable("gone")),
        );
        assert!(errored.snapshot_version().is_min());
    }

    #[test]
    fn deletes_become_missing_documents() {
        let change: DocumentWatchChange = DocumentDelete {
            key: key("rooms/a"),
            read_time: Some(version(3)),
            removed_target_ids: vec![2],
        }
        .into();
        let document = change.new_document.unwrap();
        assert!(document.is_no_document());
        assert_eq!(document.version(), version(3));
        assert_eq!(change.removed_target_ids, vec![2]);
    }
}
