use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, Timestamp, BATCH_ID_UNKNOWN};

/// Position in the remote document cache and mutation queue up to which a
/// query result has already been computed.
///
/// Offsets order by read time, then document key, then batch id. A `None`
/// key sorts before every document read at the same time.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexOffset {
    pub read_time: SnapshotVersion,
    pub document_key: Option<DocumentKey>,
    pub largest_batch_id: i32,
}

impl IndexOffset {
    pub fn new(read_time: SnapshotVersion, document_key: Option<DocumentKey>, largest_batch_id: i32) -> Self {
        Self {
            read_time,
            document_key,
            largest_batch_id,
        }
    }

    /// Offset that sorts before every document.
    pub fn none() -> Self {
        Self::new(SnapshotVersion::min(), None, BATCH_ID_UNKNOWN)
    }

    /// Offset for everything read strictly after `read_time`.
    pub fn create_successor(read_time: SnapshotVersion, largest_batch_id: i32) -> Self {
        let timestamp = read_time.timestamp();
        let successor = if timestamp.nanos + 1 == 1_000_000_000 {
            Timestamp::new(timestamp.seconds + 1, 0)
        } else {
            Timestamp::new(timestamp.seconds, timestamp.nanos + 1)
        };
        Self::new(SnapshotVersion::new(successor), None, largest_batch_id)
    }

    pub fn from_document(document: &Document) -> Self {
        Self::new(document.read_time(), Some(document.key().clone()), BATCH_ID_UNKNOWN)
    }
}
