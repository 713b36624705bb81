use crate::firestore::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, MapValue};

/// What the client knows about a document's existence.
#[derive(Clone, Debug, PartialEq)]
pub enum DocumentContents {
    /// Nothing is known; the cache has never seen this key.
    Invalid,
    Found {
        version: SnapshotVersion,
        create_time: SnapshotVersion,
        data: MapValue,
    },
    /// The document is known not to exist at `version`.
    NoDocument { version: SnapshotVersion },
    /// The document exists at `version` but its contents are unknown, which
    /// happens after a patch is acknowledged for a document we never read.
    Unknown { version: SnapshotVersion },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    key: DocumentKey,
    contents: DocumentContents,
    read_time: SnapshotVersion,
    state: DocumentState,
}

impl Document {
    pub fn new_invalid(key: DocumentKey) -> Self {
        Self {
            key,
            contents: DocumentContents::Invalid,
            read_time: SnapshotVersion::min(),
            state: DocumentState::Synced,
        }
    }

    pub fn new_found(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        let mut document = Self::new_invalid(key);
        document.convert_to_found(version, data);
        document
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid(key);
        document.convert_to_no_document(version);
        document
    }

    pub fn new_unknown(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid(key);
        document.convert_to_unknown(version);
        document
    }

    /// Turns this into a found document, keeping an existing create time.
    pub fn convert_to_found(&mut self, version: SnapshotVersion, data: MapValue) -> &mut Self {
        let create_time = match &self.contents {
            DocumentContents::Found { create_time, .. } if !create_time.is_min() => *create_time,
            _ => version,
        };
        self.contents = DocumentContents::Found {
            version,
            create_time,
            data,
        };
        self.state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.contents = DocumentContents::NoDocument { version };
        self.state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown(&mut self, version: SnapshotVersion) -> &mut Self {
        self.contents = DocumentContents::Unknown { version };
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.state = DocumentState::HasLocalMutations;
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn contents(&self) -> &DocumentContents {
        &self.contents
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn version(&self) -> SnapshotVersion {
        match &self.contents {
            DocumentContents::Invalid => SnapshotVersion::min(),
            DocumentContents::Found { version, .. }
            | DocumentContents::NoDocument { version }
            | DocumentContents::Unknown { version } => *version,
        }
    }

    pub fn create_time(&self) -> SnapshotVersion {
        match &self.contents {
            DocumentContents::Found { create_time, .. } => *create_time,
            _ => SnapshotVersion::min(),
        }
    }

    /// Document fields; empty for anything other than a found document.
    pub fn data(&self) -> MapValue {
        match &self.contents {
            DocumentContents::Found { data, .. } => data.clone(),
            _ => MapValue::empty(),
        }
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        match &self.contents {
            DocumentContents::Found { data, .. } => data.get(path),
            _ => None,
        }
    }

    pub fn is_valid_document(&self) -> bool {
        !matches!(self.contents, DocumentContents::Invalid)
    }

    pub fn is_found_document(&self) -> bool {
        matches!(self.contents, DocumentContents::Found { .. })
    }

    pub fn is_no_document(&self) -> bool {
        matches!(self.contents, DocumentContents::NoDocument { .. })
    }

    pub fn is_unknown_document(&self) -> bool {
        matches!(self.contents, DocumentContents::Unknown { .. })
    }

    pub fn has_local_mutations(&self) -> bool {
        self.state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;

    fn key() -> DocumentKey {
        DocumentKey::from_string("games/g1").unwrap()
    }

    #[test]
    fn invalid_documents_have_min_version() {
        let doc = Document::new_invalid(key());
        assert!(!doc.is_valid_document());
        assert!(doc.version().is_min());
        assert!(doc.data().is_empty());
    }

    #[test]
    fn conversions_reset_state() {
        let version = SnapshotVersion::new(Timestamp::new(5, 0));
        let mut doc = Document::new_found(key(), version, MapValue::empty());
        doc.set_has_local_mutations();
        assert!(doc.has_pending_writes());

        doc.convert_to_no_document(version);
        assert!(doc.is_no_document());
        assert!(!doc.has_pending_writes());

        doc.convert_to_unknown(version);
        assert!(doc.is_unknown_document());
        assert!(doc.has_committed_mutations());
    }

    #[test]
    fn keeps_create_time_across_updates() {
        let created = SnapshotVersion::new(Timestamp::new(1, 0));
        let updated = SnapshotVersion::new(Timestamp::new(2, 0));
        let mut doc = Document::new_found(key(), created, MapValue::empty());
        doc.convert_to_found(updated, MapValue::empty());
        assert_eq!(doc.create_time(), created);
        assert_eq!(doc.version(), updated);
    }
}
