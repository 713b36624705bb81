use std::fmt::{Display, Formatter};
use std::ops::Deref;

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Slash-separated path to a collection or document.
///
/// Ordering is segment by segment, a prefix sorting before its extensions,
/// which is the order documents are kept in by every cache.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Parses `path`, ignoring leading and trailing slashes. An empty string
    /// is the root.
    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        let trimmed = path.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        if trimmed.split('/').any(str::is_empty) {
            return Err(invalid_argument(format!("Invalid path ({path}): found empty segment")));
        }
        Ok(Self::from_segments(trimmed.split('/')))
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }

    pub fn child<I, S>(&self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut path = self.clone();
        path.segments.extend(segments.into_iter().map(Into::into));
        path
    }

    /// Parent path; the root is its own parent.
    pub fn without_last(&self) -> Self {
        let keep = self.segments.len().saturating_sub(1);
        Self::from_segments(self.segments[..keep].iter().cloned())
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// True when `other` is exactly one segment below this path, i.e. a
    /// document directly inside this collection.
    pub fn is_immediate_parent_of(&self, other: &Self) -> bool {
        self.segments.len() + 1 == other.segments.len() && self.is_prefix_of(other)
    }
}

impl Display for ResourcePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

impl Deref for ResourcePath {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.segments
    }
}
