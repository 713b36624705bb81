use std::fmt;

use crate::firestore::error::{invalid_argument, FirestoreResult};

const KEY_FIELD_NAME: &str = "__name__";

/// Dotted path to a field inside a document. Ordered segment by segment,
/// with a shorter path sorting before any path it prefixes.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn new<I>(segments: I) -> FirestoreResult<Self>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        match segments.iter().position(String::is_empty) {
            _ if segments.is_empty() => Err(invalid_argument("Field path has no segments")),
            Some(index) => Err(invalid_argument(format!(
                "Field path segment {index} is empty"
            ))),
            None => Ok(Self(segments)),
        }
    }

    /// Parses `a.b.c`. Segments are not unescaped.
    pub fn from_dot_separated(path: &str) -> FirestoreResult<Self> {
        if path.trim().is_empty() {
            return Err(invalid_argument("Field path cannot be empty"));
        }
        Self::new(path.split('.')).map_err(|_| invalid_argument(format!("Invalid field path '{path}'")))
    }

    pub fn document_id() -> Self {
        Self(vec![KEY_FIELD_NAME.to_owned()])
    }

    pub fn is_key_field(&self) -> bool {
        matches!(self.0.as_slice(), [only] if only == KEY_FIELD_NAME)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// The enclosing field, `None` for a top-level field.
    pub fn pop_last(&self) -> Option<Self> {
        match self.0.split_last() {
            Some((_, parent)) if !parent.is_empty() => Some(Self(parent.to_vec())),
            _ => None,
        }
    }

    pub fn is_prefix_of(&self, other: &Self) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Segments joined by dots. Segments that are not plain identifiers are
    /// wrapped in backticks so distinct paths never share an id.
    pub fn canonical_string(&self) -> String {
        self.0
            .iter()
            .map(|segment| {
                if is_simple_segment(segment) {
                    segment.clone()
                } else {
                    format!("`{}`", segment.replace('\\', "\\\\").replace('`', "\\`"))
                }
            })
            .collect::<Vec<_>>()
            .join(".")
    }
}

fn is_simple_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;

    #[test]
    fn parses_dotted_paths() {
        let field = FieldPath::from_dot_separated("score.total").unwrap();
        assert_eq!(field.segments(), &["score", "total"]);
        assert_eq!(field.pop_last().unwrap().canonical_string(), "score");
        assert!(FieldPath::from_dot_separated("score").unwrap().pop_last().is_none());
    }

    #[test]
    fn empty_segments_are_invalid() {
        let err = FieldPath::from_dot_separated("").unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
        assert!(FieldPath::from_dot_separated("a..b").is_err());
        assert!(FieldPath::new(Vec::<String>::new()).is_err());
    }

    #[test]
    fn prefixes_sort_first() {
        let parent = FieldPath::from_dot_separated("a").unwrap();
        let child = FieldPath::from_dot_separated("a.b").unwrap();
        assert!(parent.is_prefix_of(&child));
        assert!(!child.is_prefix_of(&parent));
        assert!(parent < child);
        assert!(child < FieldPath::from_dot_separated("b").unwrap());
    }

    #[test]
    fn canonical_string_quotes_unusual_segments() {
        let field = FieldPath::new(["stats", "hit-rate"]).unwrap();
        assert_eq!(field.canonical_string(), "stats.`hit-rate`");
        assert!(FieldPath::document_id().is_key_field());
    }
}
