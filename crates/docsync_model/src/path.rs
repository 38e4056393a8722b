//! Resource and field paths.

use crate::error::{ModelError, ModelResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the pseudo-field that refers to a document's key.
pub(crate) const KEY_FIELD_NAME: &str = "__name__";

/// A slash-separated path to a collection or a document.
///
/// Paths compare segment by segment, so `items/a` sorts before `items/a/sub/x`
/// and both sort before `items/b`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    /// Returns the empty (root) path.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a path from a slash-separated string, ignoring empty segments.
    #[must_use]
    pub fn new(path: &str) -> Self {
        Self {
            segments: path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Builds a path from a slash-separated string, rejecting empty segments.
    pub fn parse(path: &str) -> ModelResult<Self> {
        if path.contains("//") {
            return Err(ModelError::invalid_path(path, "contains an empty segment"));
        }
        Ok(Self::new(path))
    }

    /// Builds a path from individual segments.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the segments of this path.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns the number of segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns true for the root path.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns a new path with `segment` appended.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Returns a new path with every segment of `other` appended.
    #[must_use]
    pub fn append(&self, other: &ResourcePath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// Returns this path without its last segment.
    #[must_use]
    pub fn pop_last(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    /// Returns the last segment, if any.
    #[must_use]
    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Returns the segment at `index`, if any.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }

    /// Returns true if this path is a prefix of (or equal to) `other`.
    #[must_use]
    pub fn is_prefix_of(&self, other: &ResourcePath) -> bool {
        self.len() <= other.len() && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// Returns true if `other` is exactly one segment longer than this path
    /// and this path is its prefix.
    #[must_use]
    pub fn is_immediate_parent_of(&self, other: &ResourcePath) -> bool {
        self.len() + 1 == other.len() && self.is_prefix_of(other)
    }

    /// Returns the slash-joined form of this path.
    #[must_use]
    pub fn canonical_string(&self) -> String {
        self.segments.join("/")
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

/// A dot-separated path to a field inside a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Builds a field path by splitting on `.`.
    #[must_use]
    pub fn new(path: &str) -> Self {
        if path.is_empty() {
            return Self::default();
        }
        Self {
            segments: path.split('.').map(str::to_string).collect(),
        }
    }

    /// Builds a field path, rejecting empty segments.
    pub fn parse(path: &str) -> ModelResult<Self> {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(ModelError::invalid_path(
                path,
                "field paths must be non-empty and must not contain empty segments",
            ));
        }
        Ok(Self::new(path))
    }

    /// Builds a field path from segments.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// The path that refers to the document key.
    #[must_use]
    pub fn key_field() -> Self {
        Self {
            segments: vec![KEY_FIELD_NAME.to_string()],
        }
    }

    /// Returns true if this path refers to the document key.
    #[must_use]
    pub fn is_key_field(&self) -> bool {
        self.segments.len() == 1 && self.segments[0] == KEY_FIELD_NAME
    }

    /// Returns the segments of this path.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns the number of segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns true if this path has no segments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns this path without its last segment.
    #[must_use]
    pub fn pop_last(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    /// Returns a new path with `segment` appended.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Returns true if this path is a prefix of (or equal to) `other`.
    #[must_use]
    pub fn is_prefix_of(&self, other: &FieldPath) -> bool {
        self.len() <= other.len() && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// Returns the dot-joined form of this path.
    #[must_use]
    pub fn canonical_string(&self) -> String {
        self.segments.join(".")
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_string())
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_path_ignores_empty_segments() {
        let path = ResourcePath::new("/items/a/");
        assert_eq!(path.len(), 2);
        assert_eq!(path.canonical_string(), "items/a");
    }

    #[test]
    fn resource_path_parse_rejects_double_slash() {
        assert!(ResourcePath::parse("items//a").is_err());
        assert!(ResourcePath::parse("items/a").is_ok());
    }

    #[test]
    fn resource_path_ordering_is_segment_wise() {
        let a = ResourcePath::new("items/a");
        let nested = ResourcePath::new("items/a/sub/x");
        let b = ResourcePath::new("items/b");
        assert!(a < nested);
        assert!(nested < b);
    }

    #[test]
    fn immediate_parent() {
        let collection = ResourcePath::new("items");
        assert!(collection.is_immediate_parent_of(&ResourcePath::new("items/a")));
        assert!(!collection.is_immediate_parent_of(&ResourcePath::new("items/a/sub/x")));
        assert!(collection.is_prefix_of(&ResourcePath::new("items/a/sub/x")));
    }

    #[test]
    fn field_path_key_field() {
        assert!(FieldPath::key_field().is_key_field());
        assert!(!FieldPath::new("qty").is_key_field());
        assert_eq!(FieldPath::new("a.b.c").len(), 3);
    }

    #[test]
    fn field_path_parse_validation() {
        assert!(FieldPath::parse("").is_err());
        assert!(FieldPath::parse("a..b").is_err());
        assert_eq!(FieldPath::parse("a.b").unwrap().canonical_string(), "a.b");
    }
}
