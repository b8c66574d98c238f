//! Dotted field paths for flattened extraction results.
//!
//! Every extracted value is addressed by a path that alternates field names
//! with occurrence indices, e.g. `course.sections.2.time`. The match count
//! of a field is stored at the field's own path (`course.sections`), its
//! occurrences below it (`course.sections.0`, `course.sections.1`, ...).

use std::fmt;

/// Represents a path to a field in a flattened record
///
/// # Examples
///
/// - `name` - a top-level field (holds its match count)
/// - `name.0` - first occurrence of `name`
/// - `sections.2.time.0` - first `time` of the third section
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FieldPath {
    /// The raw path string
    pub raw: String,
    /// Parsed path segments
    pub segments: Vec<PathSegment>,
}

/// A segment in a field path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// A named field (e.g., "sections", "time")
    Field(String),
    /// An occurrence index (e.g., 0, 5)
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Field(name) => write!(f, "{}", name),
            PathSegment::Index(index) => write!(f, "{}", index),
        }
    }
}

impl FieldPath {
    /// The empty path, parent of every top-level field.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a field path with a given delimiter
    ///
    /// Purely numeric segments (and bracketed ones like `[3]`) are indices.
    ///
    /// # Example
    ///
    /// ```
    /// use course_scraper::extraction::{FieldPath, PathSegment};
    ///
    /// let path = FieldPath::parse("sections.2.time", ".");
    /// assert_eq!(path.segments[1], PathSegment::Index(2));
    /// ```
    pub fn parse(path: &str, delimiter: &str) -> Self {
        let segments: Vec<PathSegment> = path
            .split(delimiter)
            .filter(|s| !s.is_empty())
            .map(|s| {
                let digits = s
                    .strip_prefix('[')
                    .and_then(|inner| inner.strip_suffix(']'))
                    .unwrap_or(s);
                if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(index) = digits.parse::<usize>() {
                        return PathSegment::Index(index);
                    }
                }
                PathSegment::Field(s.to_string())
            })
            .collect();

        Self::from_segments(segments)
    }

    /// Create a field path from a dotted string (common format)
    pub fn from_dotted(path: &str) -> Self {
        Self::parse(path, ".")
    }

    pub fn from_segments(segments: Vec<PathSegment>) -> Self {
        let raw = segments
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".");
        Self { raw, segments }
    }

    /// Path of a named field below this one.
    pub fn child(&self, name: &str) -> Self {
        self.extend(PathSegment::Field(name.to_string()))
    }

    /// Path of the `index`-th occurrence of this field.
    pub fn index(&self, index: usize) -> Self {
        self.extend(PathSegment::Index(index))
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn extend(&self, segment: PathSegment) -> Self {
        let raw = if self.raw.is_empty() {
            segment.to_string()
        } else {
            format!("{}.{}", self.raw, segment)
        };
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self { raw, segments }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self::from_dotted(path)
    }
}

/// Trait for types that can look values up by field path
///
/// Implemented by flattened group records so consumers can read values
/// without knowing the map layout.
pub trait Extractor {
    /// Extract a value at the given field path
    ///
    /// Returns `Some(value)` if the path exists, `None` otherwise
    fn extract(&self, path: &FieldPath) -> Option<String>;

    /// Extract a value and parse it to a specific type
    fn extract_as<T>(&self, path: &FieldPath) -> Option<T>
    where
        T: std::str::FromStr,
    {
        self.extract(path).and_then(|s| s.parse().ok())
    }

    /// Number of matches recorded for a field (0 when absent)
    fn count(&self, path: &FieldPath) -> usize {
        self.extract_as::<usize>(path).unwrap_or(0)
    }

    /// Every occurrence value of a leaf field, in index order
    fn occurrences(&self, path: &FieldPath) -> Vec<String> {
        (0..self.count(path))
            .filter_map(|i| self.extract(&path.index(i)))
            .collect()
    }

    /// First occurrence of a leaf field
    fn first_occurrence(&self, path: &FieldPath) -> Option<String> {
        self.extract(&path.index(0))
    }
}

impl Extractor for std::collections::BTreeMap<String, String> {
    fn extract(&self, path: &FieldPath) -> Option<String> {
        self.get(path.as_str()).cloned()
    }
}

impl Extractor for std::collections::HashMap<String, String> {
    fn extract(&self, path: &FieldPath) -> Option<String> {
        self.get(path.as_str()).cloned()
    }
}

impl Extractor for indexmap::IndexMap<String, String> {
    fn extract(&self, path: &FieldPath) -> Option<String> {
        self.get(path.as_str()).cloned()
    }
}
