//! # Path
//! A location in the shared keyspace. Paths are ordered segment by segment, so an ancestor always
//! sorts directly before its descendants, which lets range queries over a subtree use a plain
//! ordered-map range.

use std::fmt;
use std::str::FromStr;

#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Path {
    segments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path segment `{0}` contains a forbidden character")]
    ForbiddenCharacter(String),

    #[error("path `{0}` has an empty segment")]
    EmptySegment(String),
}

const FORBIDDEN: [char; 5] = ['.', '#', '$', '[', ']'];

fn validate_segment(segment: &str) -> Result<(), PathError> {
    if segment
        .chars()
        .any(|c| FORBIDDEN.contains(&c) || c.is_control())
    {
        return Err(PathError::ForbiddenCharacter(segment.to_string()));
    }
    Ok(())
}

impl Path {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses `/a/b/c`. Leading and trailing slashes are optional; `//` is rejected.
    pub fn parse(text: &str) -> Result<Self, PathError> {
        let trimmed = text.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }

        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(PathError::EmptySegment(text.to_string()));
            }
            validate_segment(segment)?;
            segments.push(segment.to_string());
        }
        Ok(Self { segments })
    }

    pub fn child(&self, segment: impl Into<String>) -> Result<Self, PathError> {
        let segment = segment.into();
        if segment.is_empty() {
            return Err(PathError::EmptySegment(format!("{self}/")));
        }
        validate_segment(&segment)?;
        let mut segments = self.segments.clone();
        segments.push(segment);
        Ok(Self { segments })
    }

    /// Appends every segment of `relative` (itself parsed as a path).
    pub fn join(&self, relative: &str) -> Result<Self, PathError> {
        let relative = Path::parse(relative)?;
        let mut segments = self.segments.clone();
        segments.extend(relative.segments);
        Ok(Self { segments })
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True when `self` is `other` or one of its ancestors.
    pub fn contains(&self, other: &Path) -> bool {
        other.segments.len() >= self.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// True when `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &Path) -> bool {
        self.segments.len() < other.segments.len() && self.contains(other)
    }

    /// The path itself followed by each ancestor up to and including the root.
    pub fn ancestors(&self) -> impl Iterator<Item = Path> + '_ {
        (0..=self.segments.len()).rev().map(|len| Path {
            segments: self.segments[..len].to_vec(),
        })
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Path::parse(s)
    }
}

impl TryFrom<String> for Path {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Path::parse(&value)
    }
}

impl From<Path> for String {
    fn from(path: Path) -> Self {
        path.to_string()
    }
}

impl serde::Serialize for Path {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Path {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let text = String::deserialize(deserializer)?;
        Path::parse(&text).map_err(D::Error::custom)
    }
}
