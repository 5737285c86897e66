//! Resource paths and document keys.
//!
//! A [`ResourcePath`] addresses a collection or a document as an ordered list
//! of segments. Collections have odd path length, documents even path length;
//! the immediate child documents of a collection therefore have a path that is
//! exactly one segment longer than the collection's.

use std::{fmt, str::FromStr};

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

/// Separator byte used by the order-preserving index encoding.
const SEPARATOR: u8 = 0x00;
/// Follows [`SEPARATOR`] to terminate a segment.
const TERMINATOR: u8 = 0x01;
/// Follows [`SEPARATOR`] to encode a literal `0x00` byte inside a segment.
const ESCAPED_NUL: u8 = 0xff;

/// A slash-separated path addressing a collection or a document.
///
/// Paths are totally ordered by component-wise comparison of their segments.
#[derive(
    Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    /// The empty root path.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a path from its segments.
    pub fn from_segments(segments: Vec<String>) -> Self {
        Self { segments }
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether this is the root path.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The path segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns a new path with `segment` appended.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Returns the path without its last segment, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// The last segment, or `None` for the root.
    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Whether every segment of `self` prefixes `other` in order.
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        other.segments.len() >= self.segments.len()
            && other.segments[..self.segments.len()] == self.segments[..]
    }

    /// Encode the path so that byte-wise comparison of encodings matches path
    /// order, and the encoding of a path is a byte prefix of the encodings of
    /// all of its descendants.
    ///
    /// Each segment is written with interior `0x00` bytes escaped and is
    /// closed with a two-byte terminator.
    pub fn to_index_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.segments.iter().map(|s| s.len() + 2).sum());
        for segment in &self.segments {
            for &byte in segment.as_bytes() {
                if byte == SEPARATOR {
                    out.push(SEPARATOR);
                    out.push(ESCAPED_NUL);
                } else {
                    out.push(byte);
                }
            }
            out.push(SEPARATOR);
            out.push(TERMINATOR);
        }
        out
    }

    /// Decode a path previously encoded with [`Self::to_index_bytes`].
    pub fn from_index_bytes(bytes: &[u8]) -> Result<Self> {
        let mut segments = Vec::new();
        let mut current = Vec::new();
        let mut iter = bytes.iter();
        while let Some(&byte) = iter.next() {
            if byte != SEPARATOR {
                current.push(byte);
                continue;
            }
            match iter.next() {
                Some(&TERMINATOR) => {
                    segments.push(String::from_utf8(std::mem::take(&mut current))?);
                }
                Some(&ESCAPED_NUL) => current.push(SEPARATOR),
                other => bail!("invalid escape {other:?} in encoded path"),
            }
        }
        ensure!(current.is_empty(), "trailing bytes in encoded path");
        Ok(Self { segments })
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl FromStr for ResourcePath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let segments = s
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(ToOwned::to_owned)
            .collect();
        Ok(Self { segments })
    }
}

/// Canonical path of a document.
///
/// Wraps a [`ResourcePath`] of even, non-zero length. Ordered by path order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentKey(ResourcePath);

impl DocumentKey {
    /// Create a key from a document path.
    ///
    /// Fails unless the path has document shape, see
    /// [`Self::is_document_path`].
    pub fn from_path(path: ResourcePath) -> Result<Self> {
        ensure!(
            Self::is_document_path(&path),
            "not a document path: {path}"
        );
        Ok(Self(path))
    }

    /// Whether `path` addresses a document rather than a collection.
    pub fn is_document_path(path: &ResourcePath) -> bool {
        !path.is_empty() && path.len() % 2 == 0
    }

    /// The underlying path.
    pub fn path(&self) -> &ResourcePath {
        &self.0
    }

    /// The name of the collection this document lives in directly.
    pub fn collection_group(&self) -> &str {
        &self.0.segments[self.0.segments.len() - 2]
    }

    /// Path of the collection this document lives in directly.
    pub fn collection_path(&self) -> ResourcePath {
        self.0.parent().expect("document paths are never empty")
    }

    /// The last path segment.
    pub fn document_id(&self) -> &str {
        self.0.last().expect("document paths are never empty")
    }

    /// Whether the document lives directly in a collection named `id`.
    pub fn has_collection_id(&self, id: &str) -> bool {
        self.collection_group() == id
    }

    /// Encode the document path for use as an index key.
    pub fn to_index_bytes(&self) -> Vec<u8> {
        self.0.to_index_bytes()
    }

    /// Decode a key previously encoded with [`Self::to_index_bytes`].
    pub fn from_index_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_path(ResourcePath::from_index_bytes(bytes)?)
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DocumentKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_path(s.parse()?)
    }
}
