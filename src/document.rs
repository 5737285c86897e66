//! Document values and the mutable document model.
//!
//! A document is a tree of [`Value`]s rooted at an [`ObjectValue`], addressed
//! by dotted [`FieldPath`]s. [`MutableDocument`] carries the document data
//! together with its existence state and version metadata, and is the unit
//! the mutation machinery operates on.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::path::DocumentKey;

/// Microseconds since the Unix epoch.
///
/// Used for document versions, read times and local write times.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The zero timestamp, smaller than every measured one.
    pub const ZERO: Self = Self(0);

    /// The current wall-clock time.
    pub fn now() -> Self {
        let micros = std::time::UNIX_EPOCH
            .elapsed()
            .map(|duration| duration.as_micros() as u64)
            .unwrap_or_default();
        Self(micros)
    }

    /// Construct from microseconds since the Unix epoch.
    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Microseconds since the Unix epoch.
    pub fn as_micros(&self) -> u64 {
        self.0
    }
}

/// A single field value.
///
/// Values are totally ordered: first by type, then within the type. Integers
/// and doubles share one numeric bracket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// The explicit null value.
    Null,
    /// A boolean.
    Boolean(bool),
    /// A 64-bit integer.
    Integer(i64),
    /// A 64-bit float, ordered by [`f64::total_cmp`].
    Double(f64),
    /// A UTF-8 string.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// An ordered list of values.
    Array(Vec<Value>),
    /// A map of named values, ordered by field name.
    Map(BTreeMap<String, Value>),
}

impl Value {
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) | Value::Double(_) => 2,
            Value::String(_) => 3,
            Value::Bytes(_) => 4,
            Value::Array(_) => 5,
            Value::Map(_) => 6,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (Double(a), Double(b)) => a.total_cmp(b),
            (Integer(a), Double(b)) => (*a as f64).total_cmp(b),
            (Double(a), Integer(b)) => a.total_cmp(&(*b as f64)),
            (String(a), String(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Array(a), Array(b)) => a.cmp(b),
            (Map(a), Map(b)) => a.iter().cmp(b.iter()),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

/// A dotted path addressing a field inside a document.
///
/// Never empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Create a field path from its segments.
    pub fn from_segments(segments: Vec<String>) -> Result<Self> {
        ensure!(!segments.is_empty(), "field paths must not be empty");
        Ok(Self(segments))
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The path segments.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// The path without its last segment, or `None` for a top-level field.
    pub fn pop_last(&self) -> Option<Self> {
        if self.0.len() < 2 {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// Whether `self` addresses `other` or one of its parents.
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl FromStr for FieldPath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_segments(s.split('.').map(ToOwned::to_owned).collect())
    }
}

/// A set of field paths, recording which fields a write touched.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMask(BTreeSet<FieldPath>);

impl FieldMask {
    /// The empty mask.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a mask from a set of paths.
    pub fn from_paths(paths: impl IntoIterator<Item = FieldPath>) -> Self {
        Self(paths.into_iter().collect())
    }

    /// Whether the mask contains no paths.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Add a path to the mask.
    pub fn insert(&mut self, path: FieldPath) {
        self.0.insert(path);
    }

    /// The union of both masks.
    pub fn union(mut self, other: &Self) -> Self {
        self.0.extend(other.0.iter().cloned());
        self
    }

    /// Whether `path` or one of its parents is in the mask.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.0.iter().any(|entry| entry.is_prefix_of(path))
    }

    /// Iterate the paths in order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldPath> {
        self.0.iter()
    }
}

/// A map-rooted document value supporting nested field access.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectValue {
    fields: BTreeMap<String, Value>,
}

impl ObjectValue {
    /// The empty object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an object from its top-level fields.
    pub fn from_fields(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }

    /// Whether the object has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The top-level fields.
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// Read the value at `path`, descending through nested maps.
    pub fn field(&self, path: &FieldPath) -> Option<&Value> {
        let (last, parents) = path.segments().split_last()?;
        let mut current = &self.fields;
        for segment in parents {
            match current.get(segment) {
                Some(Value::Map(map)) => current = map,
                _ => return None,
            }
        }
        current.get(last)
    }

    /// Set the value at `path`, creating intermediate maps as needed.
    ///
    /// A non-map value on the way is replaced by a map.
    pub fn set(&mut self, path: &FieldPath, value: Value) {
        let (last, parents) = path
            .segments()
            .split_last()
            .expect("field paths are never empty");
        let mut current = &mut self.fields;
        for segment in parents {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| Value::Map(BTreeMap::new()));
            if !matches!(entry, Value::Map(_)) {
                *entry = Value::Map(BTreeMap::new());
            }
            let Value::Map(map) = entry else { unreachable!() };
            current = map;
        }
        current.insert(last.clone(), value);
    }

    /// Remove the value at `path` if present. Intermediate maps are kept.
    pub fn delete(&mut self, path: &FieldPath) {
        let (last, parents) = path
            .segments()
            .split_last()
            .expect("field paths are never empty");
        let mut current = &mut self.fields;
        for segment in parents {
            match current.get_mut(segment) {
                Some(Value::Map(map)) => current = map,
                _ => return,
            }
        }
        current.remove(last);
    }

    /// Apply a batch of sets (`Some`) and deletes (`None`) in path order.
    pub fn set_all(&mut self, entries: BTreeMap<FieldPath, Option<Value>>) {
        for (path, value) in entries {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }
}

/// Existence state of a document.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DocumentType {
    /// Nothing is known about the document.
    #[default]
    Invalid,
    /// The document is known to exist with the carried data.
    Found,
    /// The document is known not to exist.
    NoDocument,
    /// The document is known to exist, but its data is unknown.
    Unknown,
}

/// Sync state of a document relative to the backend.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum DocumentState {
    /// No pending local writes.
    #[default]
    Synced,
    /// The document carries local writes the backend has not acknowledged.
    HasLocalMutations,
    /// The backend acknowledged the writes but has not streamed them back.
    HasCommittedMutations,
}

/// A document together with its existence and sync state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableDocument {
    key: DocumentKey,
    doc_type: DocumentType,
    version: Timestamp,
    read_time: Timestamp,
    data: ObjectValue,
    doc_state: DocumentState,
}

impl MutableDocument {
    /// A document about which nothing is known.
    pub fn invalid(key: DocumentKey) -> Self {
        Self {
            key,
            doc_type: DocumentType::Invalid,
            version: Timestamp::ZERO,
            read_time: Timestamp::ZERO,
            data: ObjectValue::new(),
            doc_state: DocumentState::Synced,
        }
    }

    /// A document that exists with the given data.
    pub fn found(key: DocumentKey, version: Timestamp, data: ObjectValue) -> Self {
        let mut doc = Self::invalid(key);
        doc.convert_to_found(version, data);
        doc
    }

    /// A document known not to exist.
    pub fn no_document(key: DocumentKey, version: Timestamp) -> Self {
        let mut doc = Self::invalid(key);
        doc.convert_to_no_document(version);
        doc
    }

    /// A document known to exist with unknown data.
    pub fn unknown_document(key: DocumentKey, version: Timestamp) -> Self {
        let mut doc = Self::invalid(key);
        doc.convert_to_unknown(version);
        doc
    }

    /// The document key.
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// The document version.
    pub fn version(&self) -> Timestamp {
        self.version
    }

    /// When this document was last read from the backend.
    pub fn read_time(&self) -> Timestamp {
        self.read_time
    }

    /// The document data. Empty unless the document is found.
    pub fn data(&self) -> &ObjectValue {
        &self.data
    }

    /// Whether the state of the document is known at all.
    pub fn is_valid_document(&self) -> bool {
        self.doc_type != DocumentType::Invalid
    }

    /// Whether the document is known to exist.
    pub fn is_found_document(&self) -> bool {
        self.doc_type == DocumentType::Found
    }

    /// Whether the document is known not to exist.
    pub fn is_no_document(&self) -> bool {
        self.doc_type == DocumentType::NoDocument
    }

    /// Whether the document is known to exist with unknown data.
    pub fn is_unknown_document(&self) -> bool {
        self.doc_type == DocumentType::Unknown
    }

    /// Whether the document carries unacknowledged local writes.
    pub fn has_local_mutations(&self) -> bool {
        self.doc_state == DocumentState::HasLocalMutations
    }

    /// Whether the document carries acknowledged but unsynced writes.
    pub fn has_committed_mutations(&self) -> bool {
        self.doc_state == DocumentState::HasCommittedMutations
    }

    /// Whether any pending write applies to this document.
    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }

    /// Turn this into a found document with the given version and data.
    pub fn convert_to_found(&mut self, version: Timestamp, data: ObjectValue) -> &mut Self {
        self.doc_type = DocumentType::Found;
        self.version = version;
        self.data = data;
        self.doc_state = DocumentState::Synced;
        self
    }

    /// Turn this into a document known not to exist.
    pub fn convert_to_no_document(&mut self, version: Timestamp) -> &mut Self {
        self.doc_type = DocumentType::NoDocument;
        self.version = version;
        self.data = ObjectValue::new();
        self.doc_state = DocumentState::Synced;
        self
    }

    /// Turn this into a document that exists with unknown data.
    pub fn convert_to_unknown(&mut self, version: Timestamp) -> &mut Self {
        self.doc_type = DocumentType::Unknown;
        self.version = version;
        self.data = ObjectValue::new();
        self.doc_state = DocumentState::HasCommittedMutations;
        self
    }

    /// Mark the document as carrying unacknowledged local writes.
    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.doc_state = DocumentState::HasLocalMutations;
        self.read_time = Timestamp::ZERO;
        self
    }

    /// Mark the document as carrying acknowledged but unsynced writes.
    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.doc_state = DocumentState::HasCommittedMutations;
        self
    }

    /// Record when the document was read from the backend.
    pub fn set_read_time(&mut self, read_time: Timestamp) -> &mut Self {
        self.read_time = read_time;
        self
    }
}
