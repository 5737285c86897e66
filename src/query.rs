//! Query shapes and matching.
//!
//! Only the primitives the local view needs: a query targets a single
//! document, a collection, or a collection group, optionally narrowed by
//! field filters. Ordering, cursors and limits live in the public query API
//! outside this crate.

use serde::{Deserialize, Serialize};

use crate::{
    document::{FieldPath, MutableDocument, Timestamp, Value},
    mutation::BatchId,
    path::{DocumentKey, ResourcePath},
};

/// Comparison operator of a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
}

/// A single field comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// The field to compare.
    pub field: FieldPath,
    /// The comparison operator.
    pub op: FilterOp,
    /// The value to compare against.
    pub value: Value,
}

impl Filter {
    /// Create a filter.
    pub fn new(field: FieldPath, op: FilterOp, value: Value) -> Self {
        Self { field, op, value }
    }

    /// Whether `doc` passes this filter. Documents missing the field never
    /// match.
    pub fn matches(&self, doc: &MutableDocument) -> bool {
        let Some(value) = doc.data().field(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => value == &self.value,
            FilterOp::Ne => value != &self.value,
            FilterOp::Lt => value < &self.value,
            FilterOp::Le => value <= &self.value,
            FilterOp::Gt => value > &self.value,
            FilterOp::Ge => value >= &self.value,
        }
    }
}

/// A query against a document, a collection, or a collection group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// The path the query is rooted at. A document path for point queries, a
    /// collection path otherwise. Empty for collection group queries.
    pub path: ResourcePath,
    /// Set for collection group queries: match all collections of this name.
    pub collection_group: Option<String>,
    /// Conjunctive field filters.
    pub filters: Vec<Filter>,
}

impl Query {
    /// A query for the immediate child documents of `path`.
    pub fn collection(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
        }
    }

    /// A point query for a single document.
    pub fn doc(key: DocumentKey) -> Self {
        Self {
            path: key.path().clone(),
            collection_group: None,
            filters: Vec::new(),
        }
    }

    /// A query across every collection named `group`.
    pub fn collection_group(group: impl Into<String>) -> Self {
        Self {
            path: ResourcePath::empty(),
            collection_group: Some(group.into()),
            filters: Vec::new(),
        }
    }

    /// Add a field filter.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Whether this query targets a single document.
    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_path(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    /// Whether this query targets a collection group.
    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// The same query rooted at a concrete collection `path` instead of the
    /// collection group.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: self.filters.clone(),
        }
    }

    /// Whether `doc` is in the query's result set.
    pub fn matches(&self, doc: &MutableDocument) -> bool {
        doc.is_found_document()
            && self.matches_path(doc.key())
            && self.filters.iter().all(|filter| filter.matches(doc))
    }

    fn matches_path(&self, key: &DocumentKey) -> bool {
        if let Some(group) = &self.collection_group {
            key.has_collection_id(group) && self.path.is_prefix_of(key.path())
        } else if DocumentKey::is_document_path(&self.path) {
            key.path() == &self.path
        } else {
            // collection query: immediate children only
            self.path.is_prefix_of(key.path()) && key.path().len() == self.path.len() + 1
        }
    }
}

/// Resume point for an indexed read.
///
/// Remote documents are read starting after `read_time`; overlays starting
/// after `largest_batch_id`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOffset {
    /// Read documents changed after this time.
    pub read_time: Timestamp,
    /// Read overlays from batches after this one.
    pub largest_batch_id: BatchId,
}

impl QueryOffset {
    /// The offset before all data: read everything.
    pub const NONE: Self = Self {
        read_time: Timestamp::ZERO,
        largest_batch_id: -1,
    };

    /// Create an offset.
    pub fn new(read_time: Timestamp, largest_batch_id: BatchId) -> Self {
        Self {
            read_time,
            largest_batch_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::document::{ObjectValue, Timestamp};

    use super::*;

    fn found(path: &str, fields: &[(&str, Value)]) -> MutableDocument {
        let mut data = ObjectValue::new();
        for (p, v) in fields {
            data.set(&p.parse().unwrap(), v.clone());
        }
        MutableDocument::found(path.parse().unwrap(), Timestamp::from_micros(1), data)
    }

    #[test]
    fn collection_query_matches_immediate_children_only() {
        let query = Query::collection("rooms".parse().unwrap());
        assert!(query.matches(&found("rooms/r1", &[])));
        assert!(!query.matches(&found("rooms/r1/messages/m1", &[])));
        assert!(!query.matches(&found("users/alice", &[])));
    }

    #[test]
    fn document_query_matches_exactly() {
        let query = Query::doc("rooms/r1".parse().unwrap());
        assert!(query.is_document_query());
        assert!(query.matches(&found("rooms/r1", &[])));
        assert!(!query.matches(&found("rooms/r2", &[])));
    }

    #[test]
    fn collection_group_query_matches_across_parents() {
        let query = Query::collection_group("messages");
        assert!(query.is_collection_group_query());
        assert!(query.matches(&found("rooms/r1/messages/m1", &[])));
        assert!(query.matches(&found("archives/a2/messages/m9", &[])));
        assert!(!query.matches(&found("rooms/r1", &[])));
    }

    #[test]
    fn filters_narrow_matches() {
        let query = Query::collection("users".parse().unwrap()).with_filter(Filter::new(
            "age".parse().unwrap(),
            FilterOp::Ge,
            Value::Integer(21),
        ));
        assert!(query.matches(&found("users/alice", &[("age", Value::Integer(30))])));
        assert!(!query.matches(&found("users/bob", &[("age", Value::Integer(20))])));
        // missing field never matches
        assert!(!query.matches(&found("users/carol", &[])));
    }

    #[test]
    fn unfound_documents_never_match() {
        let query = Query::collection("users".parse().unwrap());
        let doc = MutableDocument::invalid("users/alice".parse().unwrap());
        assert!(!query.matches(&doc));
    }
}
