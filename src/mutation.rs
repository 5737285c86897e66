//! Mutations and mutation batches.
//!
//! A [`Mutation`] describes a single pending local write. Applied to the
//! backend's version of a document it produces the local view. Batches group
//! the mutations of one user commit under a [`BatchId`]; the queue assigns
//! batch ids in strictly increasing order.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    document::{FieldMask, FieldPath, MutableDocument, ObjectValue, Timestamp, Value},
    path::DocumentKey,
};

/// Identifier of a mutation batch. Strictly increasing; higher means newer.
///
/// `-1` denotes "before any batch" in range queries.
pub type BatchId = i64;

/// A condition a [`Mutation::Patch`] requires of its base document.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precondition {
    /// No requirement.
    #[default]
    None,
    /// The document must (or must not) exist.
    Exists(bool),
}

impl Precondition {
    /// Whether the precondition holds for `doc`.
    pub fn is_valid_for(&self, doc: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == doc.is_found_document(),
        }
    }
}

/// A single pending write against one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Replace the document wholesale.
    Set {
        /// Target document.
        key: DocumentKey,
        /// The full new document data.
        value: ObjectValue,
    },
    /// Update a set of fields, leaving the rest of the document alone.
    ///
    /// Only applies when `precondition` holds against the base document;
    /// otherwise the document is left untouched.
    Patch {
        /// Target document.
        key: DocumentKey,
        /// Values for the masked fields. Fields in `mask` but absent here
        /// are deleted from the document.
        data: ObjectValue,
        /// The fields this patch touches.
        mask: FieldMask,
        /// Condition on the base document.
        precondition: Precondition,
    },
    /// Delete the document.
    Delete {
        /// Target document.
        key: DocumentKey,
    },
}

impl Mutation {
    /// The document this mutation targets.
    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. } => key,
            Mutation::Patch { key, .. } => key,
            Mutation::Delete { key } => key,
        }
    }

    /// Whether this is a patch mutation.
    ///
    /// Patches are the only variant whose effect depends on the base
    /// document, so callers reading a base for a non-patch mutation can skip
    /// the backend read entirely.
    pub fn is_patch(&self) -> bool {
        matches!(self, Mutation::Patch { .. })
    }

    /// Apply this mutation to `doc`, producing the local view.
    ///
    /// `previous_mask` accumulates the fields written by earlier mutations in
    /// a batch sequence; `None` means the whole document was rewritten. The
    /// returned mask carries the same meaning after this mutation.
    pub fn apply_to_local_view(
        &self,
        doc: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        _local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        match self {
            Mutation::Set { value, .. } => {
                doc.convert_to_found(doc.version(), value.clone())
                    .set_has_local_mutations();
                None
            }
            Mutation::Delete { .. } => {
                doc.convert_to_no_document(doc.version())
                    .set_has_local_mutations();
                None
            }
            Mutation::Patch {
                data,
                mask,
                precondition,
                ..
            } => {
                if !precondition.is_valid_for(doc) {
                    return previous_mask;
                }
                let mut new_data = doc.data().clone();
                new_data.set_all(self.patch_entries(data, mask));
                doc.convert_to_found(doc.version(), new_data)
                    .set_has_local_mutations();
                previous_mask.map(|previous| previous.union(mask))
            }
        }
    }

    fn patch_entries(
        &self,
        data: &ObjectValue,
        mask: &FieldMask,
    ) -> BTreeMap<FieldPath, Option<Value>> {
        mask.iter()
            .map(|path| (path.clone(), data.field(path).cloned()))
            .collect()
    }
}

/// The mutations of one user commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationBatch {
    /// Identifier assigned by the mutation queue.
    pub batch_id: BatchId,
    /// When the user issued the commit.
    pub local_write_time: Timestamp,
    /// The writes, in commit order.
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    /// Create a batch.
    pub fn new(batch_id: BatchId, local_write_time: Timestamp, mutations: Vec<Mutation>) -> Self {
        Self {
            batch_id,
            local_write_time,
            mutations,
        }
    }

    /// The set of documents this batch writes to.
    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations.iter().map(|m| m.key().clone()).collect()
    }

    /// Apply every mutation of this batch targeting `doc` to it, threading
    /// the accumulated field mask through.
    pub fn apply_to_local_view_with_field_mask(
        &self,
        doc: &mut MutableDocument,
        mut mask: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in &self.mutations {
            if mutation.key() == doc.key() {
                mask = mutation.apply_to_local_view(doc, mask, self.local_write_time);
            }
        }
        mask
    }
}

/// Derive the single mutation that reproduces the composed local effect on
/// `doc`, given the mask of fields the batch sequence wrote.
///
/// Returns `None` when there is nothing to overlay: the document carries no
/// local mutations, or the mask is present but empty.
///
/// With no mask the whole document was rewritten, so the overlay is a
/// [`Mutation::Delete`] for documents that no longer exist and a
/// [`Mutation::Set`] of the full data otherwise. With a mask the overlay is a
/// [`Mutation::Patch`] of exactly the masked fields. A masked leaf that was
/// deleted underneath an implicitly created parent falls back to overlaying
/// the parent field, so the parent map survives in the patched view.
pub fn calculate_overlay_mutation(
    doc: &MutableDocument,
    mask: Option<&FieldMask>,
) -> Option<Mutation> {
    if !doc.has_local_mutations() {
        return None;
    }
    let Some(mask) = mask else {
        return Some(if doc.is_no_document() {
            Mutation::Delete {
                key: doc.key().clone(),
            }
        } else {
            Mutation::Set {
                key: doc.key().clone(),
                value: doc.data().clone(),
            }
        });
    };
    if mask.is_empty() {
        return None;
    }
    let mut patch_data = ObjectValue::new();
    let mut patch_mask = FieldMask::empty();
    for path in mask.iter() {
        let mut path = path.clone();
        let mut value = doc.data().field(&path).cloned();
        if value.is_none() {
            // A deleted nested leaf: overlay the immediate parent instead,
            // so parents implicitly created by earlier mutations survive.
            if let Some(parent) = path.pop_last() {
                path = parent;
                value = doc.data().field(&path).cloned();
            }
        }
        if patch_mask.covers(&path) {
            continue;
        }
        if let Some(value) = value {
            patch_data.set(&path, value);
        }
        patch_mask.insert(path);
    }
    Some(Mutation::Patch {
        key: doc.key().clone(),
        data: patch_data,
        mask: patch_mask,
        precondition: Precondition::None,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn key(s: &str) -> DocumentKey {
        s.parse().unwrap()
    }

    fn fp(s: &str) -> FieldPath {
        s.parse().unwrap()
    }

    fn obj(fields: &[(&str, Value)]) -> ObjectValue {
        let mut value = ObjectValue::new();
        for (path, v) in fields {
            value.set(&fp(path), v.clone());
        }
        value
    }

    fn found(s: &str, fields: &[(&str, Value)]) -> MutableDocument {
        MutableDocument::found(key(s), Timestamp::from_micros(1), obj(fields))
    }

    #[test]
    fn set_replaces_document() {
        let mut doc = found("users/alice", &[("age", Value::Integer(30))]);
        let mutation = Mutation::Set {
            key: key("users/alice"),
            value: obj(&[("age", Value::Integer(31))]),
        };
        let mask = mutation.apply_to_local_view(
            &mut doc,
            Some(FieldMask::empty()),
            Timestamp::now(),
        );
        assert_eq!(mask, None);
        assert!(doc.has_local_mutations());
        assert_eq!(doc.data().field(&fp("age")), Some(&Value::Integer(31)));
    }

    #[test]
    fn delete_removes_document() {
        let mut doc = found("users/alice", &[("age", Value::Integer(30))]);
        let mutation = Mutation::Delete {
            key: key("users/alice"),
        };
        let mask = mutation.apply_to_local_view(&mut doc, None, Timestamp::now());
        assert_eq!(mask, None);
        assert!(doc.is_no_document());
        assert!(doc.has_local_mutations());
    }

    #[test]
    fn patch_applies_when_precondition_holds() {
        let mut doc = found("users/bob", &[("name", Value::String("Bob".into()))]);
        let mutation = Mutation::Patch {
            key: key("users/bob"),
            data: obj(&[("city", Value::String("LA".into()))]),
            mask: FieldMask::from_paths([fp("city")]),
            precondition: Precondition::Exists(true),
        };
        let mask = mutation.apply_to_local_view(
            &mut doc,
            Some(FieldMask::empty()),
            Timestamp::now(),
        );
        assert_eq!(mask, Some(FieldMask::from_paths([fp("city")])));
        assert_eq!(
            doc.data().field(&fp("name")),
            Some(&Value::String("Bob".into()))
        );
        assert_eq!(
            doc.data().field(&fp("city")),
            Some(&Value::String("LA".into()))
        );
    }

    #[test]
    fn patch_skipped_when_precondition_fails() {
        let mut doc = MutableDocument::invalid(key("users/bob"));
        let mutation = Mutation::Patch {
            key: key("users/bob"),
            data: obj(&[("city", Value::String("LA".into()))]),
            mask: FieldMask::from_paths([fp("city")]),
            precondition: Precondition::Exists(true),
        };
        let mask = mutation.apply_to_local_view(
            &mut doc,
            Some(FieldMask::empty()),
            Timestamp::now(),
        );
        // mask passes through untouched and the document stays invalid
        assert_eq!(mask, Some(FieldMask::empty()));
        assert!(!doc.is_valid_document());
        assert!(!doc.has_local_mutations());
    }

    #[test]
    fn patch_mask_deletes_unlisted_fields() {
        let mut doc = found("users/bob", &[("a", Value::Integer(1))]);
        let mutation = Mutation::Patch {
            key: key("users/bob"),
            data: ObjectValue::new(),
            mask: FieldMask::from_paths([fp("a")]),
            precondition: Precondition::None,
        };
        mutation.apply_to_local_view(&mut doc, None, Timestamp::now());
        assert_eq!(doc.data().field(&fp("a")), None);
    }

    #[test]
    fn batch_threads_mask_through_mutations() {
        let mut doc = found("users/bob", &[("a", Value::Integer(1))]);
        let batch = MutationBatch::new(
            3,
            Timestamp::now(),
            vec![
                Mutation::Patch {
                    key: key("users/bob"),
                    data: obj(&[("b", Value::Integer(2))]),
                    mask: FieldMask::from_paths([fp("b")]),
                    precondition: Precondition::None,
                },
                Mutation::Patch {
                    key: key("users/bob"),
                    data: obj(&[("c", Value::Integer(3))]),
                    mask: FieldMask::from_paths([fp("c")]),
                    precondition: Precondition::None,
                },
                // different key, must not touch this document
                Mutation::Delete {
                    key: key("users/eve"),
                },
            ],
        );
        let mask = batch.apply_to_local_view_with_field_mask(&mut doc, Some(FieldMask::empty()));
        assert_eq!(mask, Some(FieldMask::from_paths([fp("b"), fp("c")])));
        assert_eq!(doc.data().field(&fp("a")), Some(&Value::Integer(1)));
        assert_eq!(doc.data().field(&fp("c")), Some(&Value::Integer(3)));
    }

    #[test]
    fn batch_set_collapses_mask() {
        let mut doc = found("users/bob", &[]);
        let batch = MutationBatch::new(
            4,
            Timestamp::now(),
            vec![
                Mutation::Patch {
                    key: key("users/bob"),
                    data: obj(&[("b", Value::Integer(2))]),
                    mask: FieldMask::from_paths([fp("b")]),
                    precondition: Precondition::None,
                },
                Mutation::Set {
                    key: key("users/bob"),
                    value: obj(&[("x", Value::Integer(9))]),
                },
            ],
        );
        let mask = batch.apply_to_local_view_with_field_mask(&mut doc, Some(FieldMask::empty()));
        assert_eq!(mask, None);
        assert_eq!(doc.data().field(&fp("b")), None);
        assert_eq!(doc.data().field(&fp("x")), Some(&Value::Integer(9)));
    }

    #[test]
    fn overlay_mutation_without_local_changes() {
        let doc = found("users/alice", &[("age", Value::Integer(30))]);
        assert_eq!(calculate_overlay_mutation(&doc, None), None);
    }

    #[test]
    fn overlay_mutation_whole_document() {
        let mut doc = found("users/alice", &[("age", Value::Integer(31))]);
        doc.set_has_local_mutations();
        let mutation = calculate_overlay_mutation(&doc, None).unwrap();
        assert_eq!(
            mutation,
            Mutation::Set {
                key: key("users/alice"),
                value: obj(&[("age", Value::Integer(31))]),
            }
        );

        let mut gone = MutableDocument::no_document(key("users/alice"), Timestamp::ZERO);
        gone.set_has_local_mutations();
        assert_eq!(
            calculate_overlay_mutation(&gone, None),
            Some(Mutation::Delete {
                key: key("users/alice")
            })
        );
    }

    #[test]
    fn overlay_mutation_empty_mask() {
        let mut doc = found("users/alice", &[]);
        doc.set_has_local_mutations();
        assert_eq!(
            calculate_overlay_mutation(&doc, Some(&FieldMask::empty())),
            None
        );
    }

    #[test]
    fn overlay_mutation_masked_patch() {
        let mut doc = found(
            "users/alice",
            &[("age", Value::Integer(31)), ("city", Value::String("NYC".into()))],
        );
        doc.set_has_local_mutations();
        let mask = FieldMask::from_paths([fp("age"), fp("gone")]);
        let Some(Mutation::Patch {
            data,
            mask: patch_mask,
            precondition,
            ..
        }) = calculate_overlay_mutation(&doc, Some(&mask))
        else {
            panic!("expected a patch overlay");
        };
        assert_eq!(precondition, Precondition::None);
        assert_eq!(data.field(&fp("age")), Some(&Value::Integer(31)));
        // "gone" has no value: the patch records the deletion via the mask
        assert_eq!(data.field(&fp("gone")), None);
        assert_eq!(patch_mask, FieldMask::from_paths([fp("age"), fp("gone")]));
    }

    #[test]
    fn overlay_mutation_deleted_nested_leaf_overlays_parent() {
        // mutation 1 sets a.b, mutation 2 deletes it again: the composed doc
        // keeps an empty map at `a`, and the overlay must reproduce it
        let mut doc = found("users/alice", &[]);
        let now = Timestamp::now();
        Mutation::Patch {
            key: key("users/alice"),
            data: obj(&[("a.b", Value::Integer(1))]),
            mask: FieldMask::from_paths([fp("a.b")]),
            precondition: Precondition::None,
        }
        .apply_to_local_view(&mut doc, Some(FieldMask::empty()), now);
        let mask = Mutation::Patch {
            key: key("users/alice"),
            data: ObjectValue::new(),
            mask: FieldMask::from_paths([fp("a.b")]),
            precondition: Precondition::None,
        }
        .apply_to_local_view(&mut doc, Some(FieldMask::empty()), now);

        let Some(Mutation::Patch {
            data, mask: patch_mask, ..
        }) = calculate_overlay_mutation(&doc, mask.as_ref())
        else {
            panic!("expected a patch overlay");
        };
        assert_eq!(patch_mask, FieldMask::from_paths([fp("a")]));
        assert_eq!(data.field(&fp("a")), Some(&Value::Map(BTreeMap::new())));
    }
}
