//! Storage for document overlays.
//!
//! An overlay store keeps, per user and per document, the single mutation
//! that turns the backend's version of the document into the latest local
//! view, indexed for per-document, per-collection, per-collection-group and
//! per-batch access. Two interchangeable implementations exist: a process
//! local [`memory::Store`] and a persistent [`fs::Store`] backed by [`redb`].

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{
    mutation::{BatchId, Mutation},
    overlay::Overlay,
    path::{DocumentKey, ResourcePath},
};

pub mod fs;
pub mod memory;

/// Identifier of the user owning a set of overlays.
///
/// The empty string identifies the unauthenticated user. Every overlay store
/// operation is scoped to one user; different users' overlays never observe
/// each other.
#[derive(
    Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UserId(String);

impl UserId {
    /// Create a user id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The unauthenticated user.
    pub fn unauthenticated() -> Self {
        Self::default()
    }

    /// The id as a string. Empty for the unauthenticated user.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted overlay failed to decode.
///
/// This is an invariant break of the store, fatal to the reading operation;
/// there is no local recovery.
#[derive(Debug, thiserror::Error)]
#[error("corrupted overlay for {key}")]
pub struct CorruptedOverlay {
    /// Key of the offending overlay row.
    pub key: DocumentKey,
    /// The decode failure.
    #[source]
    pub source: postcard::Error,
}

/// Keyed store of [`Overlay`]s.
///
/// For every document key there is at most one overlay per user. Saving an
/// overlay for a key replaces the previous one and re-indexes the key under
/// the new batch id.
pub trait OverlayStore: std::fmt::Debug {
    /// The overlay for `key`, if any.
    fn get_overlay(&mut self, user: &UserId, key: &DocumentKey) -> Result<Option<Overlay>>;

    /// The overlays for all of `keys` that exist. Absent keys are simply
    /// missing from the result.
    fn get_overlays(
        &mut self,
        user: &UserId,
        keys: &BTreeSet<DocumentKey>,
    ) -> Result<BTreeMap<DocumentKey, Overlay>> {
        let mut result = BTreeMap::new();
        for key in keys {
            if let Some(overlay) = self.get_overlay(user, key)? {
                result.insert(key.clone(), overlay);
            }
        }
        Ok(result)
    }

    /// Install an overlay `(largest_batch_id, mutation)` for every entry,
    /// replacing any prior overlay for the same key.
    fn save_overlays(
        &mut self,
        user: &UserId,
        largest_batch_id: BatchId,
        overlays: BTreeMap<DocumentKey, Mutation>,
    ) -> Result<()>;

    /// Remove exactly those overlays whose largest batch id is `batch_id`.
    fn remove_overlays_for_batch_id(&mut self, user: &UserId, batch_id: BatchId) -> Result<()>;

    /// Every overlay for an immediate child document of `collection` from a
    /// batch after `since_batch_id`. Documents in sub-collections are not
    /// included.
    fn get_overlays_for_collection(
        &mut self,
        user: &UserId,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> Result<BTreeMap<DocumentKey, Overlay>>;

    /// Overlays for documents in collections named `collection_group`, from
    /// batches after `since_batch_id`, enumerated in ascending batch order.
    ///
    /// Batches are never split: enumeration only stops at a batch boundary
    /// once at least `count` overlays have been collected, so the result may
    /// exceed `count`.
    fn get_overlays_for_collection_group(
        &mut self,
        user: &UserId,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> Result<BTreeMap<DocumentKey, Overlay>>;
}
