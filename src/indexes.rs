//! The index manager contract.
//!
//! The local view only needs one facility from the index layer: the set of
//! parent paths under which a collection of a given name exists, to fan a
//! collection group query out into per-collection queries.

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;

use crate::path::ResourcePath;

/// Access to the collection parent index.
pub trait IndexManager: std::fmt::Debug {
    /// Every parent path containing a collection named `collection_id`,
    /// in path order.
    fn collection_parents(&mut self, collection_id: &str) -> Result<Vec<ResourcePath>>;
}

/// In-memory collection parent index.
#[derive(Debug, Clone, Default)]
pub struct MemoryIndexManager {
    parents: HashMap<String, BTreeSet<ResourcePath>>,
}

impl MemoryIndexManager {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the collection at `collection` exists.
    pub fn add_collection_parent(&mut self, collection: &ResourcePath) {
        let (Some(id), Some(parent)) = (collection.last(), collection.parent()) else {
            return;
        };
        self.parents.entry(id.to_owned()).or_default().insert(parent);
    }
}

impl IndexManager for MemoryIndexManager {
    fn collection_parents(&mut self, collection_id: &str) -> Result<Vec<ResourcePath>> {
        Ok(self
            .parents
            .get(collection_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}
