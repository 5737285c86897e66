//! In memory storage for overlays.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::{
    mutation::{BatchId, Mutation},
    overlay::Overlay,
    path::{DocumentKey, ResourcePath},
    store::{OverlayStore, UserId},
};

/// Manages the overlays of all users of an instance.
///
/// Cheap to clone; clones share the same state. Overlays die with the
/// process.
#[derive(Debug, Clone, Default)]
pub struct Store {
    users: Arc<RwLock<HashMap<UserId, UserOverlays>>>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

/// The overlays of one user: the forward map and the inverted index by
/// batch id, maintained in lockstep.
#[derive(Debug, Default)]
struct UserOverlays {
    overlays: BTreeMap<DocumentKey, Overlay>,
    by_batch_id: HashMap<BatchId, HashSet<DocumentKey>>,
}

impl UserOverlays {
    fn save_overlay(&mut self, largest_batch_id: BatchId, mutation: Mutation) {
        let key = mutation.key().clone();
        trace!(%key, largest_batch_id, "indexing overlay");
        if let Some(prev) = self.overlays.get(&key) {
            if let Some(bucket) = self.by_batch_id.get_mut(&prev.largest_batch_id) {
                bucket.remove(&key);
                if bucket.is_empty() {
                    self.by_batch_id.remove(&prev.largest_batch_id);
                }
            }
        }
        self.by_batch_id
            .entry(largest_batch_id)
            .or_default()
            .insert(key.clone());
        self.overlays
            .insert(key, Overlay::new(largest_batch_id, mutation));
    }
}

impl OverlayStore for Store {
    fn get_overlay(&mut self, user: &UserId, key: &DocumentKey) -> Result<Option<Overlay>> {
        let users = self.users.read();
        Ok(users
            .get(user)
            .and_then(|overlays| overlays.overlays.get(key))
            .cloned())
    }

    fn save_overlays(
        &mut self,
        user: &UserId,
        largest_batch_id: BatchId,
        overlays: BTreeMap<DocumentKey, Mutation>,
    ) -> Result<()> {
        let mut users = self.users.write();
        let user_overlays = users.entry(user.clone()).or_default();
        for (_key, mutation) in overlays {
            user_overlays.save_overlay(largest_batch_id, mutation);
        }
        Ok(())
    }

    fn remove_overlays_for_batch_id(&mut self, user: &UserId, batch_id: BatchId) -> Result<()> {
        let mut users = self.users.write();
        let Some(user_overlays) = users.get_mut(user) else {
            return Ok(());
        };
        if let Some(keys) = user_overlays.by_batch_id.remove(&batch_id) {
            debug!(batch_id, count = keys.len(), "removing overlays for batch");
            for key in keys {
                user_overlays.overlays.remove(&key);
            }
        }
        Ok(())
    }

    fn get_overlays_for_collection(
        &mut self,
        user: &UserId,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> Result<BTreeMap<DocumentKey, Overlay>> {
        let start = DocumentKey::from_path(collection.child(""))?;
        let users = self.users.read();
        let mut result = BTreeMap::new();
        let Some(user_overlays) = users.get(user) else {
            return Ok(result);
        };
        for (key, overlay) in user_overlays.overlays.range(start..) {
            if !collection.is_prefix_of(key.path()) {
                break;
            }
            // skip documents in sub-collections
            if key.path().len() != collection.len() + 1 {
                continue;
            }
            if overlay.largest_batch_id > since_batch_id {
                result.insert(key.clone(), overlay.clone());
            }
        }
        Ok(result)
    }

    fn get_overlays_for_collection_group(
        &mut self,
        user: &UserId,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> Result<BTreeMap<DocumentKey, Overlay>> {
        let users = self.users.read();
        let mut result = BTreeMap::new();
        let Some(user_overlays) = users.get(user) else {
            return Ok(result);
        };

        let mut buckets: BTreeMap<BatchId, BTreeMap<DocumentKey, Overlay>> = BTreeMap::new();
        for (key, overlay) in &user_overlays.overlays {
            if !key.has_collection_id(collection_group)
                || overlay.largest_batch_id <= since_batch_id
            {
                continue;
            }
            buckets
                .entry(overlay.largest_batch_id)
                .or_default()
                .insert(key.clone(), overlay.clone());
        }

        // drain whole batches until the count is reached; never split one
        for (_batch_id, bucket) in buckets {
            result.extend(bucket);
            if result.len() >= count {
                break;
            }
        }
        Ok(result)
    }
}
