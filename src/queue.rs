//! The mutation queue contract.
//!
//! The queue holds every mutation batch the user committed locally that the
//! backend has not acknowledged yet, ordered by batch id.

use std::collections::BTreeSet;

use anyhow::{ensure, Result};

use crate::{
    mutation::{BatchId, MutationBatch},
    path::DocumentKey,
};

/// Read access to the pending mutation batches.
pub trait MutationQueue: std::fmt::Debug {
    /// Every batch that writes to at least one of `keys`, ascending by batch
    /// id, each batch at most once.
    fn all_batches_affecting_keys(
        &mut self,
        keys: &BTreeSet<DocumentKey>,
    ) -> Result<Vec<MutationBatch>>;
}

/// In-memory mutation queue.
#[derive(Debug, Clone, Default)]
pub struct MemoryMutationQueue {
    /// Ascending by batch id.
    batches: Vec<MutationBatch>,
}

impl MemoryMutationQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch. Batch ids must arrive in increasing order.
    pub fn add_batch(&mut self, batch: MutationBatch) -> Result<()> {
        if let Some(last) = self.batches.last() {
            ensure!(
                batch.batch_id > last.batch_id,
                "batch id {} not after {}",
                batch.batch_id,
                last.batch_id
            );
        }
        self.batches.push(batch);
        Ok(())
    }

    /// Remove the batch with `batch_id`, returning it if present.
    pub fn remove_batch(&mut self, batch_id: BatchId) -> Option<MutationBatch> {
        let index = self
            .batches
            .iter()
            .position(|batch| batch.batch_id == batch_id)?;
        Some(self.batches.remove(index))
    }
}

impl MutationQueue for MemoryMutationQueue {
    fn all_batches_affecting_keys(
        &mut self,
        keys: &BTreeSet<DocumentKey>,
    ) -> Result<Vec<MutationBatch>> {
        Ok(self
            .batches
            .iter()
            .filter(|batch| batch.mutations.iter().any(|m| keys.contains(m.key())))
            .cloned()
            .collect())
    }
}
