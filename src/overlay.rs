//! The overlay entity.

use crate::{
    mutation::{BatchId, Mutation},
    path::DocumentKey,
};

/// A saved mutation that, applied to the backend's version of its document,
/// produces the current local view.
///
/// `largest_batch_id` is the highest batch id among all batches contributing
/// to the overlay's effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlay {
    /// Highest contributing batch id.
    pub largest_batch_id: BatchId,
    /// The composed mutation.
    pub mutation: Mutation,
}

impl Overlay {
    /// Create an overlay.
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    /// The document this overlay applies to.
    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}
