//! The remote document cache contract.
//!
//! The remote document cache stores the backend's view of documents as of
//! the last sync. This crate only consumes it; the memory implementation
//! here backs embedders without a persistent cache, and the tests.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use crate::{
    document::{MutableDocument, Timestamp},
    path::DocumentKey,
    query::Query,
};

/// Read access to the cached backend state of documents.
pub trait RemoteDocumentCache: std::fmt::Debug {
    /// The cached document for `key`. Absent keys yield the invalid sentinel
    /// document.
    fn get(&mut self, key: &DocumentKey) -> Result<MutableDocument>;

    /// The cached documents for all of `keys`, with invalid sentinels for
    /// absent ones.
    fn get_all(
        &mut self,
        keys: &BTreeSet<DocumentKey>,
    ) -> Result<BTreeMap<DocumentKey, MutableDocument>>;

    /// All cached documents matching `query` whose read time is after
    /// `since_read_time`.
    fn get_matching(
        &mut self,
        query: &Query,
        since_read_time: Timestamp,
    ) -> Result<BTreeMap<DocumentKey, MutableDocument>>;
}

/// In-memory remote document cache.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemoteDocumentCache {
    docs: BTreeMap<DocumentKey, MutableDocument>,
}

impl MemoryRemoteDocumentCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `doc` as the backend state, read at `read_time`.
    pub fn add(&mut self, mut doc: MutableDocument, read_time: Timestamp) {
        doc.set_read_time(read_time);
        self.docs.insert(doc.key().clone(), doc);
    }

    /// Drop the cached state for `key`.
    pub fn remove(&mut self, key: &DocumentKey) {
        self.docs.remove(key);
    }
}

impl RemoteDocumentCache for MemoryRemoteDocumentCache {
    fn get(&mut self, key: &DocumentKey) -> Result<MutableDocument> {
        Ok(self
            .docs
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::invalid(key.clone())))
    }

    fn get_all(
        &mut self,
        keys: &BTreeSet<DocumentKey>,
    ) -> Result<BTreeMap<DocumentKey, MutableDocument>> {
        keys.iter()
            .map(|key| Ok((key.clone(), self.get(key)?)))
            .collect()
    }

    fn get_matching(
        &mut self,
        query: &Query,
        since_read_time: Timestamp,
    ) -> Result<BTreeMap<DocumentKey, MutableDocument>> {
        let start = DocumentKey::from_path(query.path.child(""))?;
        let mut result = BTreeMap::new();
        for (key, doc) in self.docs.range(start..) {
            if !query.path.is_prefix_of(key.path()) {
                break;
            }
            if doc.read_time() <= since_read_time {
                continue;
            }
            if query.matches(doc) {
                result.insert(key.clone(), doc.clone());
            }
        }
        Ok(result)
    }
}
