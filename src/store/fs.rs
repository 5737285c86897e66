//! On disk storage for overlays.

use std::{collections::BTreeMap, path::Path};

use anyhow::{ensure, Context, Result};
use redb::{Database, ReadableMultimapTable, ReadableTable};
use tracing::{debug, trace};

use crate::{
    mutation::{BatchId, Mutation},
    overlay::Overlay,
    path::{DocumentKey, ResourcePath},
    store::{CorruptedOverlay, OverlayStore, UserId},
};

mod bounds;
pub(crate) mod tables;

use self::{
    bounds::{ByCollectionBounds, ByGroupBounds},
    tables::{OverlayRowId, OverlayRowValue, ReadOnlyTables, Tables, TransactionAndTables},
};

/// Manages the overlays of all users of an instance, backed by a [`redb`]
/// database.
///
/// Reads and writes share one open transaction: writes accumulate in a write
/// transaction that is committed by the next read or by [`Store::flush`].
#[derive(Debug)]
pub struct Store {
    db: Database,
    transaction: CurrentTransaction,
}

#[derive(derive_more::Debug, Default)]
enum CurrentTransaction {
    #[default]
    None,
    Read(ReadOnlyTables),
    Write(TransactionAndTables),
}

impl Store {
    /// Create a store backed by memory, for testing and ephemeral clients.
    pub fn memory() -> Result<Self> {
        debug!("opening in-memory overlay store");
        let db =
            Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::new_impl(db)
    }

    /// Create or open a store from a `path` to a database file.
    ///
    /// The file will be created if it does not exist, otherwise it will be
    /// opened.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        debug!("opening overlay store at {}", path.as_ref().display());
        let db = Database::create(path)?;
        Self::new_impl(db)
    }

    fn new_impl(db: Database) -> Result<Self> {
        // Setup all tables
        let write_tx = db.begin_write()?;
        let _ = Tables::new(&write_tx)?;
        write_tx.commit()?;

        Ok(Store {
            db,
            transaction: Default::default(),
        })
    }

    fn tables(&mut self) -> Result<&ReadOnlyTables> {
        let guard = &mut self.transaction;
        let tables = match std::mem::take(guard) {
            CurrentTransaction::None => {
                let tx = self.db.begin_read()?;
                ReadOnlyTables::new(tx)?
            }
            CurrentTransaction::Write(w) => {
                w.commit()?;
                let tx = self.db.begin_read()?;
                ReadOnlyTables::new(tx)?
            }
            CurrentTransaction::Read(tables) => tables,
        };
        *guard = CurrentTransaction::Read(tables);
        match &*guard {
            CurrentTransaction::Read(ref tables) => Ok(tables),
            _ => unreachable!(),
        }
    }

    fn modify<T>(&mut self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let guard = &mut self.transaction;
        let tables = match std::mem::take(guard) {
            CurrentTransaction::None | CurrentTransaction::Read(_) => {
                let tx = self.db.begin_write()?;
                TransactionAndTables::new(tx)?
            }
            CurrentTransaction::Write(w) => w,
        };
        *guard = CurrentTransaction::Write(tables);
        let res = match &mut *guard {
            CurrentTransaction::Write(ref mut tables) => tables.with_tables_mut(f)?,
            _ => unreachable!(),
        };
        Ok(res)
    }

    /// Commit the pending write transaction, if any.
    pub fn flush(&mut self) -> Result<()> {
        if let CurrentTransaction::Write(w) = std::mem::take(&mut self.transaction) {
            w.commit()?;
        }
        Ok(())
    }
}

impl OverlayStore for Store {
    fn get_overlay(&mut self, user: &UserId, key: &DocumentKey) -> Result<Option<Overlay>> {
        let tables = self.tables()?;
        get_overlay_in(&tables.overlays, user, key)
    }

    fn save_overlays(
        &mut self,
        user: &UserId,
        largest_batch_id: BatchId,
        overlays: BTreeMap<DocumentKey, Mutation>,
    ) -> Result<()> {
        self.modify(|tables| {
            for (_key, mutation) in &overlays {
                save_overlay(tables, user, largest_batch_id, mutation)?;
            }
            Ok(())
        })
    }

    fn remove_overlays_for_batch_id(&mut self, user: &UserId, batch_id: BatchId) -> Result<()> {
        self.modify(|tables| {
            let doc_paths = {
                let rows = tables.overlays_by_batch.get((user.as_str(), batch_id))?;
                rows.map(|row| row.map(|guard| guard.value().to_vec()))
                    .collect::<Result<Vec<_>, _>>()?
            };
            debug!(batch_id, count = doc_paths.len(), "removing overlays for batch");
            tables
                .overlays_by_batch
                .remove_all((user.as_str(), batch_id))?;
            for doc_path in doc_paths {
                let key = DocumentKey::from_index_bytes(&doc_path)?;
                let collection = key.collection_path().to_index_bytes();
                tables.overlays.remove((user.as_str(), doc_path.as_slice()))?;
                tables.overlays_by_collection.remove((
                    user.as_str(),
                    collection.as_slice(),
                    batch_id,
                    doc_path.as_slice(),
                ))?;
                tables.overlays_by_group.remove((
                    user.as_str(),
                    key.collection_group(),
                    batch_id,
                    doc_path.as_slice(),
                ))?;
            }
            Ok(())
        })
    }

    fn get_overlays_for_collection(
        &mut self,
        user: &UserId,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> Result<BTreeMap<DocumentKey, Overlay>> {
        let bounds = ByCollectionBounds::since_batch(user, collection, since_batch_id);
        let tables = self.tables()?;
        let mut result = BTreeMap::new();
        for row in tables.overlays_by_collection.range(bounds.as_ref())? {
            let (index_key, _) = row?;
            let (_user, _collection, _batch_id, doc_path) = index_key.value();
            let key = DocumentKey::from_index_bytes(doc_path)?;
            let overlay = get_overlay_in(&tables.overlays, user, &key)?
                .with_context(|| format!("no overlay row for indexed key {key}"))?;
            result.insert(key, overlay);
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
        let bounds = ByGroupBounds::since_batch(user, collection_group, since_batch_id);
        let tables = self.tables()?;
        let mut result = BTreeMap::new();
        let mut current_batch_id = None;
        for row in tables.overlays_by_group.range(bounds.as_ref())? {
            let (index_key, _) = row?;
            let (_user, _group, batch_id, doc_path) = index_key.value();
            // the index is ordered by batch id: stop at the first batch
            // boundary once enough overlays are collected
            if result.len() >= count && current_batch_id != Some(batch_id) {
                break;
            }
            let key = DocumentKey::from_index_bytes(doc_path)?;
            let overlay = get_overlay_in(&tables.overlays, user, &key)?
                .with_context(|| format!("no overlay row for indexed key {key}"))?;
            result.insert(key, overlay);
            current_batch_id = Some(batch_id);
        }
        Ok(result)
    }
}

fn save_overlay(
    tables: &mut Tables,
    user: &UserId,
    largest_batch_id: BatchId,
    mutation: &Mutation,
) -> Result<()> {
    let user_id = user.as_str();
    let key = mutation.key();
    let doc_path = key.to_index_bytes();
    let collection = key.collection_path().to_index_bytes();
    let bytes = postcard::to_stdvec(mutation)?;
    trace!(%key, largest_batch_id, "indexing overlay");

    let prev_batch_id = tables
        .overlays
        .insert(
            (user_id, doc_path.as_slice()),
            (largest_batch_id, bytes.as_slice()),
        )?
        .map(|row| row.value().0);

    // a superseded overlay must disappear from the buckets of its old batch
    // id before the new rows are indexed
    if let Some(prev) = prev_batch_id {
        tables
            .overlays_by_batch
            .remove((user_id, prev), doc_path.as_slice())?;
        tables.overlays_by_collection.remove((
            user_id,
            collection.as_slice(),
            prev,
            doc_path.as_slice(),
        ))?;
        tables.overlays_by_group.remove((
            user_id,
            key.collection_group(),
            prev,
            doc_path.as_slice(),
        ))?;
    }
    tables
        .overlays_by_batch
        .insert((user_id, largest_batch_id), doc_path.as_slice())?;
    tables.overlays_by_collection.insert(
        (
            user_id,
            collection.as_slice(),
            largest_batch_id,
            doc_path.as_slice(),
        ),
        (),
    )?;
    tables.overlays_by_group.insert(
        (
            user_id,
            key.collection_group(),
            largest_batch_id,
            doc_path.as_slice(),
        ),
        (),
    )?;
    Ok(())
}

fn get_overlay_in(
    overlays: &impl ReadableTable<OverlayRowId<'static>, OverlayRowValue<'static>>,
    user: &UserId,
    key: &DocumentKey,
) -> Result<Option<Overlay>> {
    let doc_path = key.to_index_bytes();
    let Some(row) = overlays.get((user.as_str(), doc_path.as_slice()))? else {
        return Ok(None);
    };
    let (largest_batch_id, bytes) = row.value();
    let mutation = decode_mutation(key, bytes)?;
    Ok(Some(Overlay::new(largest_batch_id, mutation)))
}

fn decode_mutation(key: &DocumentKey, bytes: &[u8]) -> Result<Mutation> {
    let mutation: Mutation =
        postcard::from_bytes(bytes).map_err(|source| CorruptedOverlay {
            key: key.clone(),
            source,
        })?;
    ensure!(
        mutation.key() == key,
        "overlay row for {key} stores a mutation for {}",
        mutation.key()
    );
    Ok(mutation)
}
