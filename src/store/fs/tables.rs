//! Table definitions and table accessors for the overlay store.

use bytes::Bytes;
use redb::{
    CommitError, MultimapTable, MultimapTableDefinition, ReadOnlyMultimapTable, ReadOnlyTable,
    ReadTransaction, Table, TableDefinition, TableError, WriteTransaction,
};

/// Row key of the overlays table: `(user id, encoded document path)`.
pub type OverlayRowId<'a> = (&'a str, &'a [u8]);
/// Row value of the overlays table: `(largest batch id, mutation bytes)`.
pub type OverlayRowValue<'a> = (i64, &'a [u8]);

/// Row key of the by-batch index: `(user id, batch id)`, mapping to the
/// encoded document paths of the overlays saved under that batch id.
pub type ByBatchId<'a> = (&'a str, i64);

/// Row key of the by-collection index:
/// `(user id, encoded collection path, batch id, encoded document path)`.
pub type ByCollectionId<'a> = (&'a str, &'a [u8], i64, &'a [u8]);
/// Owned variant of [`ByCollectionId`], for range bounds.
pub type ByCollectionIdOwned = (String, Bytes, i64, Bytes);

/// Row key of the by-collection-group index:
/// `(user id, collection group, batch id, encoded document path)`.
pub type ByGroupId<'a> = (&'a str, &'a str, i64, &'a [u8]);
/// Owned variant of [`ByGroupId`], for range bounds.
pub type ByGroupIdOwned = (String, String, i64, Bytes);

pub const OVERLAYS_TABLE: TableDefinition<OverlayRowId<'static>, OverlayRowValue<'static>> =
    TableDefinition::new("overlays-1");

pub const OVERLAYS_BY_BATCH_TABLE: MultimapTableDefinition<ByBatchId<'static>, &'static [u8]> =
    MultimapTableDefinition::new("overlays-by-batch-1");

pub const OVERLAYS_BY_COLLECTION_TABLE: TableDefinition<ByCollectionId<'static>, ()> =
    TableDefinition::new("overlays-by-collection-1");

pub const OVERLAYS_BY_GROUP_TABLE: TableDefinition<ByGroupId<'static>, ()> =
    TableDefinition::new("overlays-by-collection-group-1");

/// The write tables of the store.
#[derive(derive_more::Debug)]
pub struct Tables<'tx> {
    pub overlays: Table<'tx, OverlayRowId<'static>, OverlayRowValue<'static>>,
    #[debug("MultimapTable")]
    pub overlays_by_batch: MultimapTable<'tx, ByBatchId<'static>, &'static [u8]>,
    pub overlays_by_collection: Table<'tx, ByCollectionId<'static>, ()>,
    pub overlays_by_group: Table<'tx, ByGroupId<'static>, ()>,
}

impl<'tx> Tables<'tx> {
    pub fn new(tx: &'tx WriteTransaction) -> Result<Self, TableError> {
        Ok(Self {
            overlays: tx.open_table(OVERLAYS_TABLE)?,
            overlays_by_batch: tx.open_multimap_table(OVERLAYS_BY_BATCH_TABLE)?,
            overlays_by_collection: tx.open_table(OVERLAYS_BY_COLLECTION_TABLE)?,
            overlays_by_group: tx.open_table(OVERLAYS_BY_GROUP_TABLE)?,
        })
    }
}

/// The read-only tables of the store, bound to one read transaction.
#[derive(derive_more::Debug)]
pub struct ReadOnlyTables {
    pub overlays: ReadOnlyTable<OverlayRowId<'static>, OverlayRowValue<'static>>,
    #[debug("ReadOnlyMultimapTable")]
    pub overlays_by_batch: ReadOnlyMultimapTable<ByBatchId<'static>, &'static [u8]>,
    pub overlays_by_collection: ReadOnlyTable<ByCollectionId<'static>, ()>,
    pub overlays_by_group: ReadOnlyTable<ByGroupId<'static>, ()>,
}

impl ReadOnlyTables {
    pub fn new(tx: ReadTransaction) -> Result<Self, TableError> {
        Ok(Self {
            overlays: tx.open_table(OVERLAYS_TABLE)?,
            overlays_by_batch: tx.open_multimap_table(OVERLAYS_BY_BATCH_TABLE)?,
            overlays_by_collection: tx.open_table(OVERLAYS_BY_COLLECTION_TABLE)?,
            overlays_by_group: tx.open_table(OVERLAYS_BY_GROUP_TABLE)?,
        })
    }
}

/// A write transaction and its open tables, stored together.
#[derive(derive_more::Debug)]
#[debug("TransactionAndTables")]
pub struct TransactionAndTables {
    inner: TransactionAndTablesInner,
}

#[ouroboros::self_referencing]
struct TransactionAndTablesInner {
    tx: WriteTransaction,
    #[borrows(tx)]
    #[covariant]
    tables: Tables<'this>,
}

impl TransactionAndTables {
    pub fn new(tx: WriteTransaction) -> Result<Self, TableError> {
        Ok(Self {
            inner: TransactionAndTablesInnerTryBuilder {
                tx,
                tables_builder: |tx| Tables::new(tx),
            }
            .try_build()?,
        })
    }

    pub fn with_tables_mut<T>(
        &mut self,
        f: impl FnOnce(&mut Tables) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        self.inner.with_tables_mut(f)
    }

    pub fn commit(self) -> Result<(), CommitError> {
        self.inner.into_heads().tx.commit()
    }
}
