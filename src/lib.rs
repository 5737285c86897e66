//! Local overlay cache and local documents view for an offline-first
//! document database client.
//!
//! The client keeps a durable cache of the backend's documents plus a queue
//! of pending local mutations. This crate combines the two into the *local
//! view*: the documents an application observes, as if every pending
//! mutation had already been acknowledged by the backend.
//!
//! The central entity is the [`Overlay`]: per document, the single mutation
//! that turns the backend's version into the latest local view. Overlays are
//! kept in an [overlay store](store::OverlayStore) indexed for per-document,
//! per-collection, per-collection-group and per-mutation-batch access. Two
//! implementations of the store exist: [`store::memory::Store`] keeps
//! overlays in process memory, [`store::fs::Store`] persists them in a
//! [`redb`] database, scoped per user.
//!
//! [`local::LocalDocumentsView`] is the read-side coordinator. It reads base
//! documents from the [remote document cache](remote::RemoteDocumentCache),
//! layers overlays on top, and recomputes overlays from the
//! [mutation queue](queue::MutationQueue) when a remote change invalidates
//! them, which happens when a document's existence state flips underneath a
//! patch mutation's precondition.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod document;
pub mod indexes;
pub mod local;
pub mod mutation;
pub mod overlay;
pub mod path;
pub mod query;
pub mod queue;
pub mod remote;
pub mod store;

pub use self::{
    document::{FieldMask, FieldPath, MutableDocument, ObjectValue, Timestamp, Value},
    local::LocalDocumentsView,
    mutation::{BatchId, Mutation, MutationBatch, Precondition},
    overlay::Overlay,
    path::{DocumentKey, ResourcePath},
    query::{Query, QueryOffset},
    store::{OverlayStore, UserId},
};
