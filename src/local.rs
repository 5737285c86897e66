//! The local view of documents.
//!
//! [`LocalDocumentsView`] merges the remote document cache, the mutation
//! queue and the overlay store into the view applications observe: documents
//! as if every pending local mutation had already been acknowledged by the
//! backend. It also repairs overlays when remote changes invalidate them,
//! which happens when a document's existence state flips under a patch
//! mutation's precondition.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use tracing::{debug, trace};

use crate::{
    document::{FieldMask, MutableDocument, Timestamp},
    indexes::IndexManager,
    mutation::{calculate_overlay_mutation, BatchId, Mutation},
    overlay::Overlay,
    path::DocumentKey,
    query::{Query, QueryOffset},
    queue::MutationQueue,
    remote::RemoteDocumentCache,
    store::{OverlayStore, UserId},
};

/// Computes local document views for one user.
#[derive(Debug)]
pub struct LocalDocumentsView<R, M, O, I> {
    remote_documents: R,
    mutation_queue: M,
    overlays: O,
    indexes: I,
    user: UserId,
}

impl<R, M, O, I> LocalDocumentsView<R, M, O, I>
where
    R: RemoteDocumentCache,
    M: MutationQueue,
    O: OverlayStore,
    I: IndexManager,
{
    /// Create a view over the given collaborators, serving `user`.
    pub fn new(
        remote_documents: R,
        mutation_queue: M,
        overlays: O,
        indexes: I,
        user: UserId,
    ) -> Self {
        Self {
            remote_documents,
            mutation_queue,
            overlays,
            indexes,
            user,
        }
    }

    /// The user this view serves.
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// The remote document cache.
    pub fn remote_documents_mut(&mut self) -> &mut R {
        &mut self.remote_documents
    }

    /// The mutation queue.
    pub fn mutation_queue_mut(&mut self) -> &mut M {
        &mut self.mutation_queue
    }

    /// The overlay store.
    pub fn overlays_mut(&mut self) -> &mut O {
        &mut self.overlays
    }

    /// The index manager.
    pub fn indexes_mut(&mut self) -> &mut I {
        &mut self.indexes
    }

    /// The local view of the document at `key`.
    ///
    /// For a non-patch overlay the backend state is irrelevant, so the remote
    /// read is skipped and the overlay is applied to a fresh invalid
    /// document.
    pub fn get_document(&mut self, key: &DocumentKey) -> Result<MutableDocument> {
        let overlay = self.overlays.get_overlay(&self.user, key)?;
        let mut doc = self.base_document(key, overlay.as_ref())?;
        if let Some(overlay) = overlay {
            overlay
                .mutation
                .apply_to_local_view(&mut doc, None, Timestamp::now());
        }
        Ok(doc)
    }

    fn base_document(
        &mut self,
        key: &DocumentKey,
        overlay: Option<&Overlay>,
    ) -> Result<MutableDocument> {
        match overlay {
            None => self.remote_documents.get(key),
            Some(overlay) if overlay.mutation.is_patch() => self.remote_documents.get(key),
            Some(_) => Ok(MutableDocument::invalid(key.clone())),
        }
    }

    /// The local views of all documents in `keys`. Missing documents are
    /// represented as invalid documents in the result.
    pub fn get_documents(
        &mut self,
        keys: &BTreeSet<DocumentKey>,
    ) -> Result<BTreeMap<DocumentKey, MutableDocument>> {
        let docs = self.remote_documents.get_all(keys)?;
        self.get_local_view_of_documents(docs, &BTreeSet::new())
    }

    /// Apply the pending overlays to the given base documents.
    ///
    /// `existence_state_changed` lists the keys whose remote existence state
    /// flipped; their overlays are recalculated where the flip can change a
    /// patch mutation's effect.
    pub fn get_local_view_of_documents(
        &mut self,
        docs: BTreeMap<DocumentKey, MutableDocument>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> Result<BTreeMap<DocumentKey, MutableDocument>> {
        self.compute_views(docs, BTreeMap::new(), existence_state_changed)
    }

    /// Compute the local view of `docs`, reusing `memoized_overlays` where
    /// present and reading the rest from the overlay store.
    pub fn compute_views(
        &mut self,
        docs: BTreeMap<DocumentKey, MutableDocument>,
        mut overlays: BTreeMap<DocumentKey, Overlay>,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> Result<BTreeMap<DocumentKey, MutableDocument>> {
        let missing: BTreeSet<DocumentKey> = docs
            .keys()
            .filter(|key| !overlays.contains_key(*key))
            .cloned()
            .collect();
        overlays.extend(self.overlays.get_overlays(&self.user, &missing)?);

        let now = Timestamp::now();
        let mut results = BTreeMap::new();
        let mut to_recalculate = BTreeMap::new();
        for (key, mut doc) in docs {
            let overlay = overlays.get(&key);
            // an existence flip can turn a patch overlay (or the absence of
            // one) into a stale result; recompute from the mutation queue
            if existence_state_changed.contains(&key)
                && overlay.map_or(true, |overlay| overlay.mutation.is_patch())
            {
                to_recalculate.insert(key, doc);
            } else {
                if let Some(overlay) = overlay {
                    overlay.mutation.apply_to_local_view(&mut doc, None, now);
                }
                results.insert(key, doc);
            }
        }

        self.recalculate_and_save_overlays(&mut to_recalculate)?;
        results.extend(to_recalculate);
        Ok(results)
    }

    /// Recompute the overlays of `docs` from the mutation queue and save
    /// them, leaving each document at its up-to-date local view.
    ///
    /// Each key's overlay is attributed to the highest batch id that touches
    /// the key.
    pub fn recalculate_and_save_overlays(
        &mut self,
        docs: &mut BTreeMap<DocumentKey, MutableDocument>,
    ) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let keys: BTreeSet<DocumentKey> = docs.keys().cloned().collect();
        let batches = self.mutation_queue.all_batches_affecting_keys(&keys)?;

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut documents_by_batch_id: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(doc) = docs.get_mut(&key) else {
                    continue;
                };
                let mask = masks.remove(&key).unwrap_or_else(|| Some(FieldMask::empty()));
                let mask = batch.apply_to_local_view_with_field_mask(doc, mask);
                masks.insert(key.clone(), mask);
                documents_by_batch_id
                    .entry(batch.batch_id)
                    .or_default()
                    .insert(key);
            }
        }

        // iterate in descending batch id order so every key's overlay is
        // attributed to its highest contributing batch
        let mut processed: BTreeSet<DocumentKey> = BTreeSet::new();
        for (batch_id, keys) in documents_by_batch_id.iter().rev() {
            let mut staged: BTreeMap<DocumentKey, Mutation> = BTreeMap::new();
            for key in keys {
                if processed.contains(key) {
                    continue;
                }
                let doc = docs.get(key).context("recalculated key vanished")?;
                let mask = masks.get(key).and_then(|mask| mask.as_ref());
                if let Some(mutation) = calculate_overlay_mutation(doc, mask) {
                    trace!(%key, batch_id, "staging recalculated overlay");
                    staged.insert(key.clone(), mutation);
                }
                processed.insert(key.clone());
            }
            debug!(batch_id, count = staged.len(), "saving recalculated overlays");
            self.overlays.save_overlays(&self.user, *batch_id, staged)?;
        }
        Ok(())
    }

    /// Recompute and save the overlays for `keys`, reading the base documents
    /// from the remote document cache.
    pub fn recalculate_and_save_overlays_for_document_keys(
        &mut self,
        keys: &BTreeSet<DocumentKey>,
    ) -> Result<()> {
        let mut docs = self.remote_documents.get_all(keys)?;
        self.recalculate_and_save_overlays(&mut docs)
    }

    /// All documents matching `query`, starting at `offset`.
    pub fn get_documents_matching_query(
        &mut self,
        query: &Query,
        offset: QueryOffset,
    ) -> Result<BTreeMap<DocumentKey, MutableDocument>> {
        if query.is_document_query() {
            self.get_documents_matching_document_query(query)
        } else if let Some(group) = query.collection_group.clone() {
            self.get_documents_matching_collection_group_query(query, &group, offset)
        } else {
            self.get_documents_matching_collection_query(query, offset)
        }
    }

    fn get_documents_matching_document_query(
        &mut self,
        query: &Query,
    ) -> Result<BTreeMap<DocumentKey, MutableDocument>> {
        let key = DocumentKey::from_path(query.path.clone())?;
        let doc = self.get_document(&key)?;
        let mut result = BTreeMap::new();
        if doc.is_found_document() {
            result.insert(key, doc);
        }
        Ok(result)
    }

    fn get_documents_matching_collection_group_query(
        &mut self,
        query: &Query,
        group: &str,
        offset: QueryOffset,
    ) -> Result<BTreeMap<DocumentKey, MutableDocument>> {
        let parents = self.indexes.collection_parents(group)?;
        let mut results = BTreeMap::new();
        for parent in parents {
            let collection_query = query.as_collection_query_at_path(parent.child(group));
            results.extend(self.get_documents_matching_collection_query(&collection_query, offset)?);
        }
        Ok(results)
    }

    fn get_documents_matching_collection_query(
        &mut self,
        query: &Query,
        offset: QueryOffset,
    ) -> Result<BTreeMap<DocumentKey, MutableDocument>> {
        let mut remote = self.remote_documents.get_matching(query, offset.read_time)?;
        let overlays = self.overlays.get_overlays_for_collection(
            &self.user,
            &query.path,
            offset.largest_batch_id,
        )?;

        // a pending mutation may promote a document the backend has not sent
        // yet into the result set; give its overlay a base to apply to
        for key in overlays.keys() {
            remote
                .entry(key.clone())
                .or_insert_with(|| MutableDocument::invalid(key.clone()));
        }

        let now = Timestamp::now();
        let mut results = BTreeMap::new();
        for (key, mut doc) in remote {
            if let Some(overlay) = overlays.get(&key) {
                overlay.mutation.apply_to_local_view(&mut doc, None, now);
            }
            if query.matches(&doc) {
                results.insert(key, doc);
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        document::{ObjectValue, Value},
        indexes::MemoryIndexManager,
        mutation::{MutationBatch, Precondition},
        query::{Filter, FilterOp},
        queue::MemoryMutationQueue,
        remote::MemoryRemoteDocumentCache,
        store::memory,
    };

    use super::*;

    type TestView = LocalDocumentsView<
        MemoryRemoteDocumentCache,
        MemoryMutationQueue,
        memory::Store,
        MemoryIndexManager,
    >;

    fn view() -> TestView {
        LocalDocumentsView::new(
            MemoryRemoteDocumentCache::new(),
            MemoryMutationQueue::new(),
            memory::Store::new(),
            MemoryIndexManager::new(),
            UserId::new("alice"),
        )
    }

    fn key(s: &str) -> DocumentKey {
        s.parse().unwrap()
    }

    fn fp(s: &str) -> crate::document::FieldPath {
        s.parse().unwrap()
    }

    fn obj(fields: &[(&str, Value)]) -> ObjectValue {
        let mut value = ObjectValue::new();
        for (path, v) in fields {
            value.set(&fp(path), v.clone());
        }
        value
    }

    fn found(path: &str, fields: &[(&str, Value)]) -> MutableDocument {
        MutableDocument::found(key(path), Timestamp::from_micros(1), obj(fields))
    }

    fn set_mutation(path: &str, fields: &[(&str, Value)]) -> Mutation {
        Mutation::Set {
            key: key(path),
            value: obj(fields),
        }
    }

    #[test]
    fn set_overlay_shadows_remote_document() -> Result<()> {
        let mut view = view();
        view.remote_documents_mut().add(
            found("users/alice", &[("age", Value::Integer(30))]),
            Timestamp::from_micros(10),
        );
        let mutation = set_mutation(
            "users/alice",
            &[
                ("age", Value::Integer(31)),
                ("city", Value::String("NYC".into())),
            ],
        );
        let user = view.user().clone();
        view.overlays_mut().save_overlays(
            &user,
            5,
            [(key("users/alice"), mutation)].into(),
        )?;

        let doc = view.get_document(&key("users/alice"))?;
        assert!(doc.is_found_document());
        assert!(doc.has_local_mutations());
        assert_eq!(doc.data().field(&fp("age")), Some(&Value::Integer(31)));
        assert_eq!(
            doc.data().field(&fp("city")),
            Some(&Value::String("NYC".into()))
        );
        Ok(())
    }

    #[test]
    fn document_without_overlay_reads_remote_state() -> Result<()> {
        let mut view = view();
        view.remote_documents_mut().add(
            found("users/alice", &[("age", Value::Integer(30))]),
            Timestamp::from_micros(10),
        );
        let doc = view.get_document(&key("users/alice"))?;
        assert_eq!(doc.data().field(&fp("age")), Some(&Value::Integer(30)));
        assert!(!doc.has_local_mutations());

        let missing = view.get_document(&key("users/nobody"))?;
        assert!(!missing.is_valid_document());
        Ok(())
    }

    #[test]
    fn existence_flip_revives_patch_overlay() -> Result<()> {
        let mut view = view();
        // batch 7 patches a document that does not exist yet
        let patch = Mutation::Patch {
            key: key("users/bob"),
            data: obj(&[("city", Value::String("LA".into()))]),
            mask: FieldMask::from_paths([fp("city")]),
            precondition: Precondition::Exists(true),
        };
        view.mutation_queue_mut().add_batch(MutationBatch::new(
            7,
            Timestamp::from_micros(2),
            vec![patch],
        ))?;

        // with no remote document the patch precondition fails: the local
        // view stays invalid and no overlay is stored
        let keys: BTreeSet<DocumentKey> = [key("users/bob")].into();
        view.recalculate_and_save_overlays_for_document_keys(&keys)?;
        let user = view.user().clone();
        assert!(view
            .overlays_mut()
            .get_overlay(&user, &key("users/bob"))?
            .is_none());

        // the backend now delivers the document: recalculation produces an
        // overlay for batch 7 that applies the patch
        let remote = found("users/bob", &[("name", Value::String("Bob".into()))]);
        view.remote_documents_mut()
            .add(remote.clone(), Timestamp::from_micros(20));
        let docs = [(key("users/bob"), remote)].into();
        let changed: BTreeSet<DocumentKey> = [key("users/bob")].into();
        let views = view.get_local_view_of_documents(docs, &changed)?;

        let doc = &views[&key("users/bob")];
        assert_eq!(
            doc.data().field(&fp("name")),
            Some(&Value::String("Bob".into()))
        );
        assert_eq!(
            doc.data().field(&fp("city")),
            Some(&Value::String("LA".into()))
        );

        let overlay = view
            .overlays_mut()
            .get_overlay(&user, &key("users/bob"))?
            .unwrap();
        assert_eq!(overlay.largest_batch_id, 7);
        assert!(overlay.mutation.is_patch());
        Ok(())
    }

    #[test]
    fn recalculation_attributes_overlay_to_highest_batch() -> Result<()> {
        let mut view = view();
        view.remote_documents_mut()
            .add(found("users/k", &[]), Timestamp::from_micros(1));
        for batch_id in [2, 5, 9] {
            view.mutation_queue_mut().add_batch(MutationBatch::new(
                batch_id,
                Timestamp::from_micros(2),
                vec![Mutation::Patch {
                    key: key("users/k"),
                    data: obj(&[("n", Value::Integer(batch_id))]),
                    mask: FieldMask::from_paths([fp("n")]),
                    precondition: Precondition::None,
                }],
            ))?;
        }

        let keys: BTreeSet<DocumentKey> = [key("users/k")].into();
        view.recalculate_and_save_overlays_for_document_keys(&keys)?;

        let user = view.user().clone();
        let overlay = view
            .overlays_mut()
            .get_overlay(&user, &key("users/k"))?
            .unwrap();
        assert_eq!(overlay.largest_batch_id, 9);

        // the lower batches hold no overlay for the key anymore
        view.overlays_mut().remove_overlays_for_batch_id(&user, 2)?;
        view.overlays_mut().remove_overlays_for_batch_id(&user, 5)?;
        assert!(view
            .overlays_mut()
            .get_overlay(&user, &key("users/k"))?
            .is_some());

        // the composed local view reflects the last batch
        let doc = view.get_document(&key("users/k"))?;
        assert_eq!(doc.data().field(&fp("n")), Some(&Value::Integer(9)));
        Ok(())
    }

    #[test]
    fn query_promotes_overlay_only_documents() -> Result<()> {
        let mut view = view();
        let mutation = set_mutation(
            "messages/x",
            &[
                ("author", Value::String("alice".into())),
                ("body", Value::String("hi".into())),
            ],
        );
        let user = view.user().clone();
        view.overlays_mut()
            .save_overlays(&user, 4, [(key("messages/x"), mutation)].into())?;

        let query = Query::collection("messages".parse()?).with_filter(Filter::new(
            fp("author"),
            FilterOp::Eq,
            Value::String("alice".into()),
        ));
        let results =
            view.get_documents_matching_query(&query, QueryOffset::new(Timestamp::ZERO, 0))?;
        assert_eq!(results.len(), 1);
        let doc = &results[&key("messages/x")];
        assert_eq!(
            doc.data().field(&fp("body")),
            Some(&Value::String("hi".into()))
        );
        Ok(())
    }

    #[test]
    fn collection_query_merges_remote_and_overlays() -> Result<()> {
        let mut view = view();
        view.remote_documents_mut().add(
            found("users/alice", &[("age", Value::Integer(30))]),
            Timestamp::from_micros(10),
        );
        view.remote_documents_mut().add(
            found("users/bob", &[("age", Value::Integer(40))]),
            Timestamp::from_micros(10),
        );
        // pending delete hides bob from the results
        let user = view.user().clone();
        view.overlays_mut().save_overlays(
            &user,
            2,
            [(
                key("users/bob"),
                Mutation::Delete {
                    key: key("users/bob"),
                },
            )]
            .into(),
        )?;

        let query = Query::collection("users".parse()?);
        let results = view.get_documents_matching_query(&query, QueryOffset::NONE)?;
        assert_eq!(results.keys().cloned().collect::<Vec<_>>(), vec![key("users/alice")]);
        Ok(())
    }

    #[test]
    fn document_query_returns_singleton_or_empty() -> Result<()> {
        let mut view = view();
        view.remote_documents_mut()
            .add(found("users/alice", &[]), Timestamp::from_micros(10));

        let hit = view.get_documents_matching_query(&Query::doc(key("users/alice")), QueryOffset::NONE)?;
        assert_eq!(hit.len(), 1);

        let miss = view.get_documents_matching_query(&Query::doc(key("users/bob")), QueryOffset::NONE)?;
        assert!(miss.is_empty());
        Ok(())
    }

    #[test]
    fn collection_group_query_fans_out_over_parents() -> Result<()> {
        let mut view = view();
        view.remote_documents_mut().add(
            found("rooms/r1/messages/m1", &[]),
            Timestamp::from_micros(10),
        );
        view.remote_documents_mut().add(
            found("archives/a1/messages/m2", &[]),
            Timestamp::from_micros(10),
        );
        view.indexes_mut()
            .add_collection_parent(&"rooms/r1/messages".parse()?);
        view.indexes_mut()
            .add_collection_parent(&"archives/a1/messages".parse()?);

        let query = Query::collection_group("messages");
        let results = view.get_documents_matching_query(&query, QueryOffset::NONE)?;
        assert_eq!(results.len(), 2);
        assert!(results.contains_key(&key("rooms/r1/messages/m1")));
        assert!(results.contains_key(&key("archives/a1/messages/m2")));
        Ok(())
    }

    #[test]
    fn get_documents_applies_overlays_in_bulk() -> Result<()> {
        let mut view = view();
        view.remote_documents_mut().add(
            found("users/alice", &[("age", Value::Integer(30))]),
            Timestamp::from_micros(10),
        );
        let user = view.user().clone();
        view.overlays_mut().save_overlays(
            &user,
            3,
            [(
                key("users/bob"),
                set_mutation("users/bob", &[("age", Value::Integer(1))]),
            )]
            .into(),
        )?;

        let keys: BTreeSet<DocumentKey> = [key("users/alice"), key("users/bob")].into();
        let docs = view.get_documents(&keys)?;
        assert_eq!(docs.len(), 2);
        assert!(!docs[&key("users/alice")].has_local_mutations());
        assert!(docs[&key("users/bob")].is_found_document());
        Ok(())
    }

    #[test]
    fn compute_views_is_idempotent() -> Result<()> {
        let mut view = view();
        view.remote_documents_mut().add(
            found("users/bob", &[("name", Value::String("Bob".into()))]),
            Timestamp::from_micros(10),
        );
        view.mutation_queue_mut().add_batch(MutationBatch::new(
            3,
            Timestamp::from_micros(2),
            vec![Mutation::Patch {
                key: key("users/bob"),
                data: obj(&[("city", Value::String("LA".into()))]),
                mask: FieldMask::from_paths([fp("city")]),
                precondition: Precondition::Exists(true),
            }],
        ))?;

        let changed: BTreeSet<DocumentKey> = [key("users/bob")].into();
        let base = || {
            BTreeMap::from([(
                key("users/bob"),
                found("users/bob", &[("name", Value::String("Bob".into()))]),
            )])
        };
        let first = view.get_local_view_of_documents(base(), &changed)?;
        let second = view.get_local_view_of_documents(base(), &changed)?;
        assert_eq!(first, second);
        Ok(())
    }
}
