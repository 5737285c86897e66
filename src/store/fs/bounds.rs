//! Range bounds for the overlay index tables.

use std::ops::Bound;

use bytes::Bytes;

use crate::{mutation::BatchId, path::ResourcePath, store::UserId};

use super::tables::{ByCollectionId, ByCollectionIdOwned, ByGroupId, ByGroupIdOwned};

/// Bounds on the by-collection index table.
///
/// Selects the rows of one user and collection whose batch id is strictly
/// greater than a floor.
pub struct ByCollectionBounds(Bound<ByCollectionIdOwned>, Bound<ByCollectionIdOwned>);

impl ByCollectionBounds {
    pub fn since_batch(user: &UserId, collection: &ResourcePath, since: BatchId) -> Self {
        let collection = Bytes::from(collection.to_index_bytes());
        let start = Bound::Included((
            user.as_str().to_owned(),
            collection.clone(),
            since.saturating_add(1),
            Bytes::new(),
        ));
        let mut collection_end = collection.to_vec();
        let end = if increment_by_one(&mut collection_end) {
            Bound::Excluded((
                user.as_str().to_owned(),
                collection_end.into(),
                i64::MIN,
                Bytes::new(),
            ))
        } else {
            Bound::Excluded((
                str_successor(user.as_str()),
                Bytes::new(),
                i64::MIN,
                Bytes::new(),
            ))
        };
        Self(start, end)
    }

    pub fn as_ref(&self) -> (Bound<ByCollectionId>, Bound<ByCollectionId>) {
        fn map(id: &ByCollectionIdOwned) -> ByCollectionId {
            (&id.0, &id.1[..], id.2, &id.3[..])
        }
        (map_bound(&self.0, map), map_bound(&self.1, map))
    }
}

/// Bounds on the by-collection-group index table.
///
/// Selects the rows of one user and collection group whose batch id is
/// strictly greater than a floor.
pub struct ByGroupBounds(Bound<ByGroupIdOwned>, Bound<ByGroupIdOwned>);

impl ByGroupBounds {
    pub fn since_batch(user: &UserId, group: &str, since: BatchId) -> Self {
        let start = Bound::Included((
            user.as_str().to_owned(),
            group.to_owned(),
            since.saturating_add(1),
            Bytes::new(),
        ));
        let end = Bound::Excluded((
            user.as_str().to_owned(),
            str_successor(group),
            i64::MIN,
            Bytes::new(),
        ));
        Self(start, end)
    }

    pub fn as_ref(&self) -> (Bound<ByGroupId>, Bound<ByGroupId>) {
        fn map(id: &ByGroupIdOwned) -> ByGroupId {
            (&id.0, &id.1, id.2, &id.3[..])
        }
        (map_bound(&self.0, map), map_bound(&self.1, map))
    }
}

/// Increment a byte string by one, by incrementing the last byte that is not
/// 255 by one.
///
/// Returns false if all bytes are 255.
fn increment_by_one(value: &mut [u8]) -> bool {
    for byte in value.iter_mut().rev() {
        if *byte != 255 {
            *byte += 1;
            return true;
        } else {
            *byte = 0;
        }
    }
    false
}

/// The immediate successor of `s` in byte order.
fn str_successor(s: &str) -> String {
    format!("{s}\u{0}")
}

fn map_bound<'a, T, U: 'a>(bound: &'a Bound<T>, f: impl Fn(&'a T) -> U) -> Bound<U> {
    match bound {
        Bound::Unbounded => Bound::Unbounded,
        Bound::Included(t) => Bound::Included(f(t)),
        Bound::Excluded(t) => Bound::Excluded(f(t)),
    }
}
