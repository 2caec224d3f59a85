//! Data structures for passing results out of a fetch function.

use std::collections::HashMap;
use std::hash::Hash;

/// The output of a fetch function. Either one result per requested key,
/// aligned by position with the keys the fetch was given, or a single error
/// that applies to every key in the call.
///
/// Within the per-key vector, `Ok(None)` means the key was legitimately not
/// found. If the vector is shorter than the key list, the missing trailing
/// positions are treated as `Ok(None)`.
pub type FetchResult<V, E> = Result<Vec<Result<Option<V>, E>>, E>;

/// Trait for values that carry their own key. Implement this for your row
/// type to use [`align_by_key`].
pub trait KeyedEntry<Key: ?Sized> {
    fn get_key(&self) -> &Key;
}

impl<K, V> KeyedEntry<K> for (K, V) {
    fn get_key(&self) -> &K {
        &self.0
    }
}

/// What to do when [`align_by_key`] sees more than one row for the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDuplicate {
    /// Keep the first row for the key.
    Ignore,
    /// Keep the last row for the key.
    Replace,
}

/// Backends usually answer a multi-key query with rows in an arbitrary
/// order, possibly with some keys missing. This pairs each row back up with
/// the position of its key, producing the vector a fetch function has to
/// return. Keys with no row become `Ok(None)`; rows whose key wasn't
/// requested are discarded.
///
/// ```
/// use keyed_batchloader::{align_by_key, OnDuplicate};
///
/// let keys = vec!["a", "b", "c"];
/// let rows = vec![("c", 3), ("a", 1)];
///
/// let aligned: Vec<Result<_, ()>> = align_by_key(&keys, rows, OnDuplicate::Ignore);
/// assert_eq!(aligned, vec![Ok(Some(("a", 1))), Ok(None), Ok(Some(("c", 3)))]);
/// ```
pub fn align_by_key<K, V, E>(
    keys: &[K],
    rows: impl IntoIterator<Item = V>,
    on_duplicate: OnDuplicate,
) -> Vec<Result<Option<V>, E>>
where
    K: Hash + Eq,
    V: KeyedEntry<K>,
{
    // Keys are expected to be unique, but if they aren't, every position of
    // a repeated key after the first stays empty.
    let mut positions: HashMap<&K, usize> = HashMap::with_capacity(keys.len());
    for (i, key) in keys.iter().enumerate() {
        positions.entry(key).or_insert(i);
    }

    let mut slots: Vec<Option<V>> = keys.iter().map(|_| None).collect();

    for row in rows {
        let position = match positions.get(row.get_key()) {
            Some(&position) => position,
            None => continue,
        };

        let slot = &mut slots[position];
        if slot.is_none() || on_duplicate == OnDuplicate::Replace {
            *slot = Some(row);
        }
    }

    slots.into_iter().map(Ok).collect()
}
