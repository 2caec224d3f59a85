//! A single batch: the keys collected during one window, and the shared
//! outcome that every deferred load in the batch reads once the fetch
//! completes.

use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    hash::Hash,
    sync::Arc,
};

use futures::{
    channel::oneshot,
    future::{FutureExt, Shared},
};

use crate::{data::FetchResult, error::LoadError};

pub(crate) type BatchId = u64;

/// The single-assignment completion signal of a batch. It is resolved once,
/// by the fetch task, and read by every deferred bound to the batch. If the
/// fetch task is dropped without resolving it, readers see `Canceled`.
pub(crate) type Completion<V, E> = Shared<oneshot::Receiver<Arc<Outcome<V, E>>>>;

/// What a batch's fetch produced.
#[derive(Debug)]
pub(crate) enum Outcome<V, E> {
    Fetched(FetchResult<V, E>),
    Panicked,
}

impl<V, E> Outcome<V, E> {
    /// The confirmed value at `position`, for writing back into the cache.
    /// Returns `None` if the position resolved to an error; `Some(None)` if
    /// it resolved to an absent value.
    pub(crate) fn confirmed(&self, position: usize) -> Option<Option<&V>> {
        match self {
            Outcome::Fetched(Ok(results)) => match results.get(position) {
                None => Some(None),
                Some(Ok(value)) => Some(value.as_ref()),
                Some(Err(_)) => None,
            },
            Outcome::Fetched(Err(_)) | Outcome::Panicked => None,
        }
    }
}

impl<V: Clone, E: Clone> Outcome<V, E> {
    /// Get the result for the key at `position`. A shared error is reported
    /// at every position. Positions past the end of the fetched results are
    /// absent, rather than errors.
    pub(crate) fn resolve(&self, position: usize) -> Result<Option<V>, LoadError<E>> {
        match self {
            Outcome::Panicked => Err(LoadError::Panicked),
            Outcome::Fetched(Err(err)) => Err(LoadError::Fetch(err.clone())),
            Outcome::Fetched(Ok(results)) => match results.get(position) {
                None => Ok(None),
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err(err)) => Err(LoadError::Fetch(err.clone())),
            },
        }
    }
}

/// An open batch. It is owned by the loader while it accumulates keys, and
/// is consumed by [`Batch::into_parts`] when it closes; after that, only the
/// completion signal remains, shared by the deferreds.
pub(crate) struct Batch<K, V, E> {
    id: BatchId,

    // Keys in first-registration order. A key's index here is the position
    // the fetch function must answer it at.
    keys: Vec<K>,
    positions: HashMap<K, usize>,

    sender: oneshot::Sender<Arc<Outcome<V, E>>>,
    completion: Completion<V, E>,
}

impl<K: Debug, V, E> Debug for Batch<K, V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("id", &self.id)
            .field("keys", &self.keys)
            .finish()
    }
}

impl<K, V, E> Batch<K, V, E>
where
    K: Clone + Hash + Eq,
{
    pub(crate) fn new(id: BatchId) -> Self {
        let (sender, receiver) = oneshot::channel();

        Self {
            id,
            keys: Vec::new(),
            positions: HashMap::new(),
            sender,
            completion: receiver.shared(),
        }
    }

    /// Get the position of `key` in this batch, adding it if it isn't
    /// already present.
    pub(crate) fn key_index(&mut self, key: K) -> usize {
        if let Some(&position) = self.positions.get(&key) {
            return position;
        }

        let position = self.keys.len();
        self.keys.push(key.clone());
        self.positions.insert(key, position);
        position
    }
}

impl<K, V, E> Batch<K, V, E> {
    #[inline]
    pub(crate) fn id(&self) -> BatchId {
        self.id
    }

    /// Get the number of distinct keys in this batch.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn completion(&self) -> Completion<V, E> {
        self.completion.clone()
    }

    /// Close the batch, handing out its keys and the sending half of its
    /// completion signal.
    pub(crate) fn into_parts(self) -> (Vec<K>, oneshot::Sender<Arc<Outcome<V, E>>>) {
        (self.keys, self.sender)
    }
}
