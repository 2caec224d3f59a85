use std::{
    borrow::Borrow,
    collections::{hash_map::Entry, HashMap},
    fmt::{self, Debug, Formatter},
    future::Future,
    hash::Hash,
    panic::AssertUnwindSafe,
    sync::Arc,
};

use futures::{future::BoxFuture, FutureExt};
use futures_timer::Delay;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    batch::{Batch, BatchId, Outcome},
    config::LoaderConfig,
    data::FetchResult,
    deferred::{Deferred, DeferredMany, LoadResult},
};

type FetchFn<K, V, E> = dyn Fn(Vec<K>) -> BoxFuture<'static, FetchResult<V, E>> + Send + Sync;
type SpawnFn = dyn Fn(BoxFuture<'static, ()>) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// The accumulation window elapsed
    Timer,
    /// The batch reached the configured maximum number of keys
    Full,
}

struct State<K, V, E> {
    // `None` is a cached "not found"
    cache: HashMap<K, Option<V>>,

    // The batch currently accepting keys. Taking a batch out of this slot is
    // what closes it; whichever of the timer or the size limit takes it
    // first dispatches it, and the other finds it gone.
    batch: Option<Batch<K, V, E>>,
    next_batch_id: BatchId,
}

struct Inner<K, V, E> {
    config: LoaderConfig,
    fetch: Box<FetchFn<K, V, E>>,
    spawner: Box<SpawnFn>,
    state: Mutex<State<K, V, E>>,
}

/// A loader that coalesces concurrent single-key lookups into batched calls
/// to a fetch function, and caches what it fetched.
///
/// Create one loader per kind of entity (one for tags, one for projects, and
/// so on), typically per request scope. A loader is cheaply cloneable; all
/// clones share the same cache and batches.
///
/// The lock protecting the cache and the open batch is only held for
/// bookkeeping. Fetches run on tasks handed to the spawner, so a slow fetch
/// never holds up the admission of keys into the next batch.
///
/// Every caller of a key in a batch gets its own clone of the fetched value.
/// To have them all share one instance, use an `Arc` as the value type.
pub struct KeyedBatchLoader<K, V, E> {
    inner: Arc<Inner<K, V, E>>,
}

impl<K, V, E> Clone for KeyedBatchLoader<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, E> Debug for KeyedBatchLoader<K, V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();

        f.debug_struct("KeyedBatchLoader")
            .field("config", &self.inner.config)
            .field("fetch", &"<closure>")
            .field("cached", &state.cache.len())
            .field("open_batch", &state.batch.as_ref().map(|batch| batch.id()))
            .finish()
    }
}

impl<K, V, E> KeyedBatchLoader<K, V, E>
where
    K: Clone + Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create a new loader.
    ///
    /// `fetch` is called with the distinct keys of a batch, in the order
    /// they were first requested, and must answer them by position (see
    /// [`FetchResult`]). `spawner` is used to run the batch timers and the
    /// fetches themselves; `tokio::spawn` works, as does
    /// `futures::executor::ThreadPool::spawn_ok`.
    pub fn new<F, Fut, S, R>(config: LoaderConfig, fetch: F, spawner: S) -> Self
    where
        F: Fn(Vec<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FetchResult<V, E>> + Send + 'static,
        S: Fn(BoxFuture<'static, ()>) -> R + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                config,
                fetch: Box::new(move |keys: Vec<K>| fetch(keys).boxed()),
                spawner: Box::new(move |fut: BoxFuture<'static, ()>| {
                    let _ = spawner(fut);
                }),
                state: Mutex::new(State {
                    cache: HashMap::new(),
                    batch: None,
                    next_batch_id: 0,
                }),
            }),
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    /// Register a load of `key` and return a deferred handle to its result.
    ///
    /// The key is admitted into the current batch immediately, so several
    /// deferreds (even on different loaders) can be created before any of
    /// them is awaited. A cached key returns an already-resolved deferred
    /// without touching any batch.
    pub fn load_deferred(&self, key: K) -> Deferred<V, E> {
        let mut guard = self.inner.state.lock();

        if let Some(cached) = guard.cache.get(&key) {
            trace!("cache hit");
            return Deferred::ready(Ok(cached.clone()));
        }

        let state = &mut *guard;
        let next_batch_id = &mut state.next_batch_id;
        let mut opened = None;

        let batch = state.batch.get_or_insert_with(|| {
            let id = *next_batch_id;
            *next_batch_id += 1;
            opened = Some(id);
            Batch::new(id)
        });

        let position = batch.key_index(key);
        let deferred = Deferred::pending(batch.completion(), position);
        trace!(batch = batch.id(), position, "key admitted");

        let full = match self.inner.config.max_batch {
            Some(max) => batch.len() >= max.get(),
            None => false,
        };
        let closed = if full { state.batch.take() } else { None };

        drop(guard);

        match (closed, opened) {
            (Some(batch), _) => self.inner.dispatch(batch, CloseReason::Full),
            (None, Some(id)) => self.inner.start_timer(id),
            (None, None) => {}
        }

        deferred
    }

    /// Load a single key. Note that, like any async fn, nothing happens until
    /// the returned future is first polled; use [`load_deferred`] to admit
    /// the key eagerly.
    ///
    /// [`load_deferred`]: KeyedBatchLoader::load_deferred
    pub async fn load(&self, key: K) -> LoadResult<V, E> {
        self.load_deferred(key).await
    }

    /// Load a single key, blocking the current thread until it resolves. See
    /// [`Deferred::wait`].
    pub fn load_blocking(&self, key: K) -> LoadResult<V, E> {
        self.load_deferred(key).wait()
    }

    /// Register loads of several keys. Position `i` of the eventual result
    /// corresponds to position `i` of `keys`, regardless of duplicates or
    /// cache hits. Keys beyond the batch limit spill into further batches.
    pub fn load_many_deferred(&self, keys: impl IntoIterator<Item = K>) -> DeferredMany<V, E> {
        DeferredMany::new(keys.into_iter().map(|key| self.load_deferred(key)).collect())
    }

    pub async fn load_many(&self, keys: impl IntoIterator<Item = K>) -> Vec<LoadResult<V, E>> {
        self.load_many_deferred(keys).await
    }

    pub fn load_many_blocking(&self, keys: impl IntoIterator<Item = K>) -> Vec<LoadResult<V, E>> {
        self.load_many_deferred(keys).wait()
    }

    /// Insert a value into the cache, unless the key is already cached.
    /// Returns true if the value was inserted. To overwrite an existing
    /// entry, [`clear`] it first.
    ///
    /// [`clear`]: KeyedBatchLoader::clear
    pub fn prime(&self, key: K, value: V) -> bool {
        match self.inner.state.lock().cache.entry(key) {
            Entry::Occupied(..) => false,
            Entry::Vacant(entry) => {
                entry.insert(Some(value));
                true
            }
        }
    }

    /// Remove a key from the cache. No-op if it isn't cached.
    pub fn clear<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.state.lock().cache.remove(key);
    }

    /// Remove every key from the cache.
    pub fn clear_all(&self) {
        self.inner.state.lock().cache.clear();
    }

    /// Check if a key is cached, either with a value or as not found.
    pub fn is_cached<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.state.lock().cache.contains_key(key)
    }
}

impl<K, V, E> Inner<K, V, E>
where
    K: Clone + Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn start_timer(self: &Arc<Self>, id: BatchId) {
        let timer = BatchTimer {
            inner: Arc::clone(self),
            id,
            fired: false,
        };
        let wait = self.config.wait;

        (self.spawner)(
            async move {
                Delay::new(wait).await;
                timer.fire();
            }
            .boxed(),
        );
    }

    /// Timer path for closing a batch. If the batch was already closed
    /// because it filled up, it's no longer in the slot and this is a no-op.
    fn close_expired(self: &Arc<Self>, id: BatchId) {
        match self.take_open(id) {
            Some(batch) => self.dispatch(batch, CloseReason::Timer),
            None => trace!(batch = id, "batch already dispatched"),
        }
    }

    /// Run the fetch for a closed batch on a new task, populate the cache
    /// from its outcome, then resolve the batch.
    fn dispatch(self: &Arc<Self>, batch: Batch<K, V, E>, reason: CloseReason) {
        let id = batch.id();
        let (keys, sender) = batch.into_parts();
        debug!(batch = id, keys = keys.len(), ?reason, "dispatching batch");

        let inner = Arc::clone(self);

        (self.spawner)(
            async move {
                // The fetch is called inside the guarded future so that a
                // panic while building its future is caught too.
                let fetched = AssertUnwindSafe(async { (inner.fetch)(keys.clone()).await })
                    .catch_unwind()
                    .await;

                let outcome = match fetched {
                    Ok(result) => Outcome::Fetched(result),
                    Err(..) => {
                        warn!(batch = id, "batch fetch panicked");
                        Outcome::Panicked
                    }
                };

                let outcome = Arc::new(outcome);
                inner.write_back(&keys, &outcome);
                debug!(batch = id, "batch complete");

                // Every deferred may already be gone; that's fine, the
                // cache has been updated regardless.
                let _ = sender.send(outcome);
            }
            .boxed(),
        );
    }

    /// Cache every key of a completed batch that resolved without an error.
    fn write_back(&self, keys: &[K], outcome: &Outcome<V, E>) {
        let cache_missing = self.config.cache_missing;
        let mut state = self.state.lock();

        for (position, key) in keys.iter().enumerate() {
            match outcome.confirmed(position) {
                Some(Some(value)) => {
                    state.cache.insert(key.clone(), Some(value.clone()));
                }
                Some(None) if cache_missing => {
                    state.cache.insert(key.clone(), None);
                }
                _ => {}
            }
        }
    }
}

impl<K, V, E> Inner<K, V, E> {
    /// Take the open batch out of the slot, if it is still batch `id`.
    fn take_open(&self, id: BatchId) -> Option<Batch<K, V, E>> {
        let mut state = self.state.lock();
        let current = state.batch.as_ref().map(|batch| batch.id());

        if current == Some(id) {
            state.batch.take()
        } else {
            None
        }
    }
}

/// Owned by a batch's timer task. If the spawner drops that task before the
/// window elapses, the batch is abandoned instead of staying open forever:
/// dropping it drops its completion sender, so its deferreds resolve to
/// [`LoadError::Dropped`][crate::LoadError::Dropped] and the next key opens
/// a fresh batch.
struct BatchTimer<K, V, E> {
    inner: Arc<Inner<K, V, E>>,
    id: BatchId,
    fired: bool,
}

impl<K, V, E> BatchTimer<K, V, E>
where
    K: Clone + Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn fire(mut self) {
        self.fired = true;
        self.inner.close_expired(self.id);
    }
}

impl<K, V, E> Drop for BatchTimer<K, V, E> {
    fn drop(&mut self) {
        if self.fired {
            return;
        }

        // Taken under the lock, dropped after it's released
        if let Some(batch) = self.inner.take_open(self.id) {
            warn!(batch = self.id, "batch timer dropped; abandoning batch");
            drop(batch);
        }
    }
}
