//! Deferred loads: one-shot handles to a value that a batch will produce.

use std::{
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{executor, FutureExt};

use crate::{batch::Completion, error::LoadError};

/// The result of a single load. `Ok(None)` means the fetch reported the key
/// as not found.
pub type LoadResult<V, E> = Result<Option<V>, LoadError<E>>;

enum State<V, E> {
    // Cache hits are resolved at creation time
    Ready(LoadResult<V, E>),
    Pending {
        completion: Completion<V, E>,
        position: usize,
    },
    Done,
}

/// A deferred load of a single key, created by
/// [`KeyedBatchLoader::load_deferred`][crate::KeyedBatchLoader::load_deferred].
///
/// A deferred is bound to a position in a batch; it doesn't do any work
/// itself, and the batch is fetched whether or not the deferred is ever
/// awaited. This means many deferreds, across many loaders, can be created
/// before any of them is forced, letting their batches overlap.
///
/// Force a deferred either by awaiting it, or by calling [`wait`] from
/// synchronous code.
///
/// [`wait`]: Deferred::wait
pub struct Deferred<V, E> {
    state: State<V, E>,
}

// Nothing in a Deferred is ever pinned; the completion signal is Unpin and
// results are moved out by value.
impl<V, E> Unpin for Deferred<V, E> {}

impl<V, E> Debug for Deferred<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Ready(..) => "Ready",
            State::Pending { .. } => "Pending",
            State::Done => "Done",
        };

        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

impl<V, E> Deferred<V, E> {
    pub(crate) fn ready(result: LoadResult<V, E>) -> Self {
        Self {
            state: State::Ready(result),
        }
    }

    pub(crate) fn pending(completion: Completion<V, E>, position: usize) -> Self {
        Self {
            state: State::Pending {
                completion,
                position,
            },
        }
    }

    /// Check if forcing this deferred would return immediately; that is, if
    /// it was a cache hit or its batch has finished fetching.
    pub fn is_resolved(&self) -> bool {
        match self.state {
            State::Ready(..) => true,
            // `peek` only sees a signal some clone has already polled, so
            // poll a fresh clone instead
            State::Pending { ref completion, .. } => completion.clone().now_or_never().is_some(),
            State::Done => false,
        }
    }
}

impl<V: Clone, E: Clone> Deferred<V, E> {
    /// Block the current thread until this deferred is resolved.
    ///
    /// The batch's fetch runs on the loader's spawner, so this must not be
    /// called from a thread that spawner needs in order to make progress
    /// (such as the only thread of a single-threaded runtime).
    pub fn wait(self) -> LoadResult<V, E> {
        executor::block_on(self)
    }
}

impl<V: Clone, E: Clone> Future for Deferred<V, E> {
    type Output = LoadResult<V, E>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);

        match mem::replace(&mut this.state, State::Done) {
            State::Ready(result) => Poll::Ready(result),
            State::Pending {
                mut completion,
                position,
            } => match completion.poll_unpin(ctx) {
                Poll::Pending => {
                    this.state = State::Pending {
                        completion,
                        position,
                    };
                    Poll::Pending
                }
                Poll::Ready(Ok(outcome)) => Poll::Ready(outcome.resolve(position)),

                // The fetch task went away without resolving the batch
                Poll::Ready(Err(_canceled)) => Poll::Ready(Err(LoadError::Dropped)),
            },
            State::Done => panic!("Can't re-poll a completed Deferred"),
        }
    }
}

/// A deferred load of several keys, created by
/// [`KeyedBatchLoader::load_many_deferred`][crate::KeyedBatchLoader::load_many_deferred].
/// Resolves to one result per requested key, in request order.
pub struct DeferredMany<V, E> {
    deferreds: Vec<Deferred<V, E>>,
    results: Vec<Option<LoadResult<V, E>>>,
}

impl<V, E> Unpin for DeferredMany<V, E> {}

impl<V, E> Debug for DeferredMany<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredMany")
            .field("len", &self.deferreds.len())
            .field(
                "resolved",
                &self.results.iter().filter(|slot| slot.is_some()).count(),
            )
            .finish()
    }
}

impl<V, E> DeferredMany<V, E> {
    pub(crate) fn new(deferreds: Vec<Deferred<V, E>>) -> Self {
        let results = deferreds.iter().map(|_| None).collect();
        Self { deferreds, results }
    }

    /// Get the number of keys in this load.
    #[inline]
    pub fn len(&self) -> usize {
        self.deferreds.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.deferreds.is_empty()
    }
}

impl<V: Clone, E: Clone> DeferredMany<V, E> {
    /// Block the current thread until every key is resolved. The same
    /// caveats as [`Deferred::wait`] apply.
    pub fn wait(self) -> Vec<LoadResult<V, E>> {
        executor::block_on(self)
    }
}

impl<V: Clone, E: Clone> Future for DeferredMany<V, E> {
    type Output = Vec<LoadResult<V, E>>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);
        let mut complete = true;

        for (deferred, slot) in this.deferreds.iter_mut().zip(this.results.iter_mut()) {
            if slot.is_none() {
                match deferred.poll_unpin(ctx) {
                    Poll::Ready(result) => *slot = Some(result),
                    Poll::Pending => complete = false,
                }
            }
        }

        if !complete {
            return Poll::Pending;
        }

        Poll::Ready(
            this.results
                .iter_mut()
                .map(|slot| slot.take().expect("Can't re-poll a completed DeferredMany"))
                .collect(),
        )
    }
}
