//! keyed-batchloader is a Rust implementation of the
//! [dataloader pattern](https://github.com/graphql/dataloader) originally
//! created by Facebook. It collects point lookups made by many independent
//! callers during a short window, issues them to a backend as a single batch
//! fetch, caches the results per key, and hands each caller the value for
//! its key. The typical use is a GraphQL API, where resolving a list of
//! objects would otherwise fetch each related entity one at a time.
//!
//! ## Overview
//!
//! Suppose your storage layer can fetch many tags by id in one query. First,
//! adapt it to a fetch function. A fetch function receives the distinct keys
//! of a batch, in the order they were first requested, and returns a
//! [`FetchResult`]: one result per key, aligned by position, or a single
//! error shared by the whole batch.
//!
//! ```
//! use keyed_batchloader::FetchResult;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Tag {
//!     id: u32,
//!     label: String,
//! }
//!
//! async fn fetch_tags(ids: Vec<u32>) -> FetchResult<Tag, String> {
//!     Ok(ids
//!         .into_iter()
//!         .map(|id| Ok(Some(Tag { id, label: format!("tag-{}", id) })))
//!         .collect())
//! }
//! ```
//!
//! Backends rarely return rows in request order. When your rows carry their
//! own key, implement [`KeyedEntry`] for them and use [`align_by_key`] to put
//! them back in position; keys without a row come back as `Ok(None)`.
//!
//! Next, create a [`KeyedBatchLoader`]. It is configured with a
//! [`LoaderConfig`]:
//!
//! - `wait` is how long a batch accumulates keys before it is fetched.
//! - `max_batch` is an optional maximum number of keys per batch. If set, a
//!   batch is fetched immediately when it reaches this many keys,
//!   regardless of `wait`.
//! - `cache_missing` is whether keys the fetch reports as not found are
//!   cached.
//!
//! The loader also needs a spawner, which runs the batch timers and fetches
//! in the background; `tokio::spawn` is the usual choice.
//!
//! ```
//! # use keyed_batchloader::FetchResult;
//! # #[derive(Debug, Clone, PartialEq)] struct Tag { id: u32, label: String }
//! # async fn fetch_tags(ids: Vec<u32>) -> FetchResult<Tag, String> {
//! #     Ok(ids.into_iter().map(|id| Ok(Some(Tag { id, label: format!("tag-{}", id) }))).collect())
//! # }
//! use std::time::Duration;
//! use futures::executor::ThreadPool;
//! use keyed_batchloader::{KeyedBatchLoader, LoaderConfig};
//!
//! let pool = ThreadPool::new().unwrap();
//! let config = LoaderConfig::default().with_wait(Duration::from_millis(2));
//! let tags = KeyedBatchLoader::new(config, fetch_tags, move |fut| pool.spawn_ok(fut));
//!
//! // Both keys land in the same batch, so fetch_tags is called once.
//! let first = tags.load_deferred(1);
//! let second = tags.load_deferred(2);
//!
//! assert_eq!(first.wait().unwrap().unwrap().label, "tag-1");
//! assert_eq!(second.wait().unwrap().unwrap().label, "tag-2");
//!
//! // Now cached; this doesn't start a batch at all.
//! assert!(tags.load_deferred(1).is_resolved());
//! ```
//!
//! From async code, `loader.load(key).await` and
//! `loader.load_many(keys).await` are the usual entry points. From
//! synchronous code, use [`KeyedBatchLoader::load_blocking`], or create
//! several [`Deferred`] handles first (possibly across different loaders)
//! and [`wait`][Deferred::wait] on them afterwards so that their batches
//! overlap.
//!
//! ## Design notes
//!
//! ### Batches
//!
//! A loader has at most one open batch. The first uncached key opens it and
//! starts its timer; further keys join it, with repeated keys sharing a
//! single position. The batch closes either when the timer fires or when it
//! reaches `max_batch` keys, whichever is first. Closing takes the batch out
//! of the loader under its lock, so exactly one of those two paths
//! dispatches it and the fetch runs exactly once. The next key opens a fresh
//! batch, even while the previous one is still being fetched.
//!
//! ### Results and caching
//!
//! Each batch has a single completion signal, written once by the task that
//! ran the fetch and read by every [`Deferred`] bound to it. Before the
//! signal is written, every key that resolved without an error is stored in
//! the cache; keys that resolved to an error are never cached, so the next
//! load of such a key fetches it again. Nothing is retried automatically.
//!
//! Values are cloned out of the shared result for every caller. If callers
//! should share one instance, use an `Arc` as the value type.
//!
//! ### Errors
//!
//! Fetch errors are reported as [`LoadError::Fetch`]: per key, to just the
//! callers of that key, or shared, to every caller in the batch. A fetch
//! that panics resolves its batch with [`LoadError::Panicked`] rather than
//! leaving callers waiting forever. If the spawner drops a batch's timer or
//! fetch task, its callers get [`LoadError::Dropped`].

mod batch;
mod config;
mod data;
mod deferred;
mod error;
mod loader;

pub use config::LoaderConfig;
pub use data::{align_by_key, FetchResult, KeyedEntry, OnDuplicate};
pub use deferred::{Deferred, DeferredMany, LoadResult};
pub use error::LoadError;
pub use loader::KeyedBatchLoader;
