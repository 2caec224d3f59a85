//! Loader configuration.

use std::{num::NonZeroUsize, time::Duration};

use serde::{Deserialize, Deserializer};

const DEFAULT_WAIT: Duration = Duration::from_millis(1);
const DEFAULT_MAX_BATCH: usize = 100;

/// The rules a [`KeyedBatchLoader`][crate::KeyedBatchLoader] batches by. A
/// config is fixed once the loader is constructed.
///
/// Configs can be deserialized, so that services can carry loader tuning in
/// their own configuration files:
///
/// ```
/// # use keyed_batchloader::LoaderConfig;
/// # use std::time::Duration;
/// let config: LoaderConfig =
///     serde_json::from_str(r#"{ "wait_ms": 5, "max_batch": 0 }"#).unwrap();
///
/// assert_eq!(config.wait, Duration::from_millis(5));
/// assert_eq!(config.max_batch, None);
/// assert!(config.cache_missing);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// How long a batch accumulates keys before it is dispatched.
    #[serde(rename = "wait_ms", deserialize_with = "deserialize_millis")]
    pub wait: Duration,

    /// The maximum number of distinct keys per batch. When a batch reaches
    /// this many keys it is dispatched immediately, without waiting for
    /// `wait` to elapse. `None` (or `0` in a config file) is unbounded.
    #[serde(deserialize_with = "deserialize_max_batch")]
    pub max_batch: Option<NonZeroUsize>,

    /// Whether a key that the fetch reports as absent (no value, no error)
    /// is cached. When false, absent keys are fetched again on the next
    /// load.
    pub cache_missing: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            wait: DEFAULT_WAIT,
            max_batch: NonZeroUsize::new(DEFAULT_MAX_BATCH),
            cache_missing: true,
        }
    }
}

impl LoaderConfig {
    pub fn with_wait(self, wait: Duration) -> Self {
        Self { wait, ..self }
    }

    /// Set the maximum batch size. `0` means unbounded.
    pub fn with_max_batch(self, max_batch: usize) -> Self {
        Self {
            max_batch: NonZeroUsize::new(max_batch),
            ..self
        }
    }

    pub fn with_cache_missing(self, cache_missing: bool) -> Self {
        Self {
            cache_missing,
            ..self
        }
    }
}

fn deserialize_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

fn deserialize_max_batch<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<NonZeroUsize>, D::Error> {
    usize::deserialize(deserializer).map(NonZeroUsize::new)
}
