//! These tests are intended to ensure that a fetch function is called the
//! correct number of times, with the correct keys, for different
//! configurations

use futures::{executor::ThreadPool, future::BoxFuture};
use keyed_batchloader::{FetchResult, KeyedBatchLoader, LoadError, LoaderConfig};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

type Calls = Arc<Mutex<Vec<Vec<u32>>>>;

async fn stringify(keys: Vec<u32>) -> FetchResult<String, String> {
    Ok(keys.iter().map(|key| Ok(Some(key.to_string()))).collect())
}

/// Wrap a fetch function so that the keys of every batch it is called with
/// are recorded, in call order.
fn recording<F, Fut>(calls: &Calls, fetch: F) -> impl Fn(Vec<u32>) -> Fut + Send + Sync + 'static
where
    F: Fn(Vec<u32>) -> Fut + Send + Sync + 'static,
{
    let calls = Arc::clone(calls);
    move |keys| {
        calls.lock().push(keys.clone());
        fetch(keys)
    }
}

fn spawner() -> impl Fn(BoxFuture<'static, ()>) + Send + Sync + 'static {
    let pool = ThreadPool::new().unwrap();
    move |fut| pool.spawn_ok(fut)
}

fn config(wait_ms: u64, max_batch: usize) -> LoaderConfig {
    LoaderConfig::default()
        .with_wait(Duration::from_millis(wait_ms))
        .with_max_batch(max_batch)
}

fn stringify_loader(config: LoaderConfig) -> (KeyedBatchLoader<u32, String, String>, Calls) {
    let calls = Calls::default();
    let loader = KeyedBatchLoader::new(config, recording(&calls, stringify), spawner());
    (loader, calls)
}

#[test]
fn simple_test() {
    let (loader, calls) = stringify_loader(config(10, 0));

    let fut1 = loader.load_deferred(10);
    let fut2 = loader.load_deferred(20);

    assert_eq!(fut1.wait().unwrap().unwrap(), "10");
    assert_eq!(fut2.wait().unwrap().unwrap(), "20");
    assert_eq!(*calls.lock(), vec![vec![10, 20]]);
}

#[test]
fn low_key_test() {
    let (loader, calls) = stringify_loader(config(20, 2));

    let fut1 = loader.load_deferred(10);
    let fut2 = loader.load_deferred(20);
    let fut3 = loader.load_deferred(30);

    assert_eq!(fut1.wait().unwrap().unwrap(), "10");
    assert_eq!(fut2.wait().unwrap().unwrap(), "20");
    assert_eq!(fut3.wait().unwrap().unwrap(), "30");

    // The first batch is dispatched as soon as it is full; the second waits
    // for its timer.
    assert_eq!(*calls.lock(), vec![vec![10, 20], vec![30]]);
}

#[test]
fn test_duplicate_keys() {
    let (loader, calls) = stringify_loader(config(1000, 2));

    let fut1 = loader.load_deferred(10);
    let fut2 = loader.load_deferred(10);
    let fut3 = loader.load_deferred(10);

    // Note that duplicates don't count towards max_batch. The batch is
    // dispatched *immediately* when the second distinct key arrives, long
    // before the window closes.
    let fut4 = loader.load_deferred(20);

    assert_eq!(fut1.wait().unwrap().unwrap(), "10");
    assert_eq!(fut2.wait().unwrap().unwrap(), "10");
    assert_eq!(fut3.wait().unwrap().unwrap(), "10");
    assert_eq!(fut4.wait().unwrap().unwrap(), "20");
    assert_eq!(*calls.lock(), vec![vec![10, 20]]);
}

#[test]
fn test_timer_bound() {
    let fetched_at = Arc::new(Mutex::new(None));
    let recorded = Arc::clone(&fetched_at);

    let loader = KeyedBatchLoader::new(
        config(50, 10),
        move |keys: Vec<u32>| {
            *recorded.lock() = Some(Instant::now());
            stringify(keys)
        },
        spawner(),
    );

    let start = Instant::now();
    let fut = loader.load_deferred(1);
    assert_eq!(fut.wait().unwrap().unwrap(), "1");

    let fetched_at = (*fetched_at.lock()).expect("fetch was called");
    let elapsed = fetched_at - start;
    assert!(elapsed >= Duration::from_millis(50), "fetched after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "fetched after {:?}", elapsed);
}

#[test]
fn test_positional_alignment() {
    let (loader, calls) = stringify_loader(config(10, 0));

    assert!(loader.prime(5, String::from("five")));

    let results = loader.load_many_blocking(vec![3, 5, 1, 3, 2]);
    let results: Vec<String> = results
        .into_iter()
        .map(|result| result.unwrap().unwrap())
        .collect();

    assert_eq!(results, &["3", "five", "1", "3", "2"]);

    // The primed key and the duplicate never reach the fetch
    assert_eq!(*calls.lock(), vec![vec![3, 1, 2]]);
}

#[test]
fn test_error_isolation() {
    let calls = Calls::default();

    // Even keys are found; odd keys fail individually
    let fetch = recording(&calls, |keys: Vec<u32>| async move {
        let results = keys
            .iter()
            .map(|&key| match key % 2 {
                0 => Ok(Some(key.to_string())),
                _ => Err(format!("no {}", key)),
            })
            .collect();

        FetchResult::<String, String>::Ok(results)
    });

    let loader = KeyedBatchLoader::new(config(10, 0), fetch, spawner());

    let found = loader.load_deferred(2);
    let failed = loader.load_deferred(3);

    assert_eq!(found.wait(), Ok(Some(String::from("2"))));
    assert_eq!(failed.wait(), Err(LoadError::Fetch(String::from("no 3"))));

    assert!(loader.is_cached(&2));
    assert!(!loader.is_cached(&3));

    // The failed key is fetched again; the found one is served from cache
    assert_eq!(
        loader.load_blocking(3),
        Err(LoadError::Fetch(String::from("no 3")))
    );
    assert_eq!(loader.load_blocking(2), Ok(Some(String::from("2"))));
    assert_eq!(*calls.lock(), vec![vec![2, 3], vec![3]]);
}

#[test]
fn test_shared_error() {
    let calls = Calls::default();
    let fetch = recording(&calls, |_keys: Vec<u32>| async {
        FetchResult::<String, String>::Err(String::from("backend down"))
    });

    let loader = KeyedBatchLoader::new(config(10, 0), fetch, spawner());

    let results = loader.load_many_blocking(vec![1, 2, 3]);
    for result in results {
        assert_eq!(result, Err(LoadError::Fetch(String::from("backend down"))));
    }

    assert!(!loader.is_cached(&1));
    assert_eq!(calls.lock().len(), 1);
}

#[test]
fn test_short_results_are_absent() {
    let calls = Calls::default();
    let fetch = recording(&calls, |keys: Vec<u32>| async move {
        // Answer only the first key
        FetchResult::<String, String>::Ok(vec![Ok(Some(keys[0].to_string()))])
    });

    let loader = KeyedBatchLoader::new(config(10, 0), fetch, spawner());

    let results = loader.load_many_blocking(vec![7, 8, 9]);
    assert_eq!(results, vec![Ok(Some(String::from("7"))), Ok(None), Ok(None)]);
}

#[test]
fn test_panicking_fetch() {
    let calls = Calls::default();
    let fetch = recording(&calls, |keys: Vec<u32>| async move {
        if keys.contains(&13) {
            panic!("unlucky key");
        }
        stringify(keys).await
    });

    let loader = KeyedBatchLoader::new(config(10, 0), fetch, spawner());

    let unlucky = loader.load_many_blocking(vec![12, 13]);
    assert_eq!(unlucky, vec![Err(LoadError::Panicked), Err(LoadError::Panicked)]);
    assert!(!loader.is_cached(&12));

    // The loader keeps working for later batches
    assert_eq!(loader.load_blocking(14), Ok(Some(String::from("14"))));
}

/// Load keys from several threads, and confirm that a single batch call was
/// made fulfilling all of them
#[test]
fn test_threaded() {
    let (loader, calls) = stringify_loader(config(100, 0));
    let loader_ref = &loader;

    let result: Vec<String> = crossbeam::scope(move |s| {
        let threads: Vec<_> = (0..4u32)
            .map(move |i| {
                s.spawn(move |_s| {
                    thread::sleep(Duration::from_millis(u64::from(i) + 2));
                    loader_ref.load_blocking(i).unwrap().unwrap()
                })
            })
            .collect();

        threads.into_iter().map(|t| t.join().unwrap()).collect()
    })
    .unwrap();

    assert_eq!(result, &["0", "1", "2", "3"]);

    let calls = calls.lock();
    assert_eq!(calls.len(), 1);

    let mut keys = calls[0].clone();
    keys.sort_unstable();
    assert_eq!(keys, vec![0, 1, 2, 3]);
}

/// Hammer a loader from several threads with a small batch limit; no fetch
/// may ever see more keys than the limit, or the same key twice.
#[test]
fn test_threaded_batch_limit() {
    let (loader, calls) = stringify_loader(config(5, 5));
    let loader_ref = &loader;

    crossbeam::scope(move |s| {
        for t in 0..8u32 {
            s.spawn(move |_s| {
                let keys: Vec<u32> = (0..10).map(|i| (t * 3 + i) % 40).collect();
                let results = loader_ref.load_many_blocking(keys.clone());

                for (key, result) in keys.iter().zip(results) {
                    assert_eq!(result.unwrap().unwrap(), key.to_string());
                }
            });
        }
    })
    .unwrap();

    for call in calls.lock().iter() {
        assert!(!call.is_empty());
        assert!(call.len() <= 5, "batch too large: {:?}", call);

        let mut keys = call.clone();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), call.len(), "duplicate key in batch: {:?}", call);
    }
}
