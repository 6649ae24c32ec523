//! Behaviour of queries sharing a cache: freshness, deduplication, fan-out
//! and key changes.

use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use swr_kit::{QueryCache, QueryMetrics, QueryOptions, Signal};
use tokio::sync::Notify;
use uuid::Uuid;

type Cache = QueryCache<Value, Value>;
type Outcome = Result<Value, Value>;

/// Scripted fetcher: hands out queued outcomes in order and counts calls.
#[derive(Clone, Default)]
struct MockFetcher {
    calls: Arc<AtomicUsize>,
    outcomes: Arc<Mutex<VecDeque<Outcome>>>,
    delay: Duration,
}

impl MockFetcher {
    fn new(outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        MockFetcher {
            outcomes: Arc::new(Mutex::new(outcomes.into_iter().collect())),
            ..Default::default()
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn push(&self, outcome: Outcome) {
        self.outcomes
            .lock()
            .expect("Failed to lock outcomes")
            .push_back(outcome);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fetcher(&self) -> impl Fn() -> BoxFuture<'static, Outcome> + Send + Sync + 'static {
        let mock = self.clone();
        move || {
            mock.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = mock
                .outcomes
                .lock()
                .expect("Failed to lock outcomes")
                .pop_front()
                .unwrap_or(Ok(Value::Null));
            let delay = mock.delay;
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                outcome
            }
            .boxed()
        }
    }
}

fn unique_key() -> String {
    format!("test:{}", Uuid::now_v7())
}

async fn sleep(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[tokio::test(start_paused = true)]
async fn test_fetch_success_updates_state() {
    let _ = env_logger::builder().is_test(true).try_init();
    let cache = Cache::new();
    let response = json!({ "message": "Hello, world!", "code": 1 });
    let mock = MockFetcher::new([Ok(response.clone())]);

    let query = cache
        .subscribe(unique_key(), mock.fetcher(), QueryOptions::default())
        .expect("Failed to subscribe");
    assert_eq!(mock.calls(), 1);

    sleep(10).await;

    assert_eq!(query.data(), Some(response));
    assert_eq!(query.error(), None);
    assert!(!query.is_validating());
    assert!(!query.is_loading());
}

#[tokio::test(start_paused = true)]
async fn test_fetch_failure_updates_state() {
    let cache = Cache::new();
    let failure = json!({ "message": "Hello, world!", "code": 1 });
    let mock = MockFetcher::new([Err(failure.clone())]);

    let query = cache
        .subscribe(unique_key(), mock.fetcher(), QueryOptions::default())
        .expect("Failed to subscribe");

    assert_eq!(mock.calls(), 1);
    assert!(query.is_validating());
    assert!(query.is_loading());

    sleep(10).await;

    assert_eq!(query.data(), None);
    assert_eq!(query.error(), Some(failure));
    assert!(!query.is_validating());
    assert!(!query.is_loading());
}

#[tokio::test(start_paused = true)]
async fn test_valid_cache_is_served_then_revalidated() {
    let cache = Cache::new();
    let key = unique_key();
    let mock = MockFetcher::new([
        Ok(json!({ "code": 1 })),
        Ok(json!({ "code": 2 })),
        Ok(json!({ "code": 3 })),
    ]);
    let subscribe = || {
        cache
            .subscribe(
                key.as_str(),
                mock.fetcher(),
                QueryOptions::new()
                    .with_ttl(Duration::from_millis(20))
                    .with_deduping_interval(Duration::from_millis(1)),
            )
            .expect("Failed to subscribe")
    };

    let first = subscribe();
    sleep(10).await;

    assert_eq!(mock.calls(), 1);
    assert_eq!(first.data(), Some(json!({ "code": 1 })));

    // within ttl: cached value served synchronously, refreshed past dedupe
    let second = subscribe();
    assert_eq!(mock.calls(), 2);
    assert_eq!(second.data(), Some(json!({ "code": 1 })));

    sleep(10).await;
    assert_eq!(second.data(), Some(json!({ "code": 2 })));

    // ttl expired: nothing served, refetched
    sleep(40).await;
    let third = subscribe();
    assert_eq!(mock.calls(), 3);
    assert_eq!(third.data(), None);

    sleep(10).await;
    assert_eq!(third.data(), Some(json!({ "code": 3 })));
}

#[tokio::test(start_paused = true)]
async fn test_valid_cache_read_does_not_call_fetcher() {
    let cache = Cache::new();
    let key = unique_key();
    let warm = MockFetcher::new([Ok(json!("cached"))]);
    let cold = MockFetcher::new([Ok(json!("fresh"))]);
    let options = || QueryOptions::new().with_deduping_interval(Duration::ZERO);

    let _first = cache
        .subscribe(key.as_str(), warm.fetcher(), options())
        .expect("Failed to subscribe");
    sleep(10).await;

    let second = cache
        .subscribe(key.as_str(), cold.fetcher(), options())
        .expect("Failed to subscribe");

    assert_eq!(second.data(), Some(json!("cached")));
    assert_eq!(cold.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_is_loading_excludes_background_revalidation() {
    let cache = Cache::new();
    let mock = MockFetcher::new([Ok(json!({ "code": 1 }))]).with_delay(Duration::from_millis(5));

    let query = cache
        .subscribe(unique_key(), mock.fetcher(), QueryOptions::default())
        .expect("Failed to subscribe");
    assert!(query.is_loading());

    sleep(10).await;
    assert!(!query.is_loading());

    query.refresh();
    assert!(query.is_validating());
    assert!(!query.is_loading());
}

#[tokio::test(start_paused = true)]
async fn test_absent_key_waits_for_signal() {
    let cache = Cache::new();
    let response = json!({ "code": 1 });
    let mock = MockFetcher::new([Ok(response.clone())]);
    let dependent = Signal::new(None::<String>);

    let query = cache
        .subscribe(&dependent, mock.fetcher(), QueryOptions::default())
        .expect("Failed to subscribe");
    sleep(10).await;

    assert_eq!(mock.calls(), 0);
    assert!(cache.is_empty());

    dependent.set(Some(unique_key()));
    sleep(10).await;

    assert_eq!(mock.calls(), 1);
    assert_eq!(query.data(), Some(response));
}

#[tokio::test(start_paused = true)]
async fn test_dedupe_window_shares_one_fetch() {
    let cache = Cache::new();
    let key = unique_key();
    let r1 = json!({ "code": 1 });
    let r2 = json!({ "code": 2 });
    let mock = MockFetcher::new([Ok(r1.clone()), Ok(r2.clone())]);
    let subscribe = || {
        cache
            .subscribe(
                key.as_str(),
                mock.fetcher(),
                QueryOptions::new().with_deduping_interval(Duration::from_millis(100)),
            )
            .expect("Failed to subscribe")
    };

    let q1 = subscribe();
    let q2 = subscribe();
    sleep(10).await;

    assert_eq!(mock.calls(), 1);
    assert_eq!(q1.data(), Some(r1.clone()));
    assert_eq!(q2.data(), Some(r1.clone()));

    let q3 = subscribe();
    sleep(10).await;

    assert_eq!(mock.calls(), 1);
    assert_eq!(q3.data(), Some(r1));

    sleep(100).await;
    let q4 = subscribe();
    sleep(10).await;

    assert_eq!(mock.calls(), 2);
    for query in [&q1, &q2, &q3, &q4] {
        assert_eq!(query.data(), Some(r2.clone()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_consumers_see_consistent_data() {
    let cache = Cache::new();
    let key = unique_key();
    let mock = MockFetcher::new([
        Ok(json!({ "code": 1 })),
        Ok(json!({ "code": 2 })),
        Ok(json!({ "code": 3 })),
    ]);

    let q1 = cache
        .subscribe(key.as_str(), mock.fetcher(), QueryOptions::default())
        .expect("Failed to subscribe");
    let q2 = cache
        .subscribe(key.as_str(), mock.fetcher(), QueryOptions::default())
        .expect("Failed to subscribe");
    sleep(10).await;

    assert_eq!(mock.calls(), 1);
    assert_eq!(q1.data(), Some(json!({ "code": 1 })));
    assert_eq!(q2.data(), Some(json!({ "code": 1 })));

    q1.refresh();
    sleep(10).await;

    assert_eq!(mock.calls(), 2);
    assert_eq!(q1.data(), Some(json!({ "code": 2 })));
    assert_eq!(q2.data(), Some(json!({ "code": 2 })));

    q2.refresh();
    sleep(10).await;

    assert_eq!(mock.calls(), 3);
    assert_eq!(q1.data(), Some(json!({ "code": 3 })));
    assert_eq!(q2.data(), Some(json!({ "code": 3 })));

    let failure = json!({ "message": "error message", "code": 4 });
    mock.push(Err(failure.clone()));
    q1.refresh();
    sleep(10).await;

    assert_eq!(mock.calls(), 4);
    assert_eq!(q1.data(), None);
    assert_eq!(q2.data(), None);
    assert_eq!(q1.error(), Some(failure.clone()));
    assert_eq!(q2.error(), Some(failure));
}

#[tokio::test(start_paused = true)]
async fn test_disposed_consumer_stops_updating() {
    let cache = Cache::new();
    let key = unique_key();
    let mock = MockFetcher::new([
        Ok(json!({ "code": 1 })),
        Ok(json!({ "code": 2 })),
        Ok(json!({ "code": 3 })),
    ]);
    let options = || QueryOptions::new().with_deduping_interval(Duration::from_millis(1));

    let q1 = cache
        .subscribe(key.as_str(), mock.fetcher(), options())
        .expect("Failed to subscribe");
    sleep(10).await;

    let q2 = cache
        .subscribe(key.as_str(), mock.fetcher(), options())
        .expect("Failed to subscribe");
    sleep(10).await;

    q1.dispose();

    q2.refresh();
    sleep(10).await;

    assert_eq!(mock.calls(), 3);
    assert_eq!(q1.data(), Some(json!({ "code": 2 })));
    assert_eq!(q2.data(), Some(json!({ "code": 3 })));
}

#[tokio::test(start_paused = true)]
async fn test_key_change_isolates_old_key() {
    let cache = Cache::new();
    let before = unique_key();
    let after = unique_key();
    let mock = MockFetcher::new([
        Ok(json!({ "code": 1 })),
        Ok(json!({ "code": 2 })),
        Ok(json!({ "code": 3 })),
        Ok(json!({ "code": 4 })),
    ]);
    let options = || QueryOptions::new().with_deduping_interval(Duration::from_millis(1));

    let q1 = cache
        .subscribe(before.as_str(), mock.fetcher(), options())
        .expect("Failed to subscribe");
    sleep(10).await;

    let will_change = Signal::new(Some(before.clone()));
    let q2 = cache
        .subscribe(&will_change, mock.fetcher(), options())
        .expect("Failed to subscribe");
    sleep(10).await;

    will_change.set(Some(after.clone()));
    sleep(10).await;

    q1.refresh();
    sleep(10).await;

    assert_eq!(mock.calls(), 4);
    assert_eq!(q1.data(), Some(json!({ "code": 4 })));
    assert_eq!(q2.data(), Some(json!({ "code": 3 })));
    assert_eq!(q2.key(), Some(after));
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_fetch_for_old_key_is_ignored() {
    let cache = Cache::new();
    let old_key = unique_key();
    let new_key = unique_key();
    let mock = MockFetcher::new([Ok(json!("old")), Ok(json!("new"))])
        .with_delay(Duration::from_millis(5));
    let key = Signal::new(Some(old_key.clone()));

    let query = cache
        .subscribe(&key, mock.fetcher(), QueryOptions::default())
        .expect("Failed to subscribe");
    key.set(Some(new_key.clone()));
    sleep(10).await;

    assert_eq!(mock.calls(), 2);
    assert_eq!(query.data(), Some(json!("new")));

    // the old fetch was not cancelled, it only stopped reaching this query
    let old_entry = cache.snapshot(&old_key).expect("old entry is kept");
    assert_eq!(old_entry.data, Some(json!("old")));
    assert_eq!(old_entry.listener_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_during_fetch_is_dropped() {
    let cache = Cache::new();
    let mock = MockFetcher::new([Ok(json!({ "code": 1 })), Ok(json!({ "code": 2 }))])
        .with_delay(Duration::from_millis(5));

    let query = cache
        .subscribe(
            unique_key(),
            mock.fetcher(),
            QueryOptions::new().with_deduping_interval(Duration::from_millis(1)),
        )
        .expect("Failed to subscribe");
    query.refresh();
    sleep(10).await;

    assert_eq!(mock.calls(), 1);
    assert_eq!(query.data(), Some(json!({ "code": 1 })));
}

#[tokio::test(start_paused = true)]
async fn test_initial_value_on_start_and_failure() {
    let cache = Cache::new();
    let initial = json!("initial data");
    let mock = MockFetcher::new([Err(json!("error data"))]);

    let query = cache
        .subscribe(
            unique_key(),
            mock.fetcher(),
            QueryOptions::new().with_initial_value(initial.clone()),
        )
        .expect("Failed to subscribe");
    assert_eq!(query.data(), Some(initial.clone()));

    sleep(10).await;
    assert_eq!(query.data(), Some(initial));
    assert_eq!(query.error(), Some(json!("error data")));

    mock.push(Ok(json!("async data")));
    query.refresh();
    sleep(10).await;

    assert_eq!(query.data(), Some(json!("async data")));
    assert_eq!(query.error(), None);

    // a successful empty result replaces the data, initial value or not
    mock.push(Ok(Value::Null));
    query.refresh();
    sleep(10).await;

    assert_eq!(query.data(), Some(Value::Null));
}

#[tokio::test(start_paused = true)]
async fn test_on_update_fires_for_cached_and_fresh_data() {
    let cache = Cache::new();
    let key = unique_key();
    let mock = MockFetcher::new([
        Ok(json!({ "code": 1 })),
        Ok(json!({ "code": 2 })),
        Ok(json!({ "code": 3 })),
    ]);
    let options = || QueryOptions::new().with_deduping_interval(Duration::from_millis(1));

    let _first = cache
        .subscribe(key.as_str(), mock.fetcher(), options())
        .expect("Failed to subscribe");
    sleep(10).await;

    let updates = Arc::new(Mutex::new(Vec::new()));
    let log = updates.clone();
    let _second = cache
        .subscribe(
            key.as_str(),
            mock.fetcher(),
            options().on_update(move |data| {
                log.lock().expect("Failed to lock updates").push(data.clone());
            }),
        )
        .expect("Failed to subscribe");
    sleep(10).await;

    let updates = updates.lock().expect("Failed to lock updates");
    assert_eq!(*updates, vec![json!({ "code": 1 }), json!({ "code": 2 })]);
}

#[tokio::test(start_paused = true)]
async fn test_metrics_see_hits_and_misses() {
    #[derive(Default)]
    struct Counting {
        hits: AtomicUsize,
        misses: AtomicUsize,
        errors: AtomicUsize,
    }

    impl QueryMetrics for Counting {
        fn record_hit(&self, _key: &str) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }

        fn record_miss(&self, _key: &str) {
            self.misses.fetch_add(1, Ordering::SeqCst);
        }

        fn record_error(&self, _key: &str, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    let metrics = Arc::new(Counting::default());
    let cache = Cache::new().with_metrics(metrics.clone());
    let key = unique_key();
    let mock = MockFetcher::new([Ok(json!(1)), Err(json!("down"))]);

    let _miss = cache
        .subscribe(key.as_str(), mock.fetcher(), QueryOptions::default())
        .expect("Failed to subscribe");
    sleep(10).await;
    let hit = cache
        .subscribe(key.as_str(), mock.fetcher(), QueryOptions::default())
        .expect("Failed to subscribe");
    hit.refresh();
    sleep(10).await;

    assert_eq!(metrics.misses.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.hits.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.errors.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_subscribers_trigger_single_fetch() {
    let cache = Cache::new();
    let key = unique_key();
    let mock = MockFetcher::new([Ok(json!({ "shared": true }))])
        .with_delay(Duration::from_millis(50));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            let key = key.clone();
            let fetcher = mock.fetcher();
            tokio::spawn(async move {
                cache
                    .subscribe(key, fetcher, QueryOptions::default())
                    .expect("Failed to subscribe")
            })
        })
        .collect();

    let mut queries = Vec::new();
    for handle in handles {
        queries.push(handle.await.expect("subscriber task panicked"));
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(mock.calls(), 1);
    for query in &queries {
        assert_eq!(query.data(), Some(json!({ "shared": true })));
        assert!(!query.is_validating());
    }
    assert_eq!(cache.snapshot(&key).map(|s| s.listener_count), Some(16));
}

/// Releases a parked fetch from inside the hit hook, then holds the
/// subscriber between reading its entry and copying it.
struct SettleOnHit {
    gate: Arc<Notify>,
    armed: AtomicBool,
}

impl QueryMetrics for SettleOnHit {
    fn record_hit(&self, _key: &str) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.gate.notify_one();
            std::thread::sleep(Duration::from_millis(200));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fetch_settling_during_subscribe_is_not_overwritten() {
    let gate = Arc::new(Notify::new());
    let metrics = Arc::new(SettleOnHit {
        gate: gate.clone(),
        armed: AtomicBool::new(false),
    });
    let cache = Cache::new().with_metrics(metrics.clone());
    let key = unique_key();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let parked = gate.clone();
    let fetcher = move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let gate = parked.clone();
        async move {
            if n > 1 {
                gate.notified().await;
            }
            Ok::<_, Value>(json!(format!("v{}", n)))
        }
    };

    let first = cache
        .subscribe(key.as_str(), fetcher, QueryOptions::default())
        .expect("Failed to subscribe");
    tokio::time::timeout(Duration::from_secs(5), async {
        while first.data().is_none() {
            sleep(5).await;
        }
    })
    .await
    .expect("first fetch never settled");

    first.refresh();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    metrics.armed.store(true, Ordering::SeqCst);

    let second = cache
        .subscribe(
            key.as_str(),
            || async { Ok::<_, Value>(Value::Null) },
            QueryOptions::new().with_deduping_interval(Duration::ZERO),
        )
        .expect("Failed to subscribe");
    sleep(50).await;

    let entry = cache.snapshot(&key).expect("entry exists");
    assert_eq!(entry.data, Some(json!("v2")));
    assert!(!entry.is_validating);
    assert_eq!(second.data(), entry.data);
    assert_eq!(second.is_validating(), entry.is_validating);
    assert_eq!(first.data(), Some(json!("v2")));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
