//! Cache service behaviour against the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use keybox::{
    CacheError, CacheOptions, CacheService, CacheSettings, ConnectionManager, ConnectionOptions,
    RateLimiter, RateLimiterSettings, SingleFlight,
};
use keybox_memory::MemoryConnector;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    id: u64,
    name: String,
}

fn service(settings: CacheSettings) -> CacheService<MemoryConnector> {
    let connection = ConnectionManager::new(MemoryConnector::default(), ConnectionOptions::default());
    CacheService::new(connection, settings)
}

fn ada() -> User {
    User {
        id: 42,
        name: "Ada".to_owned(),
    }
}

#[tokio::test]
async fn value_round_trips_and_counts_hits() {
    let cache = service(CacheSettings::default());

    assert_eq!(cache.get::<User>("user:42").await.unwrap(), None);
    cache.set("user:42", &ada(), &CacheOptions::new()).await.unwrap();
    assert_eq!(cache.get::<User>("user:42").await.unwrap(), Some(ada()));

    let stats = cache.statistics();
    assert_eq!(stats.gets, 2);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.sets, 1);
    assert_eq!(stats.hit_ratio, 0.5);

    cache.reset_statistics();
    assert_eq!(cache.statistics().gets, 0);
}

#[tokio::test]
async fn large_values_are_compressed_unless_opted_out() {
    let cache = service(CacheSettings::default());
    let body = "a".repeat(4096);

    cache.set("big", &body, &CacheOptions::new()).await.unwrap();
    let stats = cache.statistics();
    assert_eq!(stats.compressed_writes, 1);
    assert!(stats.bytes_written < 4096);
    assert_eq!(cache.get::<String>("big").await.unwrap(), Some(body.clone()));

    cache
        .set("raw", &body, &CacheOptions::new().compress(false))
        .await
        .unwrap();
    assert_eq!(cache.statistics().compressed_writes, 1);
    assert_eq!(cache.get::<String>("raw").await.unwrap(), Some(body));
}

#[tokio::test]
async fn small_values_stay_plain() {
    let cache = service(CacheSettings::default());
    cache.set("small", &ada(), &CacheOptions::new()).await.unwrap();
    assert_eq!(cache.statistics().compressed_writes, 0);
}

#[tokio::test]
async fn compressed_entries_are_readable_with_compression_disabled() {
    let connector = MemoryConnector::default();
    let connection = ConnectionManager::new(connector, ConnectionOptions::default());
    let writer = CacheService::new(connection.clone(), CacheSettings::default());
    let reader = CacheService::new(
        connection,
        CacheSettings {
            enable_compression: false,
            ..CacheSettings::default()
        },
    );

    let body = "b".repeat(2048);
    writer.set("shared", &body, &CacheOptions::new()).await.unwrap();
    assert_eq!(reader.get::<String>("shared").await.unwrap(), Some(body));
}

#[tokio::test(start_paused = true)]
async fn sliding_expiration_is_rearmed_by_reads() {
    let cache = service(CacheSettings::default());
    let options = CacheOptions::new().sliding(Duration::from_secs(10));
    cache.set("session", &"token", &options).await.unwrap();

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(cache.get::<String>("session").await.unwrap().is_some());
    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(cache.get::<String>("session").await.unwrap().is_some());

    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(cache.get::<String>("session").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn refresh_extends_sliding_entries() {
    let cache = service(CacheSettings::default());
    let options = CacheOptions::new().sliding(Duration::from_secs(10));
    cache.set("session", &1u32, &options).await.unwrap();

    tokio::time::advance(Duration::from_secs(8)).await;
    cache.refresh("session").await.unwrap();
    tokio::time::advance(Duration::from_secs(8)).await;
    assert!(cache.exists("session").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn absolute_expiration_removes_the_entry() {
    let cache = service(CacheSettings::default());
    let options = CacheOptions::new().absolute(Duration::from_secs(5));
    cache.set("otp", &123456u32, &options).await.unwrap();

    let ttl = cache.get_ttl("otp").await.unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(5));

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(!cache.exists("otp").await.unwrap());
    assert_eq!(cache.get_ttl("otp").await.unwrap(), None);
}

#[tokio::test]
async fn removal_reports_whether_the_key_existed() {
    let cache = service(CacheSettings::default());
    cache.set("k", &1u8, &CacheOptions::new()).await.unwrap();

    assert!(cache.remove("k").await.unwrap());
    assert!(!cache.remove("k").await.unwrap());
    assert_eq!(cache.get::<u8>("k").await.unwrap(), None);
    assert_eq!(cache.statistics().removes, 1);
}

#[tokio::test]
async fn tags_group_keys_for_removal() {
    let cache = service(CacheSettings::default());
    let tagged = CacheOptions::new().tag("users");
    cache.set("user:1", &1u32, &tagged).await.unwrap();
    cache.set("user:2", &2u32, &tagged).await.unwrap();
    cache.set("order:1", &3u32, &CacheOptions::new()).await.unwrap();

    assert_eq!(cache.remove_by_tag("users").await.unwrap(), 2);
    assert!(!cache.exists("user:1").await.unwrap());
    assert!(cache.exists("order:1").await.unwrap());
    assert_eq!(cache.remove_by_tag("users").await.unwrap(), 0);
}

#[tokio::test]
async fn patterns_stay_inside_the_namespace() {
    let connection = ConnectionManager::new(MemoryConnector::default(), ConnectionOptions::default());
    let app = CacheService::new(connection.clone(), CacheSettings::default());
    let other = CacheService::new(
        connection,
        CacheSettings {
            namespace: keybox::Namespace::new("other"),
            ..CacheSettings::default()
        },
    );
    for key in ["user:1", "user:2", "order:1"] {
        app.set(key, &key, &CacheOptions::new()).await.unwrap();
        other.set(key, &key, &CacheOptions::new()).await.unwrap();
    }

    assert_eq!(app.remove_by_pattern("user:*").await.unwrap(), 2);
    assert!(app.exists("order:1").await.unwrap());
    assert!(other.exists("user:1").await.unwrap());
}

#[tokio::test]
async fn cache_keys_do_not_collide_with_tag_indexes() {
    let cache = service(CacheSettings::default());
    let tagged = CacheOptions::new().tag("news");

    cache.set("news:1", &1u32, &tagged).await.unwrap();
    cache.set("tag:news", &"hello", &CacheOptions::new()).await.unwrap();
    cache.set("news:2", &2u32, &tagged).await.unwrap();

    assert_eq!(cache.get::<String>("tag:news").await.unwrap().as_deref(), Some("hello"));
    assert_eq!(cache.remove_by_tag("news").await.unwrap(), 2);
    assert!(cache.exists("tag:news").await.unwrap());
}

#[tokio::test]
async fn wildcard_removal_leaves_rate_limit_windows_alone() {
    let connection = ConnectionManager::new(MemoryConnector::default(), ConnectionOptions::default());
    let cache = CacheService::new(connection.clone(), CacheSettings::default());
    let limiter = RateLimiter::new(
        connection,
        RateLimiterSettings {
            database: None,
            ..RateLimiterSettings::default()
        },
    );
    let window = Duration::from_secs(60);

    for _ in 0..2 {
        let result = limiter.is_request_allowed("alice", "api", 2, window).await.unwrap();
        assert!(result.allowed);
    }
    cache.set("user:1", &1u8, &CacheOptions::new()).await.unwrap();

    assert_eq!(cache.remove_by_pattern("*").await.unwrap(), 1);
    let result = limiter.is_request_allowed("alice", "api", 2, window).await.unwrap();
    assert!(!result.allowed);
    assert_eq!(result.current_count, 2);
}

#[tokio::test]
async fn invalid_keys_are_rejected_before_the_store() {
    let cache = service(CacheSettings {
        namespace: keybox::Namespace::new("app").with_max_key_length(16),
        ..CacheSettings::default()
    });

    assert!(cache.get::<u8>("").await.unwrap_err().is_validation());
    let long = "k".repeat(32);
    let error = cache.set(&long, &1u8, &CacheOptions::new()).await.unwrap_err();
    assert!(error.is_validation());
    assert_eq!(cache.statistics().gets, 0);
}

#[tokio::test]
async fn undecodable_entries_read_as_misses() {
    let cache = service(CacheSettings::default());
    cache.set("k", &"text", &CacheOptions::new()).await.unwrap();

    assert_eq!(cache.get::<User>("k").await.unwrap(), None);
    let stats = cache.statistics();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.errors, 1);
}

#[tokio::test]
async fn batches_are_partial_not_atomic() {
    let cache = service(CacheSettings::default());
    let items = vec![("a", 1u32), ("", 2), ("c", 3)];

    let outcome = cache.set_batch(items, &CacheOptions::new()).await.unwrap();
    assert_eq!(outcome.requested, 3);
    assert_eq!(outcome.succeeded, 2);
    assert_eq!(outcome.failed(), 1);
    assert!(!outcome.is_complete());

    assert_eq!(cache.get::<u32>("c").await.unwrap(), Some(3));
    assert_eq!(cache.remove_batch(&["a", "c", "missing"]).await.unwrap(), 2);
}

#[tokio::test]
async fn get_or_set_caches_the_factory_value() {
    let cache = service(CacheSettings::default());
    let counter = AtomicUsize::new(0);
    let calls = &counter;
    let factory = move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, std::io::Error>(ada())
    };

    let first: User = cache
        .get_or_set("user:42", &CacheOptions::new(), factory)
        .await
        .unwrap();
    let second: User = cache
        .get_or_set("user:42", &CacheOptions::new(), factory)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn factory_failures_are_reported() {
    let cache = service(CacheSettings::default());
    let result = cache
        .get_or_set("k", &CacheOptions::new(), || async {
            Err::<u32, _>(std::io::Error::other("upstream down"))
        })
        .await;
    assert!(matches!(result, Err(CacheError::Factory(_))));
    assert!(!cache.exists("k").await.unwrap());
}

async fn concurrent_misses(single_flight: SingleFlight) -> usize {
    let cache = service(CacheSettings {
        single_flight,
        ..CacheSettings::default()
    });
    let options = CacheOptions::new();
    let counter = AtomicUsize::new(0);
    let calls = &counter;
    let lookups = (0..8).map(|_| {
        cache.get_or_set("hot", &options, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, std::io::Error>(7u32)
        })
    });
    for value in join_all(lookups).await {
        assert_eq!(value.unwrap(), 7);
    }
    counter.load(Ordering::SeqCst)
}

#[tokio::test(start_paused = true)]
async fn concurrent_misses_each_run_the_factory_by_default() {
    assert_eq!(concurrent_misses(SingleFlight::Disabled).await, 8);
}

#[tokio::test(start_paused = true)]
async fn single_flight_runs_the_factory_once() {
    assert_eq!(concurrent_misses(SingleFlight::Enabled).await, 1);
}

#[tokio::test]
async fn cancellation_is_not_a_miss() {
    let cache = service(CacheSettings::default());
    let token = CancellationToken::new();
    let cancellable = cache.with_cancellation(token.clone());
    token.cancel();

    assert!(cancellable.get::<u8>("k").await.unwrap_err().is_cancelled());
    assert!(matches!(
        cancellable.set("k", &1u8, &CacheOptions::new()).await,
        Err(CacheError::Cancelled)
    ));
    assert_eq!(cache.statistics().misses, 0);
    // The original service is unaffected.
    assert_eq!(cache.get::<u8>("k").await.unwrap(), None);
}
