//! Behaviour of the services while the store misbehaves.

use std::time::Duration;

use futures::future::join_all;
use keybox::{
    CacheError, CacheOptions, CacheService, CacheSettings, ConnectionManager, ConnectionOptions,
    FaultKind, RateLimiter, RateLimiterSettings, RetryPolicy,
};
use keybox_test::tracing::capture_events;
use keybox_test::{Fault, FaultyConnector};
use tracing::Level;

fn options(retries: u32) -> ConnectionOptions {
    ConnectionOptions {
        retry: RetryPolicy::new(retries, Duration::from_millis(5)),
        ..ConnectionOptions::default()
    }
}

#[tokio::test(start_paused = true)]
async fn transient_faults_are_invisible_to_callers() {
    let connector = FaultyConnector::default();
    let connection = ConnectionManager::new(connector.clone(), options(3));
    let cache = CacheService::new(connection.clone(), CacheSettings::default());

    connector.fail_next_commands(2);
    cache.set("k", &"v", &CacheOptions::new()).await.unwrap();
    assert_eq!(cache.get::<String>("k").await.unwrap().as_deref(), Some("v"));

    let stats = connection.statistics();
    assert_eq!(stats.successful_retries, 1);
    assert_eq!(connector.counters().failed_commands(), 2);
}

#[tokio::test(start_paused = true)]
async fn read_failures_degrade_to_logged_misses() {
    let (events, _guard) = capture_events();
    let connector = FaultyConnector::default();
    let cache = CacheService::new(
        ConnectionManager::new(connector.clone(), options(1)),
        CacheSettings::default(),
    );
    connector.fail_commands(Fault::Transient);

    assert_eq!(cache.get::<String>("k").await.unwrap(), None);
    assert!(!cache.exists("k").await.unwrap());
    assert_eq!(cache.get_ttl("k").await.unwrap(), None);

    let stats = cache.statistics();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.errors, 3);
    assert_eq!(events.count("Cache operation degraded"), 3);
    assert!(events.has_event(Level::ERROR, "Retries exhausted"));
}

#[tokio::test]
async fn write_failures_are_surfaced() {
    let connector = FaultyConnector::default();
    let cache = CacheService::new(
        ConnectionManager::new(connector.clone(), options(0)),
        CacheSettings::default(),
    );
    connector.fail_commands(Fault::Fatal);

    let error = cache.set("k", &1u8, &CacheOptions::new()).await.unwrap_err();
    assert!(matches!(error, CacheError::Store(ref e) if e.kind() == FaultKind::Fatal));
    assert!(cache.remove("k").await.is_err());
    assert_eq!(cache.statistics().sets, 0);
}

#[tokio::test]
async fn get_or_set_returns_the_value_when_caching_fails() {
    let connector = FaultyConnector::default();
    let cache = CacheService::new(
        ConnectionManager::new(connector.clone(), options(0)),
        CacheSettings::default(),
    );
    connector.reject_key("keybox:cache:report");

    let value: u32 = cache
        .get_or_set("report", &CacheOptions::new(), || async {
            Ok::<_, std::io::Error>(42)
        })
        .await
        .unwrap();
    assert_eq!(value, 42);
    assert_eq!(cache.statistics().sets, 0);
}

#[tokio::test]
async fn concurrent_first_use_connects_once() {
    let connector = FaultyConnector::default();
    connector.delay_connects(Duration::from_millis(50));
    let manager = ConnectionManager::new(connector.clone(), options(0));

    let handles = join_all((0..10).map(|_| manager.database(None))).await;
    assert!(handles.iter().all(Result::is_ok));
    assert_eq!(connector.counters().connects(), 1);
}

#[tokio::test]
async fn abort_on_connect_fail_makes_connect_faults_final() {
    let connector = FaultyConnector::default();
    connector.fail_connects(Fault::Transient);
    let manager = ConnectionManager::new(
        connector.clone(),
        ConnectionOptions {
            abort_on_connect_fail: true,
            ..options(3)
        },
    );

    let error = manager.connect().await.unwrap_err();
    assert_eq!(error.kind(), FaultKind::Fatal);

    connector.counters().reset();
    let error = manager
        .execute_with_retry(None, &Default::default(), |db| async move {
            keybox_backend::Store::exists(&db, "k").await
        })
        .await
        .unwrap_err();
    assert_eq!(error.kind(), FaultKind::Fatal);
    assert_eq!(connector.counters().connects(), 1);
    assert_eq!(manager.statistics().failed_connections, 2);
}

#[tokio::test]
async fn lazy_connect_recovers_after_the_store_returns() {
    let connector = FaultyConnector::default();
    connector.fail_connects(Fault::Transient);
    let connection = ConnectionManager::new(connector.clone(), options(0));

    connection.connect().await.unwrap();
    assert!(!connection.statistics().is_connected);
    assert!(!connection.test_connection().await);

    connector.heal();
    assert!(connection.test_connection().await);
    assert!(connection.statistics().is_connected);
}

#[tokio::test]
async fn dispose_is_idempotent() {
    let connector = FaultyConnector::default();
    let connection = ConnectionManager::new(connector.clone(), options(0));
    let cache = CacheService::new(connection.clone(), CacheSettings::default());
    cache.set("k", &1u8, &CacheOptions::new()).await.unwrap();

    connection.dispose().await;
    connection.dispose().await;

    let error = cache.set("k", &2u8, &CacheOptions::new()).await.unwrap_err();
    assert!(matches!(error, CacheError::Store(ref e) if e.kind() == FaultKind::Fatal));
    assert_eq!(cache.get::<u8>("k").await.unwrap(), None);
}

#[tokio::test]
async fn fail_closed_denials_are_logged_as_errors() {
    let (events, _guard) = capture_events();
    let connector = FaultyConnector::default();
    let limiter = RateLimiter::new(
        ConnectionManager::new(connector.clone(), options(0)),
        RateLimiterSettings::default(),
    );
    connector.fail_commands(Fault::Fatal);

    let result = limiter
        .is_request_allowed("alice", "api", 10, Duration::from_secs(60))
        .await
        .unwrap();
    assert!(!result.allowed);
    assert!(events.has_event(Level::ERROR, "Rate limit evaluation failed, denying request"));

    let stats = limiter.statistics();
    assert_eq!(stats.denied_requests, 1);
    assert_eq!(stats.allow_ratio, 0.0);
}
