//! Integration tests against a live Redis.
//!
//! They only run when `REDIS_URL` is set, e.g.
//! `REDIS_URL=redis://127.0.0.1:6379 cargo test -p keybox-redis`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use keybox::{
    CacheOptions, CacheService, CacheSettings, ConnectionManager, ConnectionOptions, Namespace,
    RateLimiter, RateLimiterSettings,
};
use keybox_backend::{Connector, DeleteStatus, Store, StoredEntry};
use keybox_redis::RedisConnector;

fn connector() -> Option<RedisConnector> {
    let url = std::env::var("REDIS_URL").ok()?;
    Some(
        RedisConnector::builder()
            .server(url)
            .command_timeout(Duration::from_secs(2))
            .build()
            .expect("REDIS_URL must be a valid redis url"),
    )
}

/// Prefix unique to one test run.
fn prefix(test: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("keybox-test:{test}:{nanos}")
}

#[tokio::test]
async fn store_round_trip() {
    let Some(connector) = connector() else {
        return;
    };
    let db = connector.connect(0).await.unwrap();
    let key = format!("{}:entry", prefix("store"));
    let entry = StoredEntry::new(Bytes::from_static(b"\0payload"))
        .with_sliding(Some(Duration::from_secs(30)));

    db.write(&key, entry.clone(), Some(Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(db.read(&key).await.unwrap(), Some(entry));
    let ttl = db.ttl(&key).await.unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(30));

    assert_eq!(db.remove(&key).await.unwrap(), DeleteStatus::Deleted(1));
    assert_eq!(db.remove(&key).await.unwrap(), DeleteStatus::Missing);
}

#[tokio::test]
async fn cache_service_over_redis() {
    let Some(connector) = connector() else {
        return;
    };
    let connection = ConnectionManager::new(connector, ConnectionOptions::default());
    let cache = CacheService::new(
        connection,
        CacheSettings {
            namespace: Namespace::new(prefix("cache")),
            ..CacheSettings::default()
        },
    );

    let tagged = CacheOptions::new().absolute(Duration::from_secs(60)).tag("group");
    cache.set("small", &42u32, &tagged).await.unwrap();
    cache.set("large", &"x".repeat(8192), &tagged).await.unwrap();

    assert_eq!(cache.get::<u32>("small").await.unwrap(), Some(42));
    assert_eq!(cache.get::<String>("large").await.unwrap().map(|s| s.len()), Some(8192));
    assert_eq!(cache.statistics().compressed_writes, 1);

    assert_eq!(cache.remove_by_tag("group").await.unwrap(), 2);
    assert!(!cache.exists("small").await.unwrap());
}

#[tokio::test]
async fn rate_limiter_over_redis() {
    let Some(connector) = connector() else {
        return;
    };
    let connection = ConnectionManager::new(connector, ConnectionOptions::default());
    let limiter = RateLimiter::new(
        connection,
        RateLimiterSettings {
            namespace: Namespace::new(prefix("limits")),
            database: Some(0),
            ..RateLimiterSettings::default()
        },
    );
    let window = Duration::from_secs(10);

    assert!(limiter.is_request_allowed("alice", "api", 2, window).await.unwrap().allowed);
    assert!(limiter.is_request_allowed("alice", "api", 2, window).await.unwrap().allowed);
    let denied = limiter.is_request_allowed("alice", "api", 2, window).await.unwrap();
    assert!(!denied.allowed);
    assert!(denied.retry_after.is_some());

    assert!(limiter.reset_rate_limit("alice", "api").await.unwrap());
}
