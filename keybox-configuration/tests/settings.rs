use std::time::Duration;

use keybox::SingleFlight;
use keybox_configuration::{
    Compression, ConfigError, ConnectionPool, RateLimiting, Retry, Settings,
};
use pretty_assertions::assert_eq;

#[test]
fn test_full_document_deserialize() {
    let yaml = r#"
ConnectionString: "redis://cache.internal:6380"
KeyPrefix: "shop"
DefaultExpirationMinutes: 10
MaxKeyLength: 256
EnableCompression: true
CompressionThresholdBytes: 2048
Compression: Gzip
CompressionLevel: 9
ConnectTimeoutSeconds: 3
CommandTimeoutSeconds: 2
Database: 2
SingleFlight: true
Retry:
  MaxRetryAttempts: 5
  RetryDelaySeconds: 2
  EnableExponentialBackoff: false
  EnableJitter: false
ConnectionPool:
  MaxPoolSize: 4
  AbortOnConnectFail: true
  AllowAdmin: true
RateLimiting:
  Database: 3
  DefaultWindowMinutes: 2
  MaxTrackedClients: 500
  CleanupIntervalMinutes: 10
"#;

    let settings = Settings::from_yaml(yaml).expect("failed to load");

    assert_eq!(
        settings,
        Settings {
            connection_string: "redis://cache.internal:6380".to_string(),
            key_prefix: "shop".to_string(),
            default_expiration_minutes: 10,
            max_key_length: 256,
            enable_compression: true,
            compression_threshold_bytes: 2048,
            compression: Compression::Gzip,
            compression_level: Some(9),
            connect_timeout_seconds: 3,
            command_timeout_seconds: 2,
            database: 2,
            single_flight: true,
            retry: Retry {
                max_retry_attempts: 5,
                retry_delay_seconds: 2,
                enable_exponential_backoff: false,
                enable_jitter: false,
            },
            connection_pool: ConnectionPool {
                max_pool_size: 4,
                abort_on_connect_fail: true,
                allow_admin: true,
            },
            rate_limiting: RateLimiting {
                database: 3,
                default_window_minutes: 2,
                max_tracked_clients: 500,
                cleanup_interval_minutes: 10,
            },
        }
    );
}

#[test]
fn test_missing_keys_take_defaults() {
    let settings = Settings::from_yaml("KeyPrefix: app\nRetry:\n  MaxRetryAttempts: 1\n")
        .expect("failed to load");

    assert_eq!(settings.key_prefix, "app");
    assert_eq!(settings.retry.max_retry_attempts, 1);
    assert_eq!(settings.retry.retry_delay_seconds, 1);
    assert_eq!(settings.connection_pool, ConnectionPool::default());
    assert_eq!(settings.rate_limiting, RateLimiting::default());
    assert_eq!(settings.default_expiration_minutes, 30);
}

#[test]
fn test_unknown_keys_are_rejected() {
    let result = Settings::from_yaml("KeyPrefx: typo\n");
    assert!(matches!(result, Err(ConfigError::Yaml(_))));
}

#[test]
fn test_validation_rejects_out_of_range_values() {
    let cases = [
        ("KeyPrefix: \"\"\n", "KeyPrefix"),
        ("ConnectionPool:\n  MaxPoolSize: 0\n", "MaxPoolSize"),
        ("RateLimiting:\n  DefaultWindowMinutes: 0\n", "DefaultWindowMinutes"),
        ("DefaultExpirationMinutes: 0\n", "DefaultExpirationMinutes"),
        ("KeyPrefix: abc\nMaxKeyLength: 4\n", "MaxKeyLength"),
        ("Database: -1\n", "Database"),
    ];

    for (yaml, expected) in cases {
        match Settings::from_yaml(yaml) {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, expected),
            other => panic!("expected invalid {expected}, got {other:?}"),
        }
    }
}

#[test]
fn test_conversion_to_runtime_types() {
    let settings = Settings {
        key_prefix: "shop".to_string(),
        max_key_length: 128,
        single_flight: true,
        ..Settings::default()
    };

    let options = settings.connection_options();
    assert_eq!(options.database, 0);
    assert_eq!(options.max_pool_size, 16);
    assert_eq!(options.retry.max_retry_attempts, 3);
    assert_eq!(options.retry.base_delay, Duration::from_secs(1));
    assert_eq!(options.retry.max_invocations(), 4);

    let cache = settings.cache_settings();
    assert_eq!(cache.namespace.prefix(), "shop");
    assert_eq!(cache.namespace.max_key_length(), 128);
    assert_eq!(cache.default_expiration, Duration::from_secs(30 * 60));
    assert_eq!(cache.database, Some(0));
    assert_eq!(cache.single_flight, SingleFlight::Enabled);

    let limits = settings.rate_limiter_settings();
    assert_eq!(limits.database, Some(1));
    assert_eq!(limits.default_window, Duration::from_secs(60));
    assert_eq!(limits.cleanup_interval, Duration::from_secs(5 * 60));
    assert_eq!(limits.max_tracked_clients, 100_000);
}

#[test]
fn test_compressor_selection() {
    let settings = Settings::default();
    assert!(settings.compressor().is_ok());

    let disabled = Settings {
        enable_compression: false,
        compression: Compression::Zstd,
        ..Settings::default()
    };
    assert!(disabled.compressor().is_ok());

    let negative_gzip = Settings {
        compression_level: Some(-1),
        ..Settings::default()
    };
    assert!(matches!(
        negative_gzip.compressor(),
        Err(ConfigError::Invalid { field: "CompressionLevel", .. })
    ));
}

#[cfg(not(feature = "zstd"))]
#[test]
fn test_zstd_requires_feature() {
    let settings = Settings {
        compression: Compression::Zstd,
        ..Settings::default()
    };
    assert!(matches!(
        settings.compressor(),
        Err(ConfigError::BackendNotAvailable(_))
    ));
}

#[test]
fn test_settings_roundtrip_serialization() {
    let settings = Settings::default();
    let yaml = serde_saphyr::to_string(&settings).expect("failed to serialize");
    let deserialized = Settings::from_yaml(&yaml).expect("failed to deserialize");
    assert_eq!(settings, deserialized);
}

#[test]
fn test_missing_file_is_reported() {
    let result = Settings::from_path("/nonexistent/keybox.yaml");
    assert!(matches!(result, Err(ConfigError::Io { .. })));
}
