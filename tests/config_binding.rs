#![allow(missing_docs)]

mod common;

use common::test_helpers::{client_config, test_rig, FakeHttpError};
use redoubt::{CacheBackendKind, Command, CommandCache, IsolationMode, MapSource};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn configured_descriptor_carries_property_store_values() {
    let config = client_config(&[
        ("api.client.numRetries.GetUser", "4"),
        ("api.client.requestTimeout.GetUser", "1500"),
        ("api.client.command.GetUser.errorThresholdPercentage", "30"),
        ("api.client.command.GetUser.executionIsolationStrategy", "semaphore"),
        ("api.client.threadpool.GetUser.coreSize", "2"),
    ]);

    let rig = test_rig();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_cb = calls.clone();
    let command = Command::builder()
        .name("GetUser")
        .configure(&config)
        .uri("http://api.example.com")
        .callback(move |_ctx, _base| {
            let calls = calls_cb.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(FakeHttpError::ConnectionReset)
            }
        })
        .build()
        .unwrap();

    let _ = rig.engine.execute(&command).await;
    // numRetries drove the attempt budget.
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[test]
fn isolation_strategy_binds_from_config() {
    let config = client_config(&[(
        "api.client.command.GetUser.executionIsolationStrategy",
        "semaphore",
    )]);
    let policies = config.policies("GetUser");
    assert_eq!(policies.execution.isolation, IsolationMode::Semaphore);

    let config = client_config(&[]);
    assert_eq!(config.policies("GetUser").execution.isolation, IsolationMode::Pool);
}

#[tokio::test]
async fn configured_timeout_bounds_attempts() {
    let config = client_config(&[("api.client.requestTimeout.Slow", "40")]);
    let rig = test_rig();

    let command = Command::builder()
        .name("Slow")
        .configure(&config)
        .uri("http://api.example.com")
        .max_attempts(1)
        .callback(|_ctx, _base| async {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok::<String, FakeHttpError>("late".to_string())
        })
        .build()
        .unwrap();

    assert!(rig.engine.execute(&command).await.unwrap_err().is_timeout());
}

#[test]
fn configured_cache_settings_build_a_working_cache() {
    let config = client_config(&[
        ("api.client.cache.users.type", "bounded"),
        ("api.client.cache.users.config", "maxSize=2,ttlMs=60000"),
    ]);
    let settings = config.cache_settings("users");
    assert_eq!(settings.kind, CacheBackendKind::Bounded);

    let cache = CommandCache::<String>::bounded("users", settings.cache_config());
    cache.put("a", &"1".to_string());
    cache.put("b", &"2".to_string());
    cache.put("c", &"3".to_string());
    // Bounded at two entries by the configured maxSize.
    assert_eq!(cache.len(), 2);
}

#[test]
fn live_source_updates_show_up_in_later_reads() {
    let source = Arc::new(MapSource::new());
    let config = redoubt::ClientConfig::new("api", source.clone());

    assert_eq!(config.num_retries(Some("GetUser")), 3);
    source.set("api.client.numRetries.GetUser", "9");
    assert_eq!(config.num_retries(Some("GetUser")), 9);
}

#[test]
fn transport_collaborator_keys_are_exposed() {
    let config = client_config(&[
        ("api.client.connectTimeout.GetUser", "750"),
        ("api.client.defaultAcceptTypes", "application/json,application/xml"),
        ("api.client.httpLoggingDebug", "true"),
    ]);
    assert_eq!(config.connect_timeout(Some("GetUser")), Duration::from_millis(750));
    assert_eq!(config.default_accept_types().len(), 2);
    assert!(config.http_logging_debug());
    assert!(!config.response_timing_debug());
}
