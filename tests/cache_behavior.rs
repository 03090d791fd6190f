//! Behavior-driven tests for response caching
//!
//! These tests verify HOW the cache store and the service's cached queries
//! behave: expiry, warm-up, invalidation and cache keys built from parameters.

#[path = "support/mod.rs"]
mod support;

use std::sync::Arc;
use std::time::Duration;

use margin_core::{
    CacheStore, ConfigUpdate, HttpMethod, MarginAnalysisParams, MarginAnalysisService, NewAlert,
    Period, ServiceConfig,
};
use serde_json::json;
use support::{test_config, Reply, ScriptedHttpClient};

fn margin_body() -> serde_json::Value {
    json!({
        "total_revenue": 1000.0,
        "total_cost": 700.0,
        "margin_percent": 30.0,
        "records": [{"vendor": "Steelcase", "revenue": 1000.0, "cost": 700.0}]
    })
}

fn service_with(http: &Arc<ScriptedHttpClient>, config: ServiceConfig) -> MarginAnalysisService {
    MarginAnalysisService::new(config, http.clone()).expect("valid config")
}

// =============================================================================
// Cache Store: TTL semantics
// =============================================================================

#[tokio::test]
async fn when_value_is_set_system_returns_it_until_ttl_expires() {
    // Given: A cache store
    let cache = CacheStore::new(Duration::from_secs(60));

    // When: A value is stored with a short TTL
    cache
        .set("vendor_performance", &json!({"vendors": 3}), Some(Duration::from_millis(30)))
        .await;

    // Then: It is served while fresh
    let fresh: Option<serde_json::Value> = cache.get("vendor_performance").await;
    assert_eq!(fresh, Some(json!({"vendors": 3})));

    // And: It is a miss (and evicted) after expiry
    tokio::time::sleep(Duration::from_millis(50)).await;
    let expired: Option<serde_json::Value> = cache.get("vendor_performance").await;
    assert_eq!(expired, None);
    assert_eq!(cache.len().await, 0, "expired entry should be evicted on read");

    let metrics = cache.metrics().await;
    assert_eq!(metrics.hits, 1);
    assert_eq!(metrics.misses, 1);
}

#[tokio::test]
async fn when_warm_loader_fails_system_logs_and_continues() {
    // Given: A cache store and a failing loader
    let cache = CacheStore::new(Duration::from_secs(60));

    // When: The cache is warmed
    let warmed = cache
        .warm("customer_patterns", None, || async {
            Err::<serde_json::Value, _>("backend offline")
        })
        .await;

    // Then: Nothing is raised and nothing is stored
    assert!(!warmed);
    assert!(cache.is_empty().await);
}

#[tokio::test]
async fn when_store_is_full_system_evicts_entry_closest_to_expiry() {
    // Given: A store bounded to two entries
    let cache = CacheStore::with_capacity(Duration::from_secs(60), 2);
    cache.set("short", &1, Some(Duration::from_secs(1))).await;
    cache.set("long", &2, Some(Duration::from_secs(600))).await;

    // When: A third entry is inserted
    cache.set("new", &3, None).await;

    // Then: The entry expiring soonest is gone
    assert_eq!(cache.len().await, 2);
    assert_eq!(cache.get::<i32>("short").await, None);
    assert_eq!(cache.get::<i32>("long").await, Some(2));
}

// =============================================================================
// Service: cached queries
// =============================================================================

#[tokio::test]
async fn when_same_period_is_requested_twice_system_calls_network_once() {
    // Given: A service whose root endpoint returns a margin report
    let http = ScriptedHttpClient::new();
    http.always(HttpMethod::Post, "/", Reply::json(margin_body()));
    let service = service_with(&http, test_config());

    // When: this_month is fetched twice
    let params = MarginAnalysisParams::for_period(Period::ThisMonth);
    let first = service.fetch_margin_analysis(&params).await.expect("first fetch");
    let second = service.fetch_margin_analysis(&params).await.expect("second fetch");

    // Then: Only one network call was made and both results match
    assert_eq!(http.calls_to(HttpMethod::Post, "/"), 1);
    assert_eq!(first, second);
    assert_eq!(first.records[0].margin_percent(), Some(30.0));

    // When: A different period is requested
    service
        .fetch_margin_analysis(&MarginAnalysisParams::for_period(Period::ThisYear))
        .await
        .expect("this_year fetch");

    // Then: It triggers a fresh call
    assert_eq!(http.calls_to(HttpMethod::Post, "/"), 2);
}

#[tokio::test]
async fn when_caching_is_disabled_system_still_returns_correct_results() {
    // Given: A service with caching turned off
    let http = ScriptedHttpClient::new();
    http.always(HttpMethod::Post, "/", Reply::json(margin_body()));
    let config = ServiceConfig {
        enable_caching: false,
        ..test_config()
    };
    let service = service_with(&http, config);

    // When: The same query runs twice
    let params = MarginAnalysisParams::for_period(Period::ThisMonth);
    let first = service.fetch_margin_analysis(&params).await.expect("first fetch");
    let second = service.fetch_margin_analysis(&params).await.expect("second fetch");

    // Then: Both calls hit the network and agree
    assert_eq!(http.calls_to(HttpMethod::Post, "/"), 2);
    assert_eq!(first, second);
}

#[tokio::test]
async fn when_caching_is_disabled_at_runtime_system_stops_serving_cache() {
    // Given: A service that has cached a report
    let http = ScriptedHttpClient::new();
    http.always(HttpMethod::Post, "/", Reply::json(margin_body()));
    let service = service_with(&http, test_config());
    let params = MarginAnalysisParams::for_period(Period::ThisQuarter);
    service.fetch_margin_analysis(&params).await.expect("fetch");

    // When: Caching is switched off through a config update
    service
        .update_config(ConfigUpdate {
            enable_caching: Some(false),
            ..ConfigUpdate::default()
        })
        .await
        .expect("valid update");
    service.fetch_margin_analysis(&params).await.expect("fetch");

    // Then: The second fetch went to the network
    assert_eq!(http.calls_to(HttpMethod::Post, "/"), 2);
}

#[tokio::test]
async fn when_alert_is_created_system_invalidates_cached_alert_list() {
    // Given: A cached alert list
    let http = ScriptedHttpClient::new();
    http.always(
        HttpMethod::Get,
        "/alerts",
        Reply::json(json!([{"id": "a1", "name": "Low margin", "metric": "margin_percent", "threshold": 15.0}])),
    );
    http.always(
        HttpMethod::Post,
        "/alerts",
        Reply::json(json!({"id": "a2", "name": "Discount", "metric": "discount", "threshold": 40.0, "active": true})),
    );
    let service = service_with(&http, test_config());
    service.list_alerts().await.expect("list");
    service.list_alerts().await.expect("list from cache");
    assert_eq!(http.calls_to(HttpMethod::Get, "/alerts"), 1);

    // When: A new alert is created
    let alert = NewAlert::new("Discount", "discount", 40.0).expect("valid alert");
    let created = service.create_alert(&alert).await.expect("create");

    // Then: The next list goes back to the network
    assert_eq!(created.id, "a2");
    service.list_alerts().await.expect("list after create");
    assert_eq!(http.calls_to(HttpMethod::Get, "/alerts"), 2);
}

#[tokio::test]
async fn when_service_initializes_system_warms_customer_patterns() {
    // Given: A backend serving customer patterns
    let http = ScriptedHttpClient::new();
    http.always(
        HttpMethod::Get,
        "/customer-patterns",
        Reply::json(json!({"segments": ["education", "healthcare"]})),
    );
    let service = service_with(&http, test_config());

    // When: The service initializes
    service.initialize().await;

    // Then: The dataset is available from the cache without another call
    let warmed = service
        .warmed_dataset(margin_core::WarmDataset::CustomerPatterns)
        .await
        .expect("dataset should be warmed");
    assert_eq!(warmed.get("segments"), Some(&json!(["education", "healthcare"])));
    assert_eq!(http.calls_to(HttpMethod::Get, "/customer-patterns"), 1);
}
