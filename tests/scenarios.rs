//! End-to-end scenarios driving the public `Service` surface (and, where a
//! scenario needs to reach below it, the registry/discovery/election types
//! directly) over the in-memory testkit adapters. One test per scenario so
//! a failure names exactly which behavior regressed.

use beacon_core::discovery::{DiscoveryConfig, SelectionPolicy, ServiceDiscovery};
use beacon_core::election::ElectionController;
use beacon_core::registry::ServiceRegistry;
use beacon_core::runtime::config::ServiceConfig;
use beacon_core::runtime::events::SubscriptionMode;
use beacon_core::testkit::{InMemoryKvStore, InMemoryMessageBus};
use beacon_core::time::MockClock;
use beacon_core::{Service, ServiceInstance, ServiceStatus};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scenarios that assert on failover/election timing are the ones most
/// worth running with logs visible; `try_init` so running the whole suite
/// doesn't panic on the second call.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn echo_server_config(instance_id: &str) -> ServiceConfig {
    ServiceConfig::new("echo", "1.0.0")
        .unwrap()
        .with_instance_id(instance_id)
        .with_watch_enabled(false)
        .with_enable_registration(false)
}

/// S1. Load-balanced RPC across three instances.
#[tokio::test]
async fn load_balanced_rpc_across_three_instances() {
    let bus = Arc::new(InMemoryMessageBus::new());
    let store = Arc::new(InMemoryKvStore::new());

    let mut servers = Vec::new();
    for id in ["e-1", "e-2", "e-3"] {
        let service = Service::new(echo_server_config(id), bus.clone(), store.clone()).unwrap();
        let instance_id = id.to_string();
        service
            .register_rpc(
                "echo",
                Arc::new(move |params: BTreeMap<String, Value>| {
                    let instance_id = instance_id.clone();
                    Box::pin(async move {
                        let message = params.get("message").cloned().unwrap_or(Value::Null);
                        let mut result = BTreeMap::new();
                        result.insert("echo".to_string(), message);
                        result.insert("handled_by".to_string(), json!(instance_id));
                        Ok(result)
                    })
                }),
            )
            .unwrap();
        service.start().await.unwrap();
        servers.push(service);
    }

    let client = Service::new(
        ServiceConfig::new("client", "1.0.0")
            .unwrap()
            .with_watch_enabled(false)
            .with_enable_registration(false),
        bus.clone(),
        store.clone(),
    )
    .unwrap();

    let mut handled_by: HashMap<String, u32> = HashMap::new();
    for i in 0..300 {
        let mut params = BTreeMap::new();
        params.insert("message".to_string(), json!(format!("ping-{i}")));
        let result = client
            .call_rpc("echo", "echo", params.clone(), Duration::from_secs(1), false)
            .await
            .unwrap();
        assert_eq!(result.get("echo"), params.get("message"));
        let instance = result.get("handled_by").unwrap().as_str().unwrap().to_string();
        *handled_by.entry(instance).or_insert(0) += 1;
    }

    assert_eq!(handled_by.len(), 3, "all three instances should have handled at least one call");
    for (instance, count) in &handled_by {
        assert!(
            (80..=120).contains(count),
            "instance {instance} handled {count} calls, expected 100 +/- 20"
        );
    }
}

/// S2. Failover with sticky-active.
#[tokio::test]
async fn failover_with_sticky_active() {
    init_tracing();
    let bus = Arc::new(InMemoryMessageBus::new());
    let store = Arc::new(InMemoryKvStore::new());
    let leader_ttl = Duration::from_millis(200);

    let mut servers = HashMap::new();
    for id in ["o-1", "o-2"] {
        let config = ServiceConfig::new("order", "1.0.0")
            .unwrap()
            .with_instance_id(id)
            .with_watch_enabled(false)
            .with_enable_registration(true)
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_sticky_active_group("primary")
            .with_leader_ttl(leader_ttl);
        let service = Service::new(config, bus.clone(), store.clone()).unwrap();
        let instance_id = id.to_string();
        service
            .register_exclusive_rpc(
                "create_order",
                Arc::new(move |params: BTreeMap<String, Value>| {
                    let instance_id = instance_id.clone();
                    Box::pin(async move {
                        let mut result = BTreeMap::new();
                        result.insert("success".to_string(), json!(true));
                        result.insert("processed_by".to_string(), json!(instance_id));
                        result.insert("order_id".to_string(), params.get("id").cloned().unwrap_or(Value::Null));
                        Ok(result)
                    })
                }),
            )
            .unwrap();
        service.start().await.unwrap();
        servers.insert(id.to_string(), service);
    }

    // Give the election loop a few leader_ttl cycles to settle on one leader.
    tokio::time::sleep(leader_ttl * 4).await;

    let client = Service::new(
        ServiceConfig::new("client", "1.0.0")
            .unwrap()
            .with_watch_enabled(false)
            .with_enable_registration(false),
        bus.clone(),
        store.clone(),
    )
    .unwrap();

    let mut params = BTreeMap::new();
    params.insert("id".to_string(), json!("A"));
    let result = client
        .call_rpc("order", "create_order", params.clone(), Duration::from_secs(1), true)
        .await
        .unwrap();
    assert_eq!(result.get("success"), Some(&json!(true)));
    let first_leader = result.get("processed_by").unwrap().as_str().unwrap().to_string();

    servers.get(&first_leader).unwrap().stop().await;
    tokio::time::sleep(leader_ttl * 2).await;

    let mut params = BTreeMap::new();
    params.insert("id".to_string(), json!("B"));
    let result = client
        .call_rpc("order", "create_order", params, Duration::from_secs(2), true)
        .await
        .unwrap();
    assert_eq!(result.get("success"), Some(&json!(true)));
    let second_leader = result.get("processed_by").unwrap().as_str().unwrap().to_string();
    assert_ne!(first_leader, second_leader, "the surviving instance should have taken over");
}

/// S3. BROADCAST event fan-out.
#[tokio::test]
async fn broadcast_event_fan_out() {
    let bus = Arc::new(InMemoryMessageBus::new());
    let store = Arc::new(InMemoryKvStore::new());

    let counter_a = Arc::new(AtomicUsize::new(0));
    let counter_b = Arc::new(AtomicUsize::new(0));

    let config_a = ServiceConfig::new("config", "1.0.0")
        .unwrap()
        .with_instance_id("cfg-1")
        .with_watch_enabled(false)
        .with_enable_registration(false);
    let service_a = Service::new(config_a, bus.clone(), store.clone()).unwrap();
    let counter = counter_a.clone();
    service_a
        .subscribe_event(
            "events.config.changed",
            SubscriptionMode::Broadcast,
            Arc::new(move |_event| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        )
        .unwrap();
    service_a.start().await.unwrap();

    let config_b = ServiceConfig::new("config", "1.0.0")
        .unwrap()
        .with_instance_id("cfg-2")
        .with_watch_enabled(false)
        .with_enable_registration(false);
    let service_b = Service::new(config_b, bus.clone(), store.clone()).unwrap();
    let counter = counter_b.clone();
    service_b
        .subscribe_event(
            "events.config.changed",
            SubscriptionMode::Broadcast,
            Arc::new(move |_event| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        )
        .unwrap();
    service_b.start().await.unwrap();

    let publisher = Service::new(
        ServiceConfig::new("publisher", "1.0.0")
            .unwrap()
            .with_watch_enabled(false)
            .with_enable_registration(false),
        bus.clone(),
        store.clone(),
    )
    .unwrap();

    let mut payload = BTreeMap::new();
    payload.insert("key".to_string(), json!("max_risk"));
    payload.insert("value".to_string(), json!(0.02));
    publisher.publish_event("config", "changed", payload, "1.0.0").await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter_a.load(Ordering::SeqCst), 1, "cfg-1 should observe exactly one event");
    assert_eq!(counter_b.load(Ordering::SeqCst), 1, "cfg-2 should observe exactly one event");
}

/// S4. COMPETE event distribution.
#[tokio::test]
async fn compete_event_distribution() {
    let bus = Arc::new(InMemoryMessageBus::new());
    let store = Arc::new(InMemoryKvStore::new());

    let seen_a: Arc<parking_lot::Mutex<Vec<i64>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen_b: Arc<parking_lot::Mutex<Vec<i64>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));

    for (id, seen) in [("pricing-1", seen_a.clone()), ("pricing-2", seen_b.clone())] {
        let config = ServiceConfig::new("pricing", "1.0.0")
            .unwrap()
            .with_instance_id(id)
            .with_watch_enabled(false)
            .with_enable_registration(false);
        let service = Service::new(config, bus.clone(), store.clone()).unwrap();
        service
            .subscribe_event(
                "events.market.data",
                SubscriptionMode::Compete,
                Arc::new(move |event| {
                    let seen = seen.clone();
                    Box::pin(async move {
                        if let Some(index) = event.payload.get("index").and_then(|v| v.as_i64()) {
                            seen.lock().push(index);
                        }
                        Ok(())
                    })
                }),
            )
            .unwrap();
        service.start().await.unwrap();
        // Keep the services alive for the duration of the test.
        std::mem::forget(service);
    }

    let publisher = Service::new(
        ServiceConfig::new("publisher", "1.0.0")
            .unwrap()
            .with_watch_enabled(false)
            .with_enable_registration(false),
        bus.clone(),
        store.clone(),
    )
    .unwrap();

    for i in 0..10 {
        let mut payload = BTreeMap::new();
        payload.insert("index".to_string(), json!(i));
        publisher.publish_event("market", "data", payload, "1.0.0").await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(80)).await;
    let a = seen_a.lock().clone();
    let b = seen_b.lock().clone();
    assert_eq!(a.len() + b.len(), 10, "every event should be delivered exactly once in total");
    assert!(!a.is_empty(), "pricing-1 should have handled at least one event");
    assert!(!b.is_empty(), "pricing-2 should have handled at least one event");
    let overlap: Vec<_> = a.iter().filter(|idx| b.contains(idx)).collect();
    assert!(overlap.is_empty(), "no index should be observed by both competing instances");
}

/// S5. Discovery cache invalidation, first via watch then via TTL fallback.
#[tokio::test]
async fn discovery_cache_invalidation_via_watch_then_ttl() {
    let store = Arc::new(InMemoryKvStore::new());
    let registry = ServiceRegistry::new(store.clone());
    let a = ServiceInstance::new("svc", "svc-1", "1.0.0").unwrap().with_status(ServiceStatus::Active);
    registry.register(&a, Duration::from_secs(30)).await.unwrap();

    let discovery = ServiceDiscovery::new(
        registry.clone(),
        store.clone(),
        DiscoveryConfig {
            cache_ttl: Duration::from_secs(300),
            watch_enabled: true,
            ..Default::default()
        },
    );
    assert_eq!(discovery.discover_instances("svc").await.unwrap().len(), 1);

    let b = ServiceInstance::new("svc", "svc-2", "1.0.0").unwrap().with_status(ServiceStatus::Active);
    registry.register(&b, Duration::from_secs(30)).await.unwrap();

    let mut observed = Vec::new();
    for _ in 0..50 {
        observed = discovery.discover_instances("svc").await.unwrap();
        if observed.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(observed.len(), 2, "watch-driven invalidation should surface the new instance");
    discovery.stop();

    // Second pass: watch disabled entirely, relying on TTL fallback.
    let store2 = Arc::new(InMemoryKvStore::new());
    let registry2 = ServiceRegistry::new(store2.clone());
    registry2
        .register(&ServiceInstance::new("svc", "svc-1", "1.0.0").unwrap(), Duration::from_secs(30))
        .await
        .unwrap();

    let short_ttl = Duration::from_millis(50);
    let discovery2 = ServiceDiscovery::new(
        registry2.clone(),
        store2.clone(),
        DiscoveryConfig {
            cache_ttl: short_ttl,
            watch_enabled: false,
            ..Default::default()
        },
    );
    assert_eq!(discovery2.discover_instances("svc").await.unwrap().len(), 1);

    registry2
        .register(&ServiceInstance::new("svc", "svc-2", "1.0.0").unwrap(), Duration::from_secs(30))
        .await
        .unwrap();

    tokio::time::sleep(short_ttl + Duration::from_millis(20)).await;
    let refreshed = discovery2.discover_instances("svc").await.unwrap();
    assert_eq!(refreshed.len(), 2, "TTL expiry should force a re-fetch even without a watch");
}

/// S6. Registry stale entry cleanup, driven by a `MockClock` so the test
/// doesn't have to sleep past a real 30 second TTL.
#[tokio::test]
async fn registry_stale_entry_cleanup() {
    let clock = MockClock::new();
    let store = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
    let registry = ServiceRegistry::new(store);

    let instance = ServiceInstance::new("x", "x-1", "1.0.0").unwrap();
    registry.register(&instance, Duration::from_secs(30)).await.unwrap();
    assert!(registry.get_instance("x", "x-1").await.unwrap().is_some());

    clock.advance(Duration::from_secs(31));

    assert!(registry.get_instance("x", "x-1").await.unwrap().is_none());
    assert!(registry.list_instances("x").await.unwrap().is_empty());
}

/// Exercises `select_instance`'s three policies directly against a shared
/// instance set, complementing the unit tests in `discovery.rs`.
#[tokio::test]
async fn selection_policies_agree_on_the_eligible_set() {
    let store = Arc::new(InMemoryKvStore::new());
    let registry = ServiceRegistry::new(store.clone());
    for id in ["s-1", "s-2", "s-3"] {
        registry
            .register(
                &ServiceInstance::new("svc", id, "1.0.0").unwrap().with_status(ServiceStatus::Active),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
    }
    let discovery = ServiceDiscovery::new(
        registry,
        store,
        DiscoveryConfig { watch_enabled: false, ..Default::default() },
    );

    let mut round_robin_ids = Vec::new();
    for _ in 0..3 {
        let chosen = discovery.select_instance("svc", SelectionPolicy::RoundRobin).await.unwrap().unwrap();
        round_robin_ids.push(chosen.instance_id);
    }
    round_robin_ids.sort();
    assert_eq!(round_robin_ids, vec!["s-1", "s-2", "s-3"]);

    let sticky_first = discovery.select_instance("svc", SelectionPolicy::Sticky).await.unwrap().unwrap();
    let sticky_second = discovery.select_instance("svc", SelectionPolicy::Sticky).await.unwrap().unwrap();
    assert_eq!(sticky_first.instance_id, sticky_second.instance_id);
}

/// Command handlers are the fourth handler kind alongside RPC, exclusive
/// RPC, and events: this exercises registration, dispatch, the completion
/// response, and the optional progress channel end to end through `Service`.
#[tokio::test]
async fn command_dispatch_with_progress_reporting() {
    use beacon_core::model::CommandPriority;

    let bus = Arc::new(InMemoryMessageBus::new());
    let store = Arc::new(InMemoryKvStore::new());

    let worker = Service::new(
        ServiceConfig::new("reports", "1.0.0")
            .unwrap()
            .with_instance_id("reports-1")
            .with_watch_enabled(false)
            .with_enable_registration(false),
        bus.clone(),
        store.clone(),
    )
    .unwrap();
    worker
        .register_command(
            "generate",
            Arc::new(move |_command, reporter| {
                Box::pin(async move {
                    let mut half = BTreeMap::new();
                    half.insert("percent".to_string(), json!(50));
                    reporter.report(half).await;
                    let mut result = BTreeMap::new();
                    result.insert("rows".to_string(), json!(42));
                    Ok(result)
                })
            }),
        )
        .unwrap();
    worker.start().await.unwrap();

    let progress: Arc<parking_lot::Mutex<Vec<BTreeMap<String, Value>>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let progress_for_sub = progress.clone();
    bus.subscribe(
        "progress.reports.job-1",
        None,
        None,
        Box::new(move |message| {
            let progress = progress_for_sub.clone();
            Box::pin(async move {
                if let Ok(update) = beacon_core::serialization::decode::<beacon_core::CommandProgress>(&message.payload) {
                    progress.lock().push(update.payload);
                }
            })
        }),
    )
    .await
    .unwrap();

    let caller = Service::new(
        ServiceConfig::new("caller", "1.0.0")
            .unwrap()
            .with_watch_enabled(false)
            .with_enable_registration(false),
        bus.clone(),
        store.clone(),
    )
    .unwrap();

    let mut payload = BTreeMap::new();
    payload.insert("report".to_string(), json!("quarterly"));
    let result = caller
        .call_command(
            "reports",
            "generate",
            payload,
            CommandPriority::Normal,
            Some("progress.reports.job-1".to_string()),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(result.get("rows"), Some(&json!(42)));

    for _ in 0..50 {
        if !progress.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(progress.lock().len(), 1);
    assert_eq!(progress.lock()[0].get("percent"), Some(&json!(50)));
}

/// Confirms an election controller built directly (outside of `Service`)
/// still upholds the single-active invariant under contention, as a
/// lower-level companion to the `failover_with_sticky_active` scenario.
#[tokio::test]
async fn only_one_contender_becomes_active_under_contention() {
    let store = Arc::new(InMemoryKvStore::new());
    let mut controllers = Vec::new();
    for id in ["n-1", "n-2", "n-3"] {
        controllers.push(ElectionController::new(store.clone(), "fleet", "primary", id, Duration::from_secs(2)));
    }
    for controller in &controllers {
        controller.tick().await.unwrap();
    }
    let active_count = controllers.iter().filter(|c| c.is_active()).count();
    assert_eq!(active_count, 1, "exactly one contender should hold the lease");
}
