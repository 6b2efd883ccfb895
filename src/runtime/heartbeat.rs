//! Heartbeat task (§4.7 "Heartbeat task").
//!
//! Runs for the lifetime of a started [`crate::runtime::service::Service`]
//! that has `enable_registration` set. Every `heartbeat_interval`, it
//! re-registers the instance (refreshing its TTL), optionally publishes a
//! lightweight heartbeat envelope for dashboards, and refreshes the
//! runtime's metrics snapshot. Failures are logged and never propagate —
//! per spec, "heartbeat failures are logged and never crash the service".

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

use crate::election::ElectionController;
use crate::model::{ServiceInstance, ServiceStatus};
use crate::naming::heartbeat_subject;
use crate::observability::RuntimeMetrics;
use crate::ports::MessageBus;
use crate::registry::ServiceRegistry;
use crate::serialization::{self, WireFormat};
use crate::time::Clock;

pub struct HeartbeatTask {
    registry: ServiceRegistry,
    bus: Option<Arc<dyn MessageBus>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<RuntimeMetrics>,
    service_name: String,
    instance_id: String,
    interval: Duration,
    registry_ttl: Duration,
    format: WireFormat,
    election: Option<Arc<ElectionController>>,
}

impl HeartbeatTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: ServiceRegistry,
        bus: Option<Arc<dyn MessageBus>>,
        clock: Arc<dyn Clock>,
        metrics: Arc<RuntimeMetrics>,
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        interval: Duration,
        registry_ttl: Duration,
        format: WireFormat,
        election: Option<Arc<ElectionController>>,
    ) -> Self {
        Self {
            registry,
            bus,
            clock,
            metrics,
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            interval,
            registry_ttl,
            format,
            election,
        }
    }

    /// Runs one heartbeat cycle against `instance`, publishing an optional
    /// heartbeat envelope and refreshing the registry TTL.
    #[instrument(skip(self, instance), fields(service = %self.service_name, instance_id = %self.instance_id))]
    pub async fn tick(&self, instance: &ServiceInstance) {
        if let Some(bus) = &self.bus {
            let envelope = crate::model::Envelope::new(&self.instance_id);
            match serialization::encode(&envelope, self.format) {
                Ok(bytes) => {
                    if let Err(err) = bus.publish(&heartbeat_subject(&self.service_name), bytes).await {
                        warn!(error = %err, "failed to publish heartbeat envelope");
                    }
                }
                Err(err) => warn!(error = %err, "failed to encode heartbeat envelope"),
            }
        }

        match self.registry.update_heartbeat(instance, self.registry_ttl).await {
            Ok(()) => {
                self.metrics.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.metrics.heartbeat_failures_total.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "heartbeat failed to refresh registry TTL");
            }
        }
    }

    /// Drives [`Self::tick`] every `interval` against a heartbeat-updated
    /// copy of `instance` until cancelled. Intended to be spawned as its
    /// own task. When `election` is set, `instance.status` is resynced from
    /// [`ElectionController::is_active`] on every tick, so a sticky-active
    /// instance's registry record reflects its current leadership state
    /// rather than whatever it was at startup.
    pub async fn run(self: Arc<Self>, mut instance: ServiceInstance) {
        loop {
            self.clock.sleep(self.interval).await;
            instance.last_heartbeat = chrono::Utc::now();
            if let Some(election) = &self.election {
                instance.status = if election.is_active() { ServiceStatus::Active } else { ServiceStatus::Standby };
            }
            self.tick(&instance).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceRegistry;
    use crate::testkit::InMemoryKvStore;
    use crate::time::MockClock;

    #[tokio::test]
    async fn tick_refreshes_the_registry_record() {
        let store = Arc::new(InMemoryKvStore::new());
        let registry = ServiceRegistry::new(store);
        let instance = ServiceInstance::new("echo", "echo-1", "1.0.0").unwrap();
        registry.register(&instance, Duration::from_secs(30)).await.unwrap();

        let task = HeartbeatTask::new(
            registry.clone(),
            None,
            crate::time::system_clock(),
            Arc::new(RuntimeMetrics::default()),
            "echo",
            "echo-1",
            Duration::from_secs(10),
            Duration::from_secs(30),
            WireFormat::Binary,
            None,
        );
        task.tick(&instance).await;
        assert_eq!(task.metrics.heartbeats_sent_total.load(Ordering::Relaxed), 1);

        let fetched = registry.get_instance("echo", "echo-1").await.unwrap().unwrap();
        assert_eq!(fetched.instance_id, "echo-1");
    }

    #[tokio::test]
    async fn tick_re_registers_a_record_deleted_mid_lifetime() {
        let store = Arc::new(InMemoryKvStore::new());
        let registry = ServiceRegistry::new(store);
        let instance = ServiceInstance::new("echo", "echo-1", "1.0.0").unwrap();
        registry.register(&instance, Duration::from_secs(30)).await.unwrap();
        registry.deregister("echo", "echo-1").await.unwrap();
        assert!(registry.get_instance("echo", "echo-1").await.unwrap().is_none());

        let task = HeartbeatTask::new(
            registry.clone(),
            None,
            crate::time::system_clock(),
            Arc::new(RuntimeMetrics::default()),
            "echo",
            "echo-1",
            Duration::from_secs(10),
            Duration::from_secs(30),
            WireFormat::Binary,
            None,
        );
        task.tick(&instance).await;

        assert!(registry.get_instance("echo", "echo-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn run_resyncs_status_with_election_state() {
        let store = Arc::new(InMemoryKvStore::new());
        let registry = ServiceRegistry::new(store.clone());
        let clock = MockClock::new();
        let instance = ServiceInstance::new("order", "order-1", "1.0.0")
            .unwrap()
            .with_sticky_active_group("primary")
            .with_status(ServiceStatus::Standby);
        registry.register(&instance, Duration::from_secs(30)).await.unwrap();

        let election = ElectionController::with_clock(
            store,
            "order",
            "primary",
            "order-1",
            Duration::from_secs(2),
            clock.clone(),
        );
        // No contender yet, so the first tick wins the lease immediately.
        election.tick().await.unwrap();
        assert!(election.is_active());

        let task = Arc::new(HeartbeatTask::new(
            registry.clone(),
            None,
            clock.clone(),
            Arc::new(RuntimeMetrics::default()),
            "order",
            "order-1",
            Duration::from_millis(10),
            Duration::from_secs(30),
            WireFormat::Binary,
            Some(election.clone()),
        ));
        let handle = tokio::spawn(task.run(instance));

        clock.advance(Duration::from_millis(10));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fetched = registry.get_instance("order", "order-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, ServiceStatus::Active);

        election.release().await;
        clock.advance(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fetched = registry.get_instance("order", "order-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, ServiceStatus::Standby);

        handle.abort();
    }
}
