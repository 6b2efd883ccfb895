//! Service lifecycle (§4.7 "Startup sequence" / "Shutdown sequence", §6.2
//! "Service-facing API").
//!
//! `Service` is the owned, non-global handle the rest of the API hangs
//! off: one per running process, built from a [`ServiceConfig`] and a
//! broker/store adapter pair, with handler registration happening on the
//! builder before [`Service::start`] opens any subscriptions.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::discovery::{DiscoveryConfig, SelectionPolicy, ServiceDiscovery};
use crate::election::ElectionController;
use crate::error::Result;
use crate::model::{Event, ServiceInstance, ServiceStatus};
use crate::observability::{CacheMetricsSnapshot, RuntimeMetrics, RuntimeMetricsSnapshot};
use crate::ports::{KvStore, MessageBus};
use crate::registry::ServiceRegistry;
use crate::runtime::commands::{CommandDispatcher, CommandHandler};
use crate::runtime::config::ServiceConfig;
use crate::runtime::dispatch::{RpcDispatcher, RpcHandler};
use crate::runtime::events::{EventDispatcher, EventHandler, SubscriptionMode};
use crate::runtime::heartbeat::HeartbeatTask;
use crate::serialization;

/// A running (or not-yet-started) service instance (§6.2
/// `Service(config, bus)`).
pub struct Service {
    config: ServiceConfig,
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn KvStore>,
    registry: ServiceRegistry,
    discovery: Arc<ServiceDiscovery>,
    election: Option<Arc<ElectionController>>,
    dispatch: Arc<RpcDispatcher>,
    events: Arc<EventDispatcher>,
    commands: Arc<CommandDispatcher>,
    heartbeat: Option<Arc<HeartbeatTask>>,
    metrics: Arc<RuntimeMetrics>,
    instance: parking_lot::Mutex<ServiceInstance>,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    started: AtomicBool,
}

impl Service {
    /// Builds (but does not start) a service from `config` and the two
    /// broker ports. Registers no handlers yet — callers call
    /// `register_rpc`/`register_exclusive_rpc`/`subscribe_event` before
    /// `start()`.
    pub fn new(config: ServiceConfig, bus: Arc<dyn MessageBus>, store: Arc<dyn KvStore>) -> Result<Arc<Self>> {
        config.validate()?;
        let registry = ServiceRegistry::new(store.clone());
        let discovery = ServiceDiscovery::new(
            registry.clone(),
            store.clone(),
            DiscoveryConfig {
                cache_ttl: config.cache_ttl,
                staleness_threshold: config.cache_staleness_threshold,
                watch_enabled: config.watch_enabled,
                watch_backoff: config.watch_backoff,
                ..DiscoveryConfig::default()
            },
        );

        let election = config.sticky_active_group.as_ref().map(|group_id| {
            ElectionController::new(
                store.clone(),
                config.service_name.clone(),
                group_id.clone(),
                config.instance_id.clone(),
                config.leader_ttl,
            )
        });

        let metrics = Arc::new(RuntimeMetrics::default());
        let dispatch = Arc::new(RpcDispatcher::new(
            config.service_name.clone(),
            config.instance_id.clone(),
            bus.clone(),
            discovery.clone(),
            election.clone(),
            metrics.clone(),
            config.serialization_format,
        ));
        let events = Arc::new(EventDispatcher::new(
            config.service_name.clone(),
            config.instance_id.clone(),
            bus.clone(),
            metrics.clone(),
        ));
        let commands = Arc::new(CommandDispatcher::new(
            config.service_name.clone(),
            config.instance_id.clone(),
            bus.clone(),
            metrics.clone(),
            config.serialization_format,
        ));

        let heartbeat = if config.enable_registration {
            Some(Arc::new(HeartbeatTask::new(
                registry.clone(),
                Some(bus.clone()),
                crate::time::system_clock(),
                metrics.clone(),
                config.service_name.clone(),
                config.instance_id.clone(),
                config.heartbeat_interval,
                config.registry_ttl,
                config.serialization_format,
                election.clone(),
            )))
        } else {
            None
        };

        let instance = ServiceInstance::new(&config.service_name, &config.instance_id, &config.version)?;
        let instance = match &config.sticky_active_group {
            Some(group) => instance.with_sticky_active_group(group.clone()).with_status(ServiceStatus::Standby),
            None => instance.with_status(ServiceStatus::Active),
        };

        Ok(Arc::new(Self {
            config,
            bus,
            store,
            registry,
            discovery,
            election,
            dispatch,
            events,
            commands,
            heartbeat,
            metrics,
            instance: parking_lot::Mutex::new(instance),
            tasks: parking_lot::Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }))
    }

    pub fn register_rpc(&self, method: &str, handler: RpcHandler) -> Result<()> {
        self.dispatch.register_rpc(method, handler)
    }

    pub fn register_exclusive_rpc(&self, method: &str, handler: RpcHandler) -> Result<()> {
        self.dispatch.register_exclusive_rpc(method, handler)
    }

    pub fn subscribe_event(&self, pattern: &str, mode: SubscriptionMode, handler: EventHandler) -> Result<()> {
        self.events.register(pattern, mode, handler)
    }

    pub fn register_command(&self, command: &str, handler: CommandHandler) -> Result<()> {
        self.commands.register_command(command, handler)
    }

    /// §6.2-adjacent outgoing command call; see
    /// [`crate::runtime::commands::CommandDispatcher::call_command`].
    pub async fn call_command(
        &self,
        target: &str,
        command: &str,
        payload: BTreeMap<String, Value>,
        priority: crate::model::CommandPriority,
        progress_subject: Option<String>,
        timeout: Duration,
    ) -> Result<BTreeMap<String, Value>> {
        self.commands
            .call_command(target, command, payload, priority, progress_subject, timeout)
            .await
    }

    pub fn discovery(&self) -> &Arc<ServiceDiscovery> {
        &self.discovery
    }

    pub fn metrics(&self) -> RuntimeMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn cache_metrics(&self) -> CacheMetricsSnapshot {
        self.discovery.metrics.snapshot()
    }

    pub async fn discover_instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        self.discovery.discover_instances(service_name).await
    }

    pub async fn select_instance(&self, service_name: &str, policy: SelectionPolicy) -> Result<Option<ServiceInstance>> {
        self.discovery.select_instance(service_name, policy).await
    }

    /// §6.2 `Service.call_rpc`.
    pub async fn call_rpc(
        &self,
        target: &str,
        method: &str,
        params: BTreeMap<String, Value>,
        timeout: Duration,
        retry_on_not_active: bool,
    ) -> Result<BTreeMap<String, Value>> {
        self.dispatch
            .call_rpc(target, method, params, timeout, retry_on_not_active, self.config.rpc_max_not_active_retries)
            .await
    }

    /// §6.2 `Service.publish_event`.
    pub async fn publish_event(
        &self,
        domain: &str,
        event_type: &str,
        payload: BTreeMap<String, Value>,
        version: &str,
    ) -> Result<()> {
        let event = Event::new(&self.config.instance_id, domain, event_type, version, payload);
        let bytes = serialization::encode(&event, self.config.serialization_format)?;
        self.bus
            .publish(&crate::naming::event_subject(domain, event_type), bytes)
            .await?;
        self.metrics.events_published_total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// §4.7 "Startup sequence". Steps 1 (broker connect) and 2 (serializer
    /// init) are adapter/construction-time concerns already satisfied by
    /// the time `Service::new` returns; this runs steps 3-6.
    #[instrument(skip(self), fields(service = %self.config.service_name, instance_id = %self.config.instance_id))]
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.config.enable_registration {
            self.registry.register(&self.instance.lock().clone(), self.config.registry_ttl).await?;
            if let Some(heartbeat) = &self.heartbeat {
                let heartbeat = heartbeat.clone();
                let instance = self.instance.lock().clone();
                self.tasks.lock().push(tokio::spawn(heartbeat.run(instance)));
            }
        }

        if let Some(election) = &self.election {
            let election = election.clone();
            self.tasks.lock().push(tokio::spawn(election.run()));
        }

        self.dispatch.start().await?;
        self.events.start().await?;
        self.commands.start().await?;

        // `instance.status` is already Standby/Active from construction
        // (§4.7 step 6); from here on the heartbeat task keeps it resynced
        // with `self.election`'s actual transitions on every tick.
        info!("service started");
        Ok(())
    }

    /// §4.7 "Shutdown sequence". Steps are best-effort and tolerant of
    /// partial failure, per spec.
    #[instrument(skip(self), fields(service = %self.config.service_name, instance_id = %self.config.instance_id))]
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        self.events.stop().await;
        self.dispatch.stop().await;
        self.commands.stop().await;

        if let Some(election) = &self.election {
            election.release().await;
        }

        for task in std::mem::take(&mut *self.tasks.lock()) {
            task.abort();
        }

        if self.config.enable_registration {
            self.registry
                .deregister(&self.config.service_name, &self.config.instance_id)
                .await
                .ok();
        }

        self.discovery.stop();

        info!(metrics = ?self.metrics.snapshot(), "service stopped, final metrics snapshot");
    }
}
