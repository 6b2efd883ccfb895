//! Service Discovery + Watchable Cache (C5, §4.5).
//!
//! `ServiceDiscovery` wraps a [`ServiceRegistry`] with a per-service cache
//! that is invalidated two ways: lazily, by a single long-lived watcher on
//! the whole `service-instances/` prefix, and defensively, by an absolute
//! TTL that fires even when the watch is healthy. Refresh itself is always
//! lazy — invalidation only flips a flag; the next read does the backend
//! call — which is what lets a burst of registry churn collapse into one
//! re-fetch per service instead of one per event.

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::model::{ServiceInstance, ServiceStatus};
use crate::naming::INSTANCE_WATCH_PREFIX;
use crate::observability::CacheMetrics;
use crate::ports::KvStore;
use crate::registry::ServiceRegistry;
use crate::retry::BackoffPolicy;
use crate::time::Clock;

/// Instance selection policy for [`ServiceDiscovery::select_instance`]
/// (§4.5 contract).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionPolicy {
    RoundRobin,
    Random,
    /// Picks the lexicographically smallest live `instance_id`, so that (in
    /// the common case of a stable instance set) repeated calls keep
    /// landing on the same instance.
    Sticky,
}

struct CacheEntry {
    instances: Vec<ServiceInstance>,
    expires_at: std::time::Instant,
    valid: bool,
}

struct Cache {
    entries: HashMap<String, CacheEntry>,
    round_robin_cursors: HashMap<String, usize>,
}

/// Discovery + cache options, distinct from the broader runtime
/// [`crate::runtime::config::ServiceConfig`] so this type is usable on its
/// own (§6.2: `ServiceDiscovery` is listed as independently constructible).
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub cache_ttl: Duration,
    pub staleness_threshold: Duration,
    pub watch_enabled: bool,
    pub watch_backoff: BackoffPolicy,
    /// Statuses considered eligible for discovery, per §4.5: "returns only
    /// records whose status is ACTIVE or STANDBY (configurable filter)".
    pub eligible_statuses: Vec<ServiceStatus>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            staleness_threshold: Duration::from_secs(45),
            watch_enabled: true,
            watch_backoff: BackoffPolicy::default(),
            eligible_statuses: vec![ServiceStatus::Active, ServiceStatus::Standby],
        }
    }
}

/// Service discovery (C5): a registry plus a watch-invalidated cache.
pub struct ServiceDiscovery {
    registry: ServiceRegistry,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: DiscoveryConfig,
    cache: Mutex<Cache>,
    pub metrics: Arc<CacheMetrics>,
    watcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ServiceDiscovery {
    pub fn new(registry: ServiceRegistry, store: Arc<dyn KvStore>, config: DiscoveryConfig) -> Arc<Self> {
        Self::with_clock(registry, store, config, crate::time::system_clock())
    }

    pub fn with_clock(
        registry: ServiceRegistry,
        store: Arc<dyn KvStore>,
        config: DiscoveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let discovery = Arc::new(Self {
            registry,
            store,
            clock,
            config,
            cache: Mutex::new(Cache {
                entries: HashMap::new(),
                round_robin_cursors: HashMap::new(),
            }),
            metrics: Arc::new(CacheMetrics::default()),
            watcher: Mutex::new(None),
        });
        if discovery.config.watch_enabled {
            discovery.clone().spawn_watcher();
        }
        discovery
    }

    /// Starts the long-lived watcher task over `service-instances/`. Exposed
    /// separately from construction so tests that don't need it can opt out
    /// via `DiscoveryConfig { watch_enabled: false, .. }` and drive
    /// invalidation purely through TTL.
    fn spawn_watcher(self: Arc<Self>) {
        let handle = tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                let stream = match self.store.watch(INSTANCE_WATCH_PREFIX).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        if !self.config.watch_backoff.attempt_allowed(attempt) {
                            warn!(error = %err, "discovery watcher giving up after exhausting reconnect attempts");
                            return;
                        }
                        let delay = self.config.watch_backoff.jittered_delay_for_attempt(attempt);
                        warn!(error = %err, attempt, ?delay, "discovery watcher failed to open watch, retrying");
                        self.clock.sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                };
                attempt = 0;
                self.drain_watch(stream).await;
                // The stream ended (transport dropped); reconnect.
                CacheMetrics::inc(&self.metrics.watch_reconnects);
                let delay = self.config.watch_backoff.jittered_delay_for_attempt(0);
                self.clock.sleep(delay).await;
            }
        });
        *self.watcher.lock() = Some(handle);
    }

    async fn drain_watch(&self, mut stream: crate::ports::WatchStream) {
        use futures::StreamExt;
        while let Some(event) = stream.next().await {
            CacheMetrics::inc(&self.metrics.watch_events_total);
            if let Some(service_name) = parse_service_name(&event.key) {
                debug!(service = service_name, kind = ?event.kind, "invalidating discovery cache from watch event");
                self.invalidate_one(service_name, true);
            }
        }
    }

    fn invalidate_one(&self, service_name: &str, from_watch: bool) {
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.entries.get_mut(service_name) {
            entry.valid = false;
        }
        if from_watch {
            CacheMetrics::inc(&self.metrics.invalidations_from_watch);
        }
    }

    /// Manually invalidates one service's cache entry, or the whole cache
    /// when `service_name` is `None` (§4.5 `invalidate_cache(service_name |
    /// all)`).
    pub fn invalidate_cache(&self, service_name: Option<&str>) {
        let mut cache = self.cache.lock();
        match service_name {
            Some(name) => {
                if let Some(entry) = cache.entries.get_mut(name) {
                    entry.valid = false;
                }
            }
            None => {
                for entry in cache.entries.values_mut() {
                    entry.valid = false;
                }
            }
        }
    }

    /// Returns every live, eligible instance of `service_name`. Filters out
    /// stale entries (heartbeat older than `staleness_threshold`) and
    /// entries whose `status` is not in `eligible_statuses`, as §4.5
    /// requires, on every read — including cache hits, since the cache
    /// stores raw registry records and staleness is relative to "now".
    #[instrument(skip(self))]
    pub async fn discover_instances(&self, service_name: &str) -> crate::error::Result<Vec<ServiceInstance>> {
        let raw = self.read_through_cache(service_name).await?;
        let now = chrono::Utc::now();
        let threshold = chrono::Duration::from_std(self.config.staleness_threshold).unwrap_or(chrono::Duration::zero());
        Ok(raw
            .into_iter()
            .filter(|instance| instance.is_fresh(now, threshold))
            .filter(|instance| self.config.eligible_statuses.contains(&instance.status))
            .collect())
    }

    async fn read_through_cache(&self, service_name: &str) -> crate::error::Result<Vec<ServiceInstance>> {
        {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.entries.get(service_name) {
                if entry.valid && self.clock.now() < entry.expires_at {
                    CacheMetrics::inc(&self.metrics.cache_hits);
                    return Ok(entry.instances.clone());
                }
                if entry.valid && self.clock.now() >= entry.expires_at {
                    CacheMetrics::inc(&self.metrics.invalidations_from_ttl);
                }
            }
            // Lock drops at the end of this scope, before the (possibly
            // slow) backend call below; we re-acquire it only to write the
            // refreshed entry.
        }

        CacheMetrics::inc(&self.metrics.cache_misses);
        let instances = self.registry.list_instances(service_name).await?;

        let mut cache = self.cache.lock();
        cache.entries.insert(
            service_name.to_string(),
            CacheEntry {
                instances: instances.clone(),
                expires_at: self.clock.now() + self.config.cache_ttl,
                valid: true,
            },
        );
        Ok(instances)
    }

    /// Selects one instance of `service_name` per `policy`, or `None` if no
    /// eligible instance exists. Ties (several candidates judged equal by
    /// the policy) always break on the `instance_id`'s natural sort order,
    /// so selection is deterministic given the same instance set.
    pub async fn select_instance(
        &self,
        service_name: &str,
        policy: SelectionPolicy,
    ) -> crate::error::Result<Option<ServiceInstance>> {
        let mut instances = self.discover_instances(service_name).await?;
        if instances.is_empty() {
            return Ok(None);
        }
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        let chosen = match policy {
            SelectionPolicy::Sticky => instances.into_iter().next(),
            SelectionPolicy::Random => {
                instances.choose(&mut rand::thread_rng()).cloned()
            }
            SelectionPolicy::RoundRobin => {
                let mut cache = self.cache.lock();
                let cursor = cache.round_robin_cursors.entry(service_name.to_string()).or_insert(0);
                let index = *cursor % instances.len();
                *cursor = cursor.wrapping_add(1);
                Some(instances[index].clone())
            }
        };
        Ok(chosen)
    }

    /// Aborts the background watcher, if one is running. Called from
    /// `Service::stop` during shutdown.
    pub fn stop(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }
}

fn parse_service_name(key: &str) -> Option<&str> {
    let rest = key.strip_prefix(INSTANCE_WATCH_PREFIX)?;
    rest.split('/').next().filter(|s| !s.is_empty())
}
