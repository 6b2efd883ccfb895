//! Service Registry (C4, §4.4).
//!
//! `ServiceRegistry` is a thin, stateless-except-for-its-store wrapper over
//! [`KvStore`]: every operation is a single KV call (or a scan) plus
//! encode/decode. It does not cache anything — that job belongs to
//! [`crate::discovery`], which wraps a `ServiceRegistry` with a
//! watch-invalidated cache.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

use crate::error::{Error, Result};
use crate::model::ServiceInstance;
use crate::naming::{instance_key, instance_prefix};
use crate::ports::{KvStore, PutOptions};
use crate::serialization::{self, WireFormat};

/// Service registry (C4). Holds only a handle to the backing store — it is
/// cheap to clone and safe to share across tasks.
#[derive(Clone)]
pub struct ServiceRegistry {
    store: Arc<dyn KvStore>,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Writes `service-instances/<service>/<instance_id>` with the given
    /// TTL. A pre-existing entry at the same key is overwritten, which is
    /// exactly what makes re-registration after a crash idempotent: the new
    /// process simply writes itself back in, with no coordination with
    /// whatever was there before.
    #[instrument(skip(self, instance), fields(service = %instance.service_name, instance_id = %instance.instance_id))]
    pub async fn register(&self, instance: &ServiceInstance, ttl: Duration) -> Result<()> {
        let key = instance_key(&instance.service_name, &instance.instance_id);
        let bytes = serialization::encode(instance, WireFormat::Binary)?;
        self.store
            .put(&key, bytes, PutOptions::with_ttl(ttl))
            .await
            .map_err(|e| Error::registration(instance.service_name.clone(), e))?;
        tracing::info!("registered service instance");
        Ok(())
    }

    /// Refreshes TTL by re-writing the record with `instance` (whose
    /// `last_heartbeat` the caller is expected to have just updated). If the
    /// record went missing since the last successful write — TTL expiry
    /// during a network partition, or a broker restart that dropped the
    /// bucket — this transparently falls back to [`Self::register`], per
    /// §4.4: "If the record is missing ... the registry re-registers the
    /// instance transparently."
    #[instrument(skip(self, instance), fields(service = %instance.service_name, instance_id = %instance.instance_id))]
    pub async fn update_heartbeat(&self, instance: &ServiceInstance, ttl: Duration) -> Result<()> {
        self.register(instance, ttl).await
    }

    /// Best-effort delete. Never errors on absence (§4.4 invariant 3:
    /// calling this twice leaves the registry in the same state as once).
    #[instrument(skip(self))]
    pub async fn deregister(&self, service_name: &str, instance_id: &str) -> Result<()> {
        let key = instance_key(service_name, instance_id);
        match self.store.delete(&key).await {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(error = %err, "deregister failed, ignoring");
                Ok(())
            }
        }
    }

    /// Direct lookup of one instance.
    pub async fn get_instance(&self, service_name: &str, instance_id: &str) -> Result<Option<ServiceInstance>> {
        let key = instance_key(service_name, instance_id);
        match self.store.get(&key).await? {
            None => Ok(None),
            Some(entry) => Ok(Some(serialization::decode(&entry.value)?)),
        }
    }

    /// Prefix scan of every live instance of `service_name`. Malformed
    /// records (a different schema version, or data another subsystem wrote
    /// under the same prefix) are skipped rather than failing the whole
    /// scan, since a single bad record must not make the rest of the
    /// service invisible to discovery.
    pub async fn list_instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        let prefix = instance_prefix(service_name);
        let mut stream = self.store.list(&prefix).await?;
        let mut instances = Vec::new();
        while let Some((key, value)) = stream.next().await {
            match serialization::decode::<ServiceInstance>(&value) {
                Ok(instance) => instances.push(instance),
                Err(err) => warn!(key, error = %err, "skipping malformed registry record"),
            }
        }
        Ok(instances)
    }

    /// Derives the set of distinct service names with at least one live
    /// instance, by scanning the whole `service-instances/` prefix.
    pub async fn list_all_services(&self) -> Result<Vec<String>> {
        let mut stream = self.store.keys(crate::naming::INSTANCE_WATCH_PREFIX).await?;
        let mut names = std::collections::BTreeSet::new();
        while let Some(key) = stream.next().await {
            if let Some(service_name) = parse_service_name_from_key(&key) {
                names.insert(service_name.to_string());
            }
        }
        Ok(names.into_iter().collect())
    }
}

fn parse_service_name_from_key(key: &str) -> Option<&str> {
    let rest = key.strip_prefix(crate::naming::INSTANCE_WATCH_PREFIX)?;
    rest.split('/').next().filter(|s| !s.is_empty())
}
