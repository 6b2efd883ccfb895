//! Runtime configuration (§6.4 "Configuration (recognized options)").
//!
//! `ServiceConfig` is a plain value type with one field per row of §6.4's
//! table and the documented defaults baked into [`Default`]. Builder-style
//! `with_*` methods let callers override individual fields without
//! reconstructing the whole struct, matching the teacher's own
//! `TransportConfig` builder shape.

use std::time::Duration;

use crate::discovery::SelectionPolicy;
use crate::error::{Error, Result};
use crate::model::validate_semver;
use crate::naming::validate_service_name;
use crate::retry::BackoffPolicy;
use crate::serialization::WireFormat;

/// §6.4 configuration surface. Constructed via [`ServiceConfig::new`], then
/// refined with the `with_*` builders before being handed to
/// [`crate::runtime::service::Service::new`].
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub service_name: String,
    pub instance_id: String,
    pub version: String,
    pub broker_servers: Vec<String>,
    pub serialization_format: WireFormat,
    pub registry_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub enable_registration: bool,
    pub sticky_active_group: Option<String>,
    pub leader_ttl: Duration,
    pub cache_ttl: Duration,
    pub cache_staleness_threshold: Duration,
    pub watch_enabled: bool,
    pub watch_backoff: BackoffPolicy,
    pub rpc_default_timeout: Duration,
    pub rpc_max_not_active_retries: u32,
    pub selection_policy: SelectionPolicy,
}

impl ServiceConfig {
    /// Validates `service_name` and `version` and fills in every default
    /// from §6.4, including the derived ones (`instance_id` defaults to
    /// `<service_name>-<random>`; `heartbeat_interval` to `registry_ttl /
    /// 3`; `cache_staleness_threshold` to `registry_ttl * 1.5`).
    pub fn new(service_name: impl Into<String>, version: impl Into<String>) -> Result<Self> {
        let service_name = service_name.into();
        let version = version.into();
        validate_service_name(&service_name)?;
        validate_semver(&version)?;

        let registry_ttl = Duration::from_secs(30);
        let instance_id = format!("{service_name}-{}", uuid::Uuid::new_v4().simple());

        Ok(Self {
            instance_id,
            heartbeat_interval: registry_ttl / 3,
            cache_staleness_threshold: registry_ttl.mul_f64(1.5),
            service_name,
            version,
            broker_servers: Vec::new(),
            serialization_format: WireFormat::Binary,
            registry_ttl,
            enable_registration: true,
            sticky_active_group: None,
            leader_ttl: Duration::from_secs(2),
            cache_ttl: Duration::from_secs(30),
            watch_enabled: true,
            watch_backoff: BackoffPolicy::default(),
            rpc_default_timeout: Duration::from_millis(5000),
            rpc_max_not_active_retries: 3,
            selection_policy: SelectionPolicy::RoundRobin,
        })
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_broker_servers(mut self, servers: Vec<String>) -> Self {
        self.broker_servers = servers;
        self
    }

    pub fn with_registry_ttl(mut self, ttl: Duration) -> Self {
        self.registry_ttl = ttl;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_enable_registration(mut self, enabled: bool) -> Self {
        self.enable_registration = enabled;
        self
    }

    /// Enables C6 for this service (§6.4 `sticky_active_group` is
    /// opt-in).
    pub fn with_sticky_active_group(mut self, group_id: impl Into<String>) -> Self {
        self.sticky_active_group = Some(group_id.into());
        self
    }

    pub fn with_leader_ttl(mut self, ttl: Duration) -> Self {
        self.leader_ttl = ttl;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_watch_enabled(mut self, enabled: bool) -> Self {
        self.watch_enabled = enabled;
        self
    }

    pub fn with_rpc_default_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_default_timeout = timeout;
        self
    }

    pub fn with_rpc_max_not_active_retries(mut self, retries: u32) -> Self {
        self.rpc_max_not_active_retries = retries;
        self
    }

    pub fn with_selection_policy(mut self, policy: SelectionPolicy) -> Self {
        self.selection_policy = policy;
        self
    }

    pub fn with_serialization_format(mut self, format: WireFormat) -> Self {
        self.serialization_format = format;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_service_name(&self.service_name)?;
        validate_semver(&self.version)?;
        if self.instance_id.is_empty() {
            return Err(Error::invalid_identifier(&self.instance_id, "instance_id must not be empty"));
        }
        if self.sticky_active_group.is_some() && !self.enable_registration {
            // Without registration, this instance never appears in the
            // registry, so no peer's call_rpc retry-on-NOT_ACTIVE can ever
            // discover it as the active leader — the documented retry
            // contract would be unsatisfiable.
            return Err(Error::invalid_identifier(
                self.sticky_active_group.as_deref().unwrap_or_default(),
                "sticky_active_group requires enable_registration",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let config = ServiceConfig::new("echo", "1.0.0").unwrap();
        assert_eq!(config.registry_ttl, Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.leader_ttl, Duration::from_secs(2));
        assert_eq!(config.cache_ttl, Duration::from_secs(30));
        assert_eq!(config.cache_staleness_threshold, Duration::from_secs(45));
        assert!(config.enable_registration);
        assert!(config.watch_enabled);
        assert_eq!(config.rpc_max_not_active_retries, 3);
        assert!(config.instance_id.starts_with("echo-"));
    }

    #[test]
    fn rejects_invalid_service_name() {
        assert!(ServiceConfig::new("Bad_Name", "1.0.0").is_err());
    }

    #[test]
    fn builders_override_defaults() {
        let config = ServiceConfig::new("echo", "1.0.0")
            .unwrap()
            .with_sticky_active_group("primary")
            .with_leader_ttl(Duration::from_secs(5));
        assert_eq!(config.sticky_active_group.as_deref(), Some("primary"));
        assert_eq!(config.leader_ttl, Duration::from_secs(5));
    }

    #[test]
    fn sticky_active_group_without_registration_fails_validation() {
        let config = ServiceConfig::new("order", "1.0.0")
            .unwrap()
            .with_sticky_active_group("primary")
            .with_enable_registration(false);
        assert!(config.validate().is_err());
    }

    #[test]
    fn sticky_active_group_with_registration_passes_validation() {
        let config = ServiceConfig::new("order", "1.0.0").unwrap().with_sticky_active_group("primary");
        assert!(config.validate().is_ok());
    }
}
