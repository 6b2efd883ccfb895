//! Wire-level data model (§3.1, §3.4): service instances, service
//! definitions, and the four message envelope kinds. These are plain,
//! serde-derived value types — no behavior lives here beyond constructors
//! and the small helpers callers need to build a well-formed envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::naming::validate_service_name;

/// §3.1 `ServiceInstance.status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Active,
    Standby,
    Unhealthy,
    Shutdown,
}

/// §3.1 — a single registered instance of a service.
///
/// `(service_name, instance_id)` is unique across the registry at any given
/// time; the registry enforces this by using that pair as the KV key
/// (`service-instances/<service_name>/<instance_id>`), not via any in-memory
/// bookkeeping here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_name: String,
    pub instance_id: String,
    pub version: String,
    pub status: ServiceStatus,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sticky_active_group: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ServiceInstance {
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<Self> {
        let service_name = service_name.into();
        validate_service_name(&service_name)?;
        Ok(Self {
            service_name,
            instance_id: instance_id.into(),
            version: version.into(),
            status: ServiceStatus::Standby,
            last_heartbeat: Utc::now(),
            sticky_active_group: None,
            metadata: BTreeMap::new(),
        })
    }

    pub fn with_sticky_active_group(mut self, group: impl Into<String>) -> Self {
        self.sticky_active_group = Some(group.into());
        self
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether `last_heartbeat` is within `staleness_threshold` of `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, staleness_threshold: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_heartbeat) <= staleness_threshold
    }
}

/// §3.2 — optional catalog entry describing a service independent of any
/// one instance. Not required for runtime operation; consumed by a
/// monitoring surface that is out of scope for this crate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub service_name: String,
    pub owner: String,
    pub description: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields common to every envelope kind (§3.4).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub trace_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

impl Envelope {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            trace_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
        }
    }

    /// A child envelope that carries the same `trace_id` as `self`, for
    /// responses/follow-up messages correlated with this one.
    pub fn child(&self, source: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            trace_id: self.trace_id,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub method: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    pub target: String,
    pub timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub correlation_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub result: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_code: Option<crate::error::RpcErrorCode>,
}

impl RpcResponse {
    pub fn ok(request: &RpcRequest, source: impl Into<String>, result: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            envelope: request.envelope.child(source),
            correlation_id: request.envelope.message_id,
            success: true,
            result,
            error: None,
            error_code: None,
        }
    }

    pub fn err(
        request: &RpcRequest,
        source: impl Into<String>,
        code: crate::error::RpcErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            envelope: request.envelope.child(source),
            correlation_id: request.envelope.message_id,
            success: false,
            result: BTreeMap::new(),
            error: Some(message.into()),
            error_code: Some(code),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub domain: String,
    pub event_type: String,
    pub version: String,
    #[serde(default)]
    pub payload: BTreeMap<String, serde_json::Value>,
}

impl Event {
    pub fn new(
        source: impl Into<String>,
        domain: impl Into<String>,
        event_type: impl Into<String>,
        version: impl Into<String>,
        payload: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            envelope: Envelope::new(source),
            domain: domain.into(),
            event_type: event_type.into(),
            version: version.into(),
            payload,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandPriority {
    Low,
    Normal,
    High,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub command: String,
    #[serde(default)]
    pub payload: BTreeMap<String, serde_json::Value>,
    pub target: String,
    pub priority: CommandPriority,
    /// Subject the issuer is listening on for progress updates, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub progress_subject: Option<String>,
}

impl Command {
    pub fn new(
        source: impl Into<String>,
        command: impl Into<String>,
        target: impl Into<String>,
        payload: BTreeMap<String, serde_json::Value>,
        priority: CommandPriority,
    ) -> Self {
        Self {
            envelope: Envelope::new(source),
            command: command.into(),
            payload,
            target: target.into(),
            priority,
            progress_subject: None,
        }
    }

    pub fn with_progress_subject(mut self, subject: impl Into<String>) -> Self {
        self.progress_subject = Some(subject.into());
        self
    }
}

/// A progress update published to a [`Command`]'s `progress_subject`
/// (§3.4 "optional progress channel"), correlated to the originating
/// command via `correlation_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandProgress {
    #[serde(flatten)]
    pub envelope: Envelope,
    pub correlation_id: Uuid,
    #[serde(default)]
    pub payload: BTreeMap<String, serde_json::Value>,
}

impl CommandProgress {
    pub fn for_command(command: &Command, source: impl Into<String>, payload: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            envelope: command.envelope.child(source),
            correlation_id: command.envelope.message_id,
            payload,
        }
    }
}

/// Validates that `version` looks like `M.m.p` with no leading zeros in any
/// component (used by [`Event::version`] producers and by instance
/// registration).
pub fn validate_semver(version: &str) -> Result<()> {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() != 3 {
        return Err(Error::invalid_identifier(version, "expected M.m.p"));
    }
    for part in parts {
        if part.is_empty() || (part.len() > 1 && part.starts_with('0')) || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::invalid_identifier(version, "each component must be digits with no leading zero"));
        }
    }
    Ok(())
}
