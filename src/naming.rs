//! Subject / key naming (C1).
//!
//! Pure, stateless functions that map `(service, method, domain, event_type,
//! group)` tuples onto broker subjects and KV keys per the grammar in
//! spec §3.5. Nothing here touches the network or the KV store; every
//! function is a total function over validated identifiers, or returns
//! [`Error::InvalidIdentifier`].

use crate::error::{Error, Result};
use std::sync::OnceLock;

fn service_name_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[a-z][a-z0-9-]{1,62}[a-z0-9]$").unwrap())
}

fn method_name_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]*$").unwrap())
}

/// Validates a service name against `^[a-z][a-z0-9-]{1,62}[a-z0-9]$`.
pub fn validate_service_name(name: &str) -> Result<()> {
    if service_name_re().is_match(name) {
        Ok(())
    } else {
        Err(Error::invalid_identifier(
            name,
            "service name must match ^[a-z][a-z0-9-]{1,62}[a-z0-9]$",
        ))
    }
}

/// Validates an RPC method name against `^[a-zA-Z][a-zA-Z0-9_]*$`.
pub fn validate_method_name(name: &str) -> Result<()> {
    if method_name_re().is_match(name) {
        Ok(())
    } else {
        Err(Error::invalid_identifier(
            name,
            "method name must match ^[a-zA-Z][a-zA-Z0-9_]*$",
        ))
    }
}

/// Validates an event subject pattern (`events.<domain>.<event_type>`,
/// wildcards allowed). NATS-style wildcards are only valid as whole path
/// segments: `events.*.changed` is fine, `events.fo*.changed` is not.
pub fn validate_event_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(Error::invalid_identifier(pattern, "event pattern is empty"));
    }
    for segment in pattern.split('.') {
        if segment.is_empty() {
            return Err(Error::invalid_identifier(
                pattern,
                "event pattern has an empty segment",
            ));
        }
        if segment == "*" || segment == ">" {
            continue;
        }
        if segment.contains('*') || segment.contains('>') {
            return Err(Error::invalid_identifier(
                pattern,
                "wildcards must occupy a whole path segment",
            ));
        }
    }
    Ok(())
}

/// `rpc.<service>.<method>` — load-balanced by queue group `<service>`.
pub fn rpc_subject(service: &str, method: &str) -> Result<String> {
    validate_service_name(service)?;
    validate_method_name(method)?;
    Ok(format!("rpc.{service}.{method}"))
}

/// `rpc.<service>.<instance_id>.<method>` — direct-to-instance RPC, used by
/// `call_rpc`'s retry-on-`NOT_ACTIVE` path.
pub fn rpc_instance_subject(service: &str, instance_id: &str, method: &str) -> Result<String> {
    validate_service_name(service)?;
    validate_method_name(method)?;
    Ok(format!("rpc.{service}.{instance_id}.{method}"))
}

/// `cmd.<service>.<command>` — load-balanced by queue group `<service>`,
/// mirroring [`rpc_subject`]'s shape (§4.7: "Command handlers: analogous to
/// RPC"). Not part of the subject grammar table in §3.5, which only names
/// RPC/event/heartbeat subjects explicitly; this follows the same
/// `<kind>.<service>.<leaf>` convention for consistency.
pub fn command_subject(service: &str, command: &str) -> Result<String> {
    validate_service_name(service)?;
    validate_method_name(command)?;
    Ok(format!("cmd.{service}.{command}"))
}

/// `events.<domain>.<event_type>`.
pub fn event_subject(domain: &str, event_type: &str) -> String {
    format!("events.{domain}.{event_type}")
}

/// `internal.heartbeat.<service>`.
pub fn heartbeat_subject(service: &str) -> String {
    format!("internal.heartbeat.{service}")
}

/// `service-instances/<service>/<instance_id>`.
pub fn instance_key(service: &str, instance_id: &str) -> String {
    format!("service-instances/{service}/{instance_id}")
}

/// `service-instances/<service>/` — prefix for a full scan of one service.
pub fn instance_prefix(service: &str) -> String {
    format!("service-instances/{service}/")
}

/// `service-instances/` — prefix watched by the discovery cache (§4.5).
pub const INSTANCE_WATCH_PREFIX: &str = "service-instances/";

/// `service-definitions/<service>`.
pub fn service_definition_key(service: &str) -> String {
    format!("service-definitions/{service}")
}

/// `group-leader/<service>/<group_id>`.
pub fn leader_lease_key(service: &str, group_id: &str) -> String {
    format!("group-leader/{service}/{group_id}")
}

/// Whether concrete `subject` matches `pattern`, honoring the event-layer
/// wildcards from §3.5 ("single-segment `*`, multi-segment `>`"). `>` may
/// only appear as the pattern's final segment, matching it and everything
/// after it; `*` matches exactly one segment. Used by the in-memory message
/// bus in [`crate::testkit`] to route published events to wildcard
/// subscriptions the way a real broker's subject tree would.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_segments = pattern.split('.');
    let mut subject_segments = subject.split('.');
    loop {
        match (pattern_segments.next(), subject_segments.next()) {
            (Some(">"), Some(_)) => return true,
            (Some(">"), None) => return false,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (Some(_), Some(_)) => return false,
            (None, None) => return true,
            (None, Some(_)) | (Some(_), None) => return false,
        }
    }
}

/// Substitutes subject wildcards with textual stand-ins so a pattern can be
/// embedded in a durable consumer name (`*` → `star`, `>` → `gt`). This is
/// the open-question-2 naming scheme from spec §9: stable, documented,
/// collision-possible-in-principle, and accepted as-is.
pub fn sanitize_for_durable_name(pattern: &str) -> String {
    pattern
        .split('.')
        .map(|segment| match segment {
            "*" => "star",
            ">" => "gt",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Base durable consumer name shared by every instance of a service for a
/// given event pattern (`<service_name>-<sanitized(pattern)>`). COMPETE mode
/// uses this name verbatim; BROADCAST mode appends `-<instance_id>`.
pub fn durable_base_name(service: &str, pattern: &str) -> String {
    format!("{service}-{}", sanitize_for_durable_name(pattern))
}

/// Per-instance durable consumer name used by BROADCAST subscriptions.
pub fn durable_broadcast_name(service: &str, pattern: &str, instance_id: &str) -> String {
    format!("{}-{instance_id}", durable_base_name(service, pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_names() {
        assert!(validate_service_name("echo").is_ok());
        assert!(validate_service_name("order-service").is_ok());
        assert!(validate_service_name("A-bad").is_err());
        assert!(validate_service_name("x").is_err());
        assert!(validate_service_name("bad-").is_err());
    }

    #[test]
    fn method_names() {
        assert!(validate_method_name("getUser").is_ok());
        assert!(validate_method_name("get_user_2").is_ok());
        assert!(validate_method_name("2bad").is_err());
        assert!(validate_method_name("bad-name").is_err());
    }

    #[test]
    fn event_patterns() {
        assert!(validate_event_pattern("events.*.changed").is_ok());
        assert!(validate_event_pattern("events.>").is_ok());
        assert!(validate_event_pattern("events.fo*.changed").is_err());
        assert!(validate_event_pattern("").is_err());
        assert!(validate_event_pattern("events..changed").is_err());
    }

    #[test]
    fn subjects_and_keys() {
        assert_eq!(rpc_subject("echo", "ping").unwrap(), "rpc.echo.ping");
        assert_eq!(
            rpc_instance_subject("echo", "echo-1", "ping").unwrap(),
            "rpc.echo.echo-1.ping"
        );
        assert_eq!(event_subject("order", "created"), "events.order.created");
        assert_eq!(command_subject("order", "cancelOrder").unwrap(), "cmd.order.cancelOrder");
        assert_eq!(
            instance_key("echo", "echo-1"),
            "service-instances/echo/echo-1"
        );
        assert_eq!(leader_lease_key("order", "primary"), "group-leader/order/primary");
    }

    #[test]
    fn subject_matching_honors_single_and_multi_segment_wildcards() {
        assert!(subject_matches("events.order.created", "events.order.created"));
        assert!(subject_matches("events.*.created", "events.order.created"));
        assert!(!subject_matches("events.*.created", "events.order.cancelled"));
        assert!(!subject_matches("events.*.created", "events.order.line.created"));
        assert!(subject_matches("events.>", "events.order.created"));
        assert!(subject_matches("events.>", "events.order.line.created"));
        assert!(!subject_matches("events.>", "commands.order.created"));
        assert!(!subject_matches("events.order.created", "events.order"));
    }

    #[test]
    fn durable_names_substitute_wildcards() {
        assert_eq!(sanitize_for_durable_name("events.*.changed"), "events-star-changed");
        assert_eq!(sanitize_for_durable_name("events.>"), "events-gt");
        assert_eq!(
            durable_broadcast_name("config", "events.config.changed", "cfg-1"),
            "config-events-config-changed-cfg-1"
        );
    }
}

/// §8 boundary-behavior laws for the subject grammar, generated rather than
/// enumerated by hand so the wildcard-matching edge cases aren't limited to
/// whatever examples a human thought to write down.
#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Any pair of identifiers that individually pass validation must
        /// produce a subject that's exactly `rpc.<service>.<method>` —
        /// `rpc_subject` neither rejects a valid pair nor mangles them.
        #[test]
        fn valid_identifiers_produce_a_well_formed_rpc_subject(
            service in "[a-z][a-z0-9-]{1,61}[a-z0-9]",
            method in "[a-zA-Z][a-zA-Z0-9_]{0,20}",
        ) {
            let subject = rpc_subject(&service, &method).unwrap();
            prop_assert_eq!(subject, format!("rpc.{service}.{method}"));
        }

        /// A pattern with no wildcard segments only matches itself: the
        /// literal-subject fallback in `subject_matches` must not drift
        /// into accidental partial matches.
        #[test]
        fn wildcard_free_pattern_matches_only_itself(
            segments in proptest::collection::vec("[a-z]{1,8}", 1..5),
            other_segments in proptest::collection::vec("[a-z]{1,8}", 1..5),
        ) {
            let pattern = segments.join(".");
            let subject = other_segments.join(".");
            prop_assert_eq!(subject_matches(&pattern, &subject), pattern == subject);
        }

        /// `*` matches exactly one segment, never zero and never more —
        /// appending a segment after what `*` covers must not still match.
        #[test]
        fn single_segment_wildcard_does_not_match_extra_segments(
            domain in "[a-z]{1,8}",
            event_type in "[a-z]{1,8}",
            extra in "[a-z]{1,8}",
        ) {
            let subject = format!("events.{domain}.{event_type}.{extra}");
            prop_assert!(subject_matches("events.*.>", &subject));
            prop_assert!(!subject_matches(&format!("events.*.{event_type}"), &subject));
        }
    }
}
