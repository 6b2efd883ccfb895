//! RPC handler registries, the exclusive-RPC gate, and outgoing
//! `call_rpc` (§4.7 "Handler registries", "RPC call (outgoing)").

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

use crate::discovery::ServiceDiscovery;
use crate::election::ElectionController;
use crate::error::{Error, Result};
use crate::model::{Envelope, RpcRequest, RpcResponse, ServiceStatus};
use crate::naming::{rpc_instance_subject, rpc_subject, validate_method_name};
use crate::observability::RuntimeMetrics;
use crate::ports::{InboundMessage, MessageBus, MessageHandler, Subscription};
use crate::retry::BackoffPolicy;
use crate::serialization::{self, WireFormat};

/// A registered RPC handler: takes the request's `params` map, returns a
/// result map or an error message. Handlers run on whatever task the
/// subscription delivered on; long-running work should spawn its own task
/// rather than block the subscription loop.
pub type RpcHandler = Arc<dyn Fn(BTreeMap<String, Value>) -> BoxFuture<'static, std::result::Result<BTreeMap<String, Value>, String>> + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Exclusivity {
    Open,
    Exclusive,
}

/// Per-service RPC handler registry plus the exclusive-RPC gate (§4.7).
/// Shared between the inbound dispatch loop (registered methods) and the
/// outbound `call_rpc` path (which only needs discovery + the bus).
pub struct RpcDispatcher {
    service_name: String,
    instance_id: String,
    bus: Arc<dyn MessageBus>,
    discovery: Arc<ServiceDiscovery>,
    election: Option<Arc<ElectionController>>,
    handlers: DashMap<String, (RpcHandler, Exclusivity)>,
    metrics: Arc<RuntimeMetrics>,
    format: WireFormat,
    subscriptions: parking_lot::Mutex<Vec<Box<dyn Subscription>>>,
}

impl RpcDispatcher {
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        discovery: Arc<ServiceDiscovery>,
        election: Option<Arc<ElectionController>>,
        metrics: Arc<RuntimeMetrics>,
        format: WireFormat,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            bus,
            discovery,
            election,
            handlers: DashMap::new(),
            metrics,
            format,
            subscriptions: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Registers a plain RPC handler for `method` (§6.2
    /// `Service.register_rpc`).
    pub fn register_rpc(&self, method: &str, handler: RpcHandler) -> Result<()> {
        validate_method_name(method)?;
        self.handlers.insert(method.to_string(), (handler, Exclusivity::Open));
        Ok(())
    }

    /// Registers an exclusive RPC handler (§6.2 `register_exclusive_rpc`):
    /// invocation is gated on `election.is_active()`; when not active, the
    /// request is rejected with `NOT_ACTIVE` before the handler runs at
    /// all.
    pub fn register_exclusive_rpc(&self, method: &str, handler: RpcHandler) -> Result<()> {
        validate_method_name(method)?;
        self.handlers.insert(method.to_string(), (handler, Exclusivity::Exclusive));
        Ok(())
    }

    /// Builds the `RpcResponse` for one inbound `RpcRequest`, applying the
    /// exclusive-RPC gate before running the registered handler. Never
    /// panics: an unknown method or a handler error both become a
    /// `success: false` response rather than a dropped message, since
    /// at-least-once delivery means a panicking handler would just get
    /// redelivered and fail again.
    #[instrument(skip(self, request), fields(service = %self.service_name, method = %request.method))]
    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        self.metrics.rpc_calls_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let Some(entry) = self.handlers.get(&request.method) else {
            self.metrics.rpc_errors_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return RpcResponse::err(
                &request,
                &self.instance_id,
                crate::error::RpcErrorCode::ValidationError,
                format!("no handler registered for method `{}`", request.method),
            );
        };
        let (handler, exclusivity) = (entry.0.clone(), entry.1);
        drop(entry);

        if exclusivity == Exclusivity::Exclusive {
            let active = self.election.as_ref().map(|e| e.is_active()).unwrap_or(true);
            if !active {
                return RpcResponse::err(
                    &request,
                    &self.instance_id,
                    crate::error::RpcErrorCode::NotActive,
                    "this instance is not the active leader for its group",
                );
            }
        }

        match handler(request.params.clone()).await {
            Ok(result) => RpcResponse::ok(&request, &self.instance_id, result),
            Err(message) => {
                self.metrics.rpc_errors_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(error = %message, "rpc handler returned an error");
                RpcResponse::err(&request, &self.instance_id, crate::error::RpcErrorCode::HandlerError, message)
            }
        }
    }

    /// Opens, per registered method, one queue-group subscription on
    /// `rpc.<service>.<method>` (§4.7 "Startup sequence" step 5: "One
    /// queue-group subscription per RPC method" — queue group is the
    /// service name, so delivery load-balances across every instance that
    /// registered the same method) plus one direct, ungrouped subscription
    /// on `rpc.<service>.<instance_id>.<method>`. The latter is what lets
    /// `call_rpc`'s retry-on-`NOT_ACTIVE` path address this instance
    /// specifically once discovery has identified it as the active leader,
    /// bypassing the load-balanced subject entirely.
    #[instrument(skip(self), fields(service = %self.service_name))]
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let methods: Vec<String> = self.handlers.iter().map(|entry| entry.key().clone()).collect();
        let mut live = Vec::with_capacity(methods.len() * 2);
        for method in methods {
            let subject = rpc_subject(&self.service_name, &method)?;
            let dispatcher = self.clone();
            let callback: MessageHandler = Box::new(move |message: InboundMessage| {
                let dispatcher = dispatcher.clone();
                Box::pin(async move { dispatcher.handle_inbound(message).await })
            });
            let subscription = self.bus.subscribe(&subject, Some(&self.service_name), None, callback).await?;
            live.push(subscription);

            let direct_subject = rpc_instance_subject(&self.service_name, &self.instance_id, &method)?;
            let dispatcher = self.clone();
            let direct_callback: MessageHandler = Box::new(move |message: InboundMessage| {
                let dispatcher = dispatcher.clone();
                Box::pin(async move { dispatcher.handle_inbound(message).await })
            });
            let direct_subscription = self.bus.subscribe(&direct_subject, None, None, direct_callback).await?;
            live.push(direct_subscription);
        }
        *self.subscriptions.lock() = live;
        Ok(())
    }

    async fn handle_inbound(&self, message: InboundMessage) {
        let request = match serialization::decode(&message.payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "dropping undecodable rpc request");
                return;
            }
        };
        let response = self.dispatch(request).await;
        let Some(reply_to) = message.reply_to else { return };
        match serialization::encode(&response, self.format) {
            Ok(bytes) => {
                if let Err(err) = self.bus.publish(&reply_to, bytes).await {
                    warn!(error = %err, "failed to publish rpc reply");
                }
            }
            Err(err) => warn!(error = %err, "failed to encode rpc reply"),
        }
    }

    /// Unsubscribes every live method subscription (§4.7 shutdown step 2).
    pub async fn stop(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in subscriptions {
            if let Err(err) = subscription.unsubscribe().await {
                warn!(error = %err, "failed to unsubscribe rpc handler during shutdown");
            }
        }
    }

    /// Outgoing RPC (§4.7 "RPC call (outgoing)"): publishes to the
    /// load-balanced subject, awaits a reply within `timeout`, and —
    /// when `retry_on_not_active` is set and the response comes back
    /// `NOT_ACTIVE` — invalidates discovery, re-resolves the active
    /// instance, and retries direct-to-instance with jittered backoff up
    /// to `max_retries`.
    #[instrument(skip(self, params))]
    pub async fn call_rpc(
        &self,
        target_service: &str,
        method: &str,
        params: BTreeMap<String, Value>,
        timeout: Duration,
        retry_on_not_active: bool,
        max_retries: u32,
    ) -> Result<BTreeMap<String, Value>> {
        validate_method_name(method)?;
        let subject = rpc_subject(target_service, method)?;
        let response = self.request_once(&subject, target_service, method, &params, timeout).await?;

        if response.success {
            return Ok(response.result);
        }
        if response.error_code != Some(crate::error::RpcErrorCode::NotActive) || !retry_on_not_active {
            return Err(Error::rpc(
                target_service,
                response.error_code.unwrap_or(crate::error::RpcErrorCode::HandlerError),
                response.error.unwrap_or_default(),
            ));
        }

        let backoff = BackoffPolicy::default();
        for attempt in 0..max_retries {
            self.discovery.invalidate_cache(Some(target_service));
            let delay = backoff.jittered_delay_for_attempt(attempt);
            tokio::time::sleep(delay).await;

            // NOT_ACTIVE means some other instance holds the lease now; look
            // specifically for the instance discovery currently reports as
            // ACTIVE rather than any eligible (Active-or-Standby) instance,
            // since a Sticky pick could otherwise keep landing on the same
            // deposed leader.
            let candidates = self.discovery.discover_instances(target_service).await?;
            let Some(instance) = candidates
                .into_iter()
                .filter(|candidate| candidate.status == ServiceStatus::Active)
                .min_by(|a, b| a.instance_id.cmp(&b.instance_id))
            else {
                continue;
            };
            let direct_subject = rpc_instance_subject(target_service, &instance.instance_id, method)?;
            let response = self.request_once(&direct_subject, target_service, method, &params, timeout).await?;

            if response.success {
                return Ok(response.result);
            }
            if response.error_code != Some(crate::error::RpcErrorCode::NotActive) {
                return Err(Error::rpc(
                    target_service,
                    response.error_code.unwrap_or(crate::error::RpcErrorCode::HandlerError),
                    response.error.unwrap_or_default(),
                ));
            }
        }

        Err(Error::rpc(
            target_service,
            crate::error::RpcErrorCode::NotActive,
            "exhausted retries waiting for an active instance",
        ))
    }

    async fn request_once(
        &self,
        subject: &str,
        target_service: &str,
        method: &str,
        params: &BTreeMap<String, Value>,
        timeout: Duration,
    ) -> Result<RpcResponse> {
        let request = RpcRequest {
            envelope: Envelope::new(&self.instance_id),
            method: method.to_string(),
            params: params.clone(),
            target: target_service.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
        let bytes = serialization::encode(&request, self.format)?;
        let reply_bytes = self.bus.request(subject, bytes, timeout).await.map_err(|err| {
            if matches!(&err, Error::RpcError { code: crate::error::RpcErrorCode::Timeout, .. }) {
                err
            } else {
                Error::rpc(target_service, crate::error::RpcErrorCode::Timeout, err.to_string())
            }
        })?;
        serialization::decode(&reply_bytes)
    }
}
