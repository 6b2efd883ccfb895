//! Command handler registry (§4.7 "Handler registries": "Command handlers:
//! analogous to RPC but with optional streaming progress").
//!
//! Structurally this mirrors [`crate::runtime::dispatch::RpcDispatcher`]:
//! a method-name-keyed registry of type-erased handlers, one queue-group
//! subscription per registered command name, dispatch that never panics on
//! an unknown command or a handler error. The one addition is a
//! [`ProgressReporter`] handed to every handler invocation, which publishes
//! [`crate::model::CommandProgress`] updates to the command's
//! `progress_subject` when the issuer supplied one — and is a harmless
//! no-op otherwise, so handlers don't need to branch on whether anyone is
//! listening.

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

use crate::error::{Error, Result};
use crate::model::{Command, CommandPriority, CommandProgress, RpcResponse};
use crate::naming::{command_subject, validate_method_name};
use crate::observability::RuntimeMetrics;
use crate::ports::{InboundMessage, MessageBus, MessageHandler, Subscription};
use crate::serialization::{self, WireFormat};

/// Publishes progress updates for one in-flight command, or no-ops when the
/// issuer didn't supply a `progress_subject` (most commands won't need
/// one).
#[derive(Clone)]
pub struct ProgressReporter {
    bus: Arc<dyn MessageBus>,
    source: String,
    format: WireFormat,
    subject: Option<String>,
    correlation: Command,
}

impl ProgressReporter {
    fn new(bus: Arc<dyn MessageBus>, source: String, format: WireFormat, command: &Command) -> Self {
        Self {
            bus,
            source,
            format,
            subject: command.progress_subject.clone(),
            correlation: command.clone(),
        }
    }

    /// Publishes one progress update. Returns without touching the bus if
    /// the issuer didn't ask for progress updates.
    pub async fn report(&self, payload: BTreeMap<String, Value>) {
        let Some(subject) = &self.subject else { return };
        let progress = CommandProgress::for_command(&self.correlation, &self.source, payload);
        match serialization::encode(&progress, self.format) {
            Ok(bytes) => {
                if let Err(err) = self.bus.publish(subject, bytes).await {
                    warn!(error = %err, "failed to publish command progress update");
                }
            }
            Err(err) => warn!(error = %err, "failed to encode command progress update"),
        }
    }
}

/// A registered command handler: takes the decoded [`Command`] and a
/// [`ProgressReporter`], returns a result map or an error message, exactly
/// like an [`crate::runtime::dispatch::RpcHandler`] plus the reporter.
pub type CommandHandler = Arc<
    dyn Fn(Command, ProgressReporter) -> BoxFuture<'static, std::result::Result<BTreeMap<String, Value>, String>>
        + Send
        + Sync,
>;

/// Per-service command handler registry (§6.2-adjacent: commands are
/// registered the same way RPC methods and event patterns are, via a
/// builder call before `start()`).
pub struct CommandDispatcher {
    service_name: String,
    instance_id: String,
    bus: Arc<dyn MessageBus>,
    handlers: DashMap<String, CommandHandler>,
    metrics: Arc<RuntimeMetrics>,
    format: WireFormat,
    subscriptions: parking_lot::Mutex<Vec<Box<dyn Subscription>>>,
}

impl CommandDispatcher {
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        metrics: Arc<RuntimeMetrics>,
        format: WireFormat,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            bus,
            handlers: DashMap::new(),
            metrics,
            format,
            subscriptions: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn register_command(&self, command: &str, handler: CommandHandler) -> Result<()> {
        validate_method_name(command)?;
        self.handlers.insert(command.to_string(), handler);
        Ok(())
    }

    /// Builds the `RpcResponse` for one inbound `Command`, reusing the RPC
    /// response shape since commands are "analogous to RPC" on completion;
    /// progress updates, not the final result, are where commands diverge
    /// from a plain RPC call.
    #[instrument(skip(self, command), fields(service = %self.service_name, command = %command.command))]
    async fn dispatch(&self, command: Command) -> RpcResponse {
        self.metrics.rpc_calls_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let Some(entry) = self.handlers.get(&command.command) else {
            self.metrics.rpc_errors_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return error_response(&command, &self.instance_id, format!("no handler registered for command `{}`", command.command));
        };
        let handler = entry.clone();
        drop(entry);

        let reporter = ProgressReporter::new(self.bus.clone(), self.instance_id.clone(), self.format, &command);
        match handler(command.clone(), reporter).await {
            Ok(result) => ok_response(&command, &self.instance_id, result),
            Err(message) => {
                self.metrics.rpc_errors_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(error = %message, "command handler returned an error");
                error_response(&command, &self.instance_id, message)
            }
        }
    }

    /// Opens one queue-group subscription per registered command, on
    /// `cmd.<service>.<command>`, load-balanced across instances the same
    /// way plain RPC is.
    #[instrument(skip(self), fields(service = %self.service_name))]
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let commands: Vec<String> = self.handlers.iter().map(|entry| entry.key().clone()).collect();
        let mut live = Vec::with_capacity(commands.len());
        for command in commands {
            let subject = command_subject(&self.service_name, &command)?;
            let dispatcher = self.clone();
            let callback: MessageHandler = Box::new(move |message: InboundMessage| {
                let dispatcher = dispatcher.clone();
                Box::pin(async move { dispatcher.handle_inbound(message).await })
            });
            let subscription = self.bus.subscribe(&subject, Some(&self.service_name), None, callback).await?;
            live.push(subscription);
        }
        *self.subscriptions.lock() = live;
        Ok(())
    }

    async fn handle_inbound(&self, message: InboundMessage) {
        let command = match serialization::decode(&message.payload) {
            Ok(command) => command,
            Err(err) => {
                warn!(error = %err, "dropping undecodable command");
                return;
            }
        };
        let response = self.dispatch(command).await;
        let Some(reply_to) = message.reply_to else { return };
        match serialization::encode(&response, self.format) {
            Ok(bytes) => {
                if let Err(err) = self.bus.publish(&reply_to, bytes).await {
                    warn!(error = %err, "failed to publish command completion reply");
                }
            }
            Err(err) => warn!(error = %err, "failed to encode command completion reply"),
        }
    }

    /// Issues a command to `target_service` and awaits its completion
    /// response, the command-handler counterpart to
    /// [`crate::runtime::dispatch::RpcDispatcher::call_rpc`]. Unlike RPC,
    /// commands carry no exclusivity gate, so there is no
    /// retry-on-`NOT_ACTIVE` loop here; callers that want progress updates
    /// pass `progress_subject` and subscribe to it themselves before
    /// calling this.
    #[instrument(skip(self, payload))]
    pub async fn call_command(
        &self,
        target_service: &str,
        command: &str,
        payload: BTreeMap<String, Value>,
        priority: CommandPriority,
        progress_subject: Option<String>,
        timeout: Duration,
    ) -> Result<BTreeMap<String, Value>> {
        validate_method_name(command)?;
        let subject = command_subject(target_service, command)?;
        let mut built = Command::new(&self.instance_id, command, target_service, payload, priority);
        if let Some(subject) = progress_subject {
            built = built.with_progress_subject(subject);
        }
        let bytes = serialization::encode(&built, self.format)?;
        let reply_bytes = self.bus.request(&subject, bytes, timeout).await.map_err(|err| {
            if matches!(&err, Error::RpcError { code: crate::error::RpcErrorCode::Timeout, .. }) {
                err
            } else {
                Error::rpc(target_service, crate::error::RpcErrorCode::Timeout, err.to_string())
            }
        })?;
        let response: RpcResponse = serialization::decode(&reply_bytes)?;
        if response.success {
            Ok(response.result)
        } else {
            Err(Error::rpc(
                target_service,
                response.error_code.unwrap_or(crate::error::RpcErrorCode::HandlerError),
                response.error.unwrap_or_default(),
            ))
        }
    }

    /// Unsubscribes every live command subscription (§4.7 shutdown step 2).
    pub async fn stop(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in subscriptions {
            if let Err(err) = subscription.unsubscribe().await {
                warn!(error = %err, "failed to unsubscribe command handler during shutdown");
            }
        }
    }
}

fn ok_response(command: &Command, source: &str, result: BTreeMap<String, Value>) -> RpcResponse {
    RpcResponse {
        envelope: command.envelope.child(source),
        correlation_id: command.envelope.message_id,
        success: true,
        result,
        error: None,
        error_code: None,
    }
}

fn error_response(command: &Command, source: &str, message: impl Into<String>) -> RpcResponse {
    RpcResponse {
        envelope: command.envelope.child(source),
        correlation_id: command.envelope.message_id,
        success: false,
        result: BTreeMap::new(),
        error: Some(message.into()),
        error_code: Some(crate::error::RpcErrorCode::HandlerError),
    }
}
