//! Event handler registry and subscription-mode wiring (§4.7 "Subscription
//! modes (event dispatch)").
//!
//! An event handler is registered against a subject pattern plus a
//! [`SubscriptionMode`]; at `start()` time the runtime derives a durable
//! consumer name from [`crate::naming`] and opens exactly one broker
//! subscription per registration, with or without a queue group depending
//! on the mode.

use futures::future::BoxFuture;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{instrument, warn};

use crate::error::Result;
use crate::model::Event;
use crate::naming::{durable_base_name, durable_broadcast_name, validate_event_pattern};
use crate::observability::RuntimeMetrics;
use crate::ports::{InboundMessage, MessageBus, Subscription};
use crate::serialization;

/// Whether every instance of a service receives every matching event, or
/// exactly one does (§4.7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// One durable shared by all instances, delivery load-balanced by
    /// queue group. Useful for a horizontally scaled worker pool.
    Compete,
    /// One durable per instance, no queue group — every instance gets
    /// every event. Useful for cache invalidation / config fan-out.
    Broadcast,
}

/// A registered event handler: takes the decoded [`Event`], returns
/// `Ok(())` on successful processing or `Err` to trigger a negative
/// acknowledgement (and, depending on the adapter, redelivery).
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

struct Registration {
    pattern: String,
    mode: SubscriptionMode,
    handler: EventHandler,
}

/// Owns the set of event registrations for a service and, once `start()`
/// runs, the live broker subscriptions backing them.
pub struct EventDispatcher {
    service_name: String,
    instance_id: String,
    bus: Arc<dyn MessageBus>,
    metrics: Arc<RuntimeMetrics>,
    registrations: parking_lot::Mutex<Vec<Registration>>,
    subscriptions: parking_lot::Mutex<Vec<Box<dyn Subscription>>>,
}

impl EventDispatcher {
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            bus,
            metrics,
            registrations: parking_lot::Mutex::new(Vec::new()),
            subscriptions: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Registers a handler for `pattern` under `mode` (§6.2
    /// `Service.subscribe_event`). Must be called before [`Self::start`];
    /// registering after start has no effect on already-open
    /// subscriptions.
    pub fn register(&self, pattern: &str, mode: SubscriptionMode, handler: EventHandler) -> Result<()> {
        validate_event_pattern(pattern)?;
        self.registrations.lock().push(Registration {
            pattern: pattern.to_string(),
            mode,
            handler,
        });
        Ok(())
    }

    /// Opens one broker subscription per registration, per §4.7's durable
    /// naming rule.
    #[instrument(skip(self), fields(service = %self.service_name))]
    pub async fn start(&self) -> Result<()> {
        let registrations = std::mem::take(&mut *self.registrations.lock());
        let mut live = Vec::with_capacity(registrations.len());

        for registration in registrations {
            let (durable, queue_group) = match registration.mode {
                SubscriptionMode::Compete => (
                    durable_base_name(&self.service_name, &registration.pattern),
                    Some(self.service_name.clone()),
                ),
                SubscriptionMode::Broadcast => (
                    durable_broadcast_name(&self.service_name, &registration.pattern, &self.instance_id),
                    None,
                ),
            };

            let handler = registration.handler.clone();
            let metrics = self.metrics.clone();
            let pattern = registration.pattern.clone();
            let callback: crate::ports::MessageHandler = Box::new(move |message: InboundMessage| {
                let handler = handler.clone();
                let metrics = metrics.clone();
                let pattern = pattern.clone();
                Box::pin(async move {
                    match serialization::decode::<Event>(&message.payload) {
                        Ok(event) => {
                            metrics.events_handled_total.fetch_add(1, Ordering::Relaxed);
                            if let Err(err) = handler(event).await {
                                warn!(pattern = %pattern, error = %err, "event handler returned an error");
                            }
                        }
                        Err(err) => warn!(pattern = %pattern, error = %err, "dropping undecodable event payload"),
                    }
                })
            });

            let subscription = self
                .bus
                .subscribe(&registration.pattern, queue_group.as_deref(), Some(&durable), callback)
                .await?;
            live.push(subscription);
        }

        *self.subscriptions.lock() = live;
        Ok(())
    }

    /// Unsubscribes every live subscription (§4.7 shutdown step 2: "Stop
    /// subscriptions (drain in-flight)"). Best-effort: a failed unsubscribe
    /// is logged and does not stop the rest from being attempted.
    pub async fn stop(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in subscriptions {
            if let Err(err) = subscription.unsubscribe().await {
                warn!(error = %err, "failed to unsubscribe cleanly during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::WireFormat;
    use crate::testkit::InMemoryMessageBus;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_handler(counter: Arc<AtomicUsize>) -> EventHandler {
        Arc::new(move |_event: Event| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn broadcast_mode_delivers_to_every_instance() {
        let bus = Arc::new(InMemoryMessageBus::new());
        let counter_a = Arc::new(AtomicUsize::new(0));
        let counter_b = Arc::new(AtomicUsize::new(0));

        let a = EventDispatcher::new("config", "cfg-1", bus.clone(), Arc::new(RuntimeMetrics::default()));
        a.register("events.config.changed", SubscriptionMode::Broadcast, counting_handler(counter_a.clone())).unwrap();
        a.start().await.unwrap();

        let b = EventDispatcher::new("config", "cfg-2", bus.clone(), Arc::new(RuntimeMetrics::default()));
        b.register("events.config.changed", SubscriptionMode::Broadcast, counting_handler(counter_b.clone())).unwrap();
        b.start().await.unwrap();

        let event = Event::new("publisher", "config", "changed", "1.0.0", BTreeMap::from([("key".to_string(), json!("max_risk"))]));
        let bytes = serialization::encode(&event, WireFormat::Binary).unwrap();
        bus.publish("events.config.changed", bytes).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter_a.load(Ordering::SeqCst), 1);
        assert_eq!(counter_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn compete_mode_load_balances_across_instances() {
        let bus = Arc::new(InMemoryMessageBus::new());
        let counter_a = Arc::new(AtomicUsize::new(0));
        let counter_b = Arc::new(AtomicUsize::new(0));

        let a = EventDispatcher::new("pricing", "pricing-1", bus.clone(), Arc::new(RuntimeMetrics::default()));
        a.register("events.market.data", SubscriptionMode::Compete, counting_handler(counter_a.clone())).unwrap();
        a.start().await.unwrap();

        let b = EventDispatcher::new("pricing", "pricing-2", bus.clone(), Arc::new(RuntimeMetrics::default()));
        b.register("events.market.data", SubscriptionMode::Compete, counting_handler(counter_b.clone())).unwrap();
        b.start().await.unwrap();

        for i in 0..10 {
            let event = Event::new("publisher", "market", "data", "1.0.0", BTreeMap::from([("index".to_string(), json!(i))]));
            let bytes = serialization::encode(&event, WireFormat::Binary).unwrap();
            bus.publish("events.market.data", bytes).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let total = counter_a.load(Ordering::SeqCst) + counter_b.load(Ordering::SeqCst);
        assert_eq!(total, 10);
        assert!(counter_a.load(Ordering::SeqCst) >= 1);
        assert!(counter_b.load(Ordering::SeqCst) >= 1);
    }
}
