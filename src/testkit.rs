//! In-memory fakes for [`KvStore`] and [`MessageBus`], gated behind the
//! `testkit` feature (always available under `#[cfg(test)]`).
//!
//! These mirror the teacher crate's own `test_stubs` module and the pack's
//! mock-transport crate: a minimal, fully-synchronous-under-the-hood
//! implementation of each port, good enough to drive every contract test
//! and scenario in spec §8 without a live broker. TTL expiry is evaluated
//! lazily (on access) against an injected [`crate::time::Clock`], exactly
//! the same way a real KV backend's sweep would eventually catch it, just
//! without the sweep delay — tests that care about the "possibly with
//! delay" language in §4.3 inject a [`crate::time::MockClock`] and advance
//! it explicitly.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::error::{Error, KvErrorKind, Result};
use crate::ports::{
    EntryStream, InboundMessage, KeyStream, KvEntry, KvStore, MessageBus, MessageHandler,
    PutOptions, Subscription, WatchEvent, WatchEventKind, WatchStream,
};
use crate::time::Clock;

struct StoredValue {
    value: Vec<u8>,
    revision: u64,
    expires_at: Option<Instant>,
}

/// In-memory [`KvStore`]. TTL is checked lazily against `clock.now()` on
/// every read (`get`/`list`/`keys`), which is sufficient to exercise §4.4's
/// "stale entry cleanup" and §4.6's lease-expiry behaviors in tests without
/// a background sweep task.
pub struct InMemoryKvStore {
    data: DashMap<String, StoredValue>,
    revision: AtomicU64,
    clock: Arc<dyn Clock>,
    watchers: Mutex<Vec<broadcast::Sender<WatchEvent>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::with_clock(crate::time::system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: DashMap::new(),
            revision: AtomicU64::new(0),
            clock,
            watchers: Mutex::new(Vec::new()),
        }
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_live(&self, value: &StoredValue) -> bool {
        match value.expires_at {
            Some(deadline) => self.clock.now() < deadline,
            None => true,
        }
    }

    fn notify(&self, key: &str, kind: WatchEventKind, revision: u64) {
        let event = WatchEvent {
            key: key.to_string(),
            kind,
            revision,
        };
        self.watchers.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        match self.data.get(key) {
            Some(entry) if self.is_live(&entry) => Ok(Some(KvEntry {
                value: entry.value.clone(),
                revision: entry.revision,
            })),
            Some(_) => Ok(None),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, opts: PutOptions) -> Result<u64> {
        let revision = self.next_revision();
        let expires_at = opts.ttl.map(|ttl| self.clock.now() + ttl);
        self.data.insert(
            key.to_string(),
            StoredValue {
                value,
                revision,
                expires_at,
            },
        );
        self.notify(key, WatchEventKind::Put, revision);
        Ok(revision)
    }

    async fn create(&self, key: &str, value: Vec<u8>, opts: PutOptions) -> Result<u64> {
        if let Some(existing) = self.data.get(key) {
            if self.is_live(&existing) {
                return Err(Error::kv(key, KvErrorKind::KeyExists));
            }
        }
        self.put(key, value, opts).await
    }

    async fn update(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_revision: u64,
        opts: PutOptions,
    ) -> Result<u64> {
        let current = self.data.get(key).filter(|e| self.is_live(e)).map(|e| e.revision);
        if current != Some(expected_revision) {
            return Err(Error::kv(
                key,
                KvErrorKind::RevisionMismatch {
                    expected: expected_revision,
                    found: current,
                },
            ));
        }
        self.put(key, value, opts).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.data.remove(key).is_some();
        if removed {
            let revision = self.next_revision();
            self.notify(key, WatchEventKind::Delete, revision);
        }
        Ok(removed)
    }

    async fn list(&self, prefix: &str) -> Result<EntryStream> {
        let items: Vec<(String, Vec<u8>)> = self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && self.is_live(entry.value()))
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect();
        Ok(Box::pin(stream::iter(items)))
    }

    async fn keys(&self, prefix: &str) -> Result<KeyStream> {
        let keys: Vec<String> = self
            .data
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && self.is_live(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        Ok(Box::pin(stream::iter(keys)))
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        let (tx, rx) = broadcast::channel(1024);
        self.watchers.lock().push(tx);
        let prefix = prefix.to_string();
        let stream = async_stream_from_broadcast(rx, prefix);
        Ok(Box::pin(stream))
    }
}

fn async_stream_from_broadcast(
    mut rx: broadcast::Receiver<WatchEvent>,
    prefix: String,
) -> impl futures::Stream<Item = WatchEvent> {
    async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) if event.key.starts_with(&prefix) => yield event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

struct InMemorySubscription {
    active: Arc<AtomicBool>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn unsubscribe(&self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory [`MessageBus`]. Queue-group subscribers are round-robined per
/// publish (matching "load-balanced" delivery); non-queue-group
/// subscribers on the same subject all receive every message (matching
/// BROADCAST fan-out).
pub struct InMemoryMessageBus {
    subject_subscribers: DashMap<String, Vec<Subscriber>>,
    rr_cursor: DashMap<String, AtomicU64>,
}

#[derive(Clone)]
struct Subscriber {
    queue_group: Option<String>,
    handler: Arc<MessageHandler>,
    active: Arc<AtomicBool>,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self {
            subject_subscribers: DashMap::new(),
            rr_cursor: DashMap::new(),
        }
    }

    /// Routes a publish to every subscription pattern matching `subject`,
    /// per [`crate::naming::subject_matches`] — this is what lets a
    /// `BROADCAST`/`COMPETE` registration on `events.*.changed` receive a
    /// publish to the concrete subject `events.config.changed`, the same
    /// way a real broker's subject tree would.
    fn deliver(&self, subject: &str, payload: Vec<u8>, reply_to: Option<String>) {
        // Group matching subscribers by (pattern, queue group); `None`
        // group means "everyone gets a copy" (broadcast / plain fan-out),
        // `Some(group)` means "exactly one subscriber in that group gets a
        // copy" (load balance). The round-robin cursor is keyed by pattern
        // rather than the published subject, so COMPETE delivery balances
        // across the durable's one queue group regardless of which
        // concrete subject under the pattern triggered it.
        let mut by_group: HashMap<(String, Option<String>), Vec<Subscriber>> = HashMap::new();
        for entry in self.subject_subscribers.iter() {
            let pattern = entry.key();
            if !crate::naming::subject_matches(pattern, subject) {
                continue;
            }
            for sub in entry.value() {
                if !sub.active.load(Ordering::SeqCst) {
                    continue;
                }
                by_group
                    .entry((pattern.clone(), sub.queue_group.clone()))
                    .or_default()
                    .push(sub.clone());
            }
        }
        for ((pattern, group), members) in by_group {
            match group {
                None => {
                    for sub in &members {
                        self.invoke(sub, subject, &payload, reply_to.clone());
                    }
                }
                Some(group_name) => {
                    let cursor = self
                        .rr_cursor
                        .entry(format!("{pattern}\0{group_name}"))
                        .or_insert_with(|| AtomicU64::new(0));
                    let index = cursor.fetch_add(1, Ordering::SeqCst) as usize % members.len();
                    self.invoke(&members[index], subject, &payload, reply_to.clone());
                }
            }
        }
    }

    fn invoke(&self, sub: &Subscriber, subject: &str, payload: &[u8], reply_to: Option<String>) {
        let message = InboundMessage {
            subject: subject.to_string(),
            payload: payload.to_vec(),
            reply_to,
        };
        let handler = sub.handler.clone();
        tokio::spawn(async move { handler(message).await });
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn is_connected(&self) -> bool {
        true
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.deliver(subject, payload, None);
        Ok(())
    }

    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        let reply_subject = format!("_inbox.{}", uuid::Uuid::new_v4());
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        let reply_handler: MessageHandler = Box::new(move |msg: InboundMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(msg.payload).await;
            })
        });
        self.subscribe(&reply_subject, None, None, reply_handler).await?;
        self.deliver(subject, payload, Some(reply_subject.clone()));

        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) | Err(_) => Err(Error::rpc(
                subject,
                crate::error::RpcErrorCode::Timeout,
                "no reply within timeout",
            )),
        }
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        _durable: Option<&str>,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>> {
        let active = Arc::new(AtomicBool::new(true));
        self.subject_subscribers
            .entry(subject.to_string())
            .or_default()
            .push(Subscriber {
                queue_group: queue_group.map(|s| s.to_string()),
                handler: Arc::new(handler),
                active: active.clone(),
            });
        Ok(Box::new(InMemorySubscription { active }))
    }
}
