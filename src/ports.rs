//! External collaborator ports (§4.3, §6.1).
//!
//! The runtime is written against these two traits only; it never talks to
//! NATS, etcd, or any other concrete backend directly. An adapter crate
//! implements [`KvStore`] against a JetStream KV bucket and [`MessageBus`]
//! against a NATS connection (or any other broker with equivalent
//! semantics); [`crate::testkit`] implements both in memory for tests.
//!
//! Both traits are `#[async_trait]` and object-safe, so the runtime stores
//! them as `Arc<dyn KvStore>` / `Arc<dyn MessageBus>` — the same shape the
//! teacher crate uses for its own transport ports (`Channel`, `Listener`).

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::time::Duration;

use crate::error::Result;

/// A key's value together with the backend's revision for that value. The
/// revision is opaque to callers beyond its use as a CAS token; backends are
/// free to use a monotonic counter, a Raft index, or anything else
/// comparable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvEntry {
    pub value: Vec<u8>,
    pub revision: u64,
}

/// Options accepted by [`KvStore::put`] / [`KvStore::create`].
#[derive(Clone, Copy, Debug, Default)]
pub struct PutOptions {
    pub ttl: Option<Duration>,
}

impl PutOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

/// A single change observed on a watched prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub kind: WatchEventKind,
    pub revision: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    /// Also used for TTL expiry, per §4.3: "Watch events for TTL expiry are
    /// delivered as delete, possibly with delay bounded by the backend's
    /// sweep period."
    Delete,
}

pub type KeyStream = BoxStream<'static, String>;
pub type EntryStream = BoxStream<'static, (String, Vec<u8>)>;
pub type WatchStream = BoxStream<'static, WatchEvent>;

/// The capability set the registry and election controller require from a
/// KV backend (§4.3). Every operation here must be usable concurrently from
/// multiple tasks — implementations are expected to be internally
/// synchronized (e.g. wrapping a client handle in an `Arc`).
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Returns the current value and revision for `key`, or `None` if it
    /// does not exist (or has expired).
    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;

    /// Unconditional write. Overwrites any existing value for `key`.
    async fn put(&self, key: &str, value: Vec<u8>, opts: PutOptions) -> Result<u64>;

    /// Writes `key` only if it does not currently exist. Fails with
    /// [`crate::error::KvErrorKind::KeyExists`] otherwise. This is the
    /// primitive the election controller uses for first acquisition of an
    /// unheld lease.
    async fn create(&self, key: &str, value: Vec<u8>, opts: PutOptions) -> Result<u64>;

    /// Compare-and-swap: writes `key` only if its current revision equals
    /// `expected_revision`. Fails with
    /// [`crate::error::KvErrorKind::RevisionMismatch`] otherwise. This is
    /// the primitive used both for re-registration on a prior revision and
    /// for lease refresh / takeover.
    async fn update(
        &self,
        key: &str,
        value: Vec<u8>,
        expected_revision: u64,
        opts: PutOptions,
    ) -> Result<u64>;

    /// Deletes `key`. Idempotent: returns `true` if a value was removed,
    /// `false` if the key was already absent. Never errors on absence.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Lazily lists all `(key, value)` pairs under `prefix`.
    async fn list(&self, prefix: &str) -> Result<EntryStream>;

    /// Lazily lists all keys under `prefix`.
    async fn keys(&self, prefix: &str) -> Result<KeyStream>;

    /// Opens a (logically infinite) stream of change events under `prefix`.
    /// Implementations are expected to reconnect internally on transport
    /// loss when practical; callers that need explicit reconnect control
    /// (bounded backoff, attempt counting) should prefer driving
    /// reconnection themselves, as [`crate::discovery::ServiceDiscovery`]
    /// does.
    async fn watch(&self, prefix: &str) -> Result<WatchStream>;
}

/// A single inbound message delivered to a subscription handler.
pub struct InboundMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Present when the message expects a reply (RPC requests).
    pub reply_to: Option<String>,
}

/// Type-erased subscription handler. The runtime's typed handler registries
/// (§4.7, §9 "dynamic handler registries") build one of these per
/// registered method/pattern; the closure owns whatever decode/dispatch
/// glue it needs.
pub type MessageHandler = Box<dyn Fn(InboundMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// A live subscription handle. Dropping it — or calling
/// [`Subscription::unsubscribe`] — stops delivery.
#[async_trait]
pub trait Subscription: Send + Sync {
    async fn unsubscribe(&self) -> Result<()>;
}

/// The capability set the runtime requires from a message broker (§6.1).
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    async fn is_connected(&self) -> bool;

    /// Fire-and-forget publish.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;

    /// Publish and await a single reply, or time out.
    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>>;

    /// Subscribes to `subject`. When `queue_group` is set, delivery is
    /// load-balanced across every subscriber sharing that group name
    /// (COMPETE semantics, and plain RPC load-balancing). When `durable` is
    /// set, the subscription survives reconnects under that name.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        durable: Option<&str>,
        handler: MessageHandler,
    ) -> Result<Box<dyn Subscription>>;
}
