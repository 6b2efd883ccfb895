//! `beacon-core`: registry, discovery, election and dispatch contracts for
//! broker-backed microservice runtimes.
//!
//! This crate is the *core* subsystem of a larger microservice runtime SDK:
//! request/response RPC with load-balancing, durable event publish/subscribe,
//! TTL-backed service registration and watch-driven discovery, and sticky
//! single-active leader election on top of a shared KV store. Broker
//! transport (raw publish/subscribe/request, KV get/put/watch) is *not*
//! implemented here — [`ports::KvStore`] and [`ports::MessageBus`] define
//! the capability sets an adapter crate must provide; [`testkit`] supplies
//! in-memory fakes of both for tests that don't want a live broker.
//!
//! Module layout follows the dependency order the components are built in:
//! naming and serialization are pure and stateless, the store/bus ports are
//! the only external seam, the registry is a thin wrapper over the store
//! port, discovery and election both build on the registry/store, and the
//! runtime ties all of it together behind [`runtime::service::Service`].

pub mod discovery;
pub mod election;
pub mod error;
pub mod model;
pub mod naming;
pub mod observability;
pub mod ports;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod serialization;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
pub mod time;

pub use discovery::{DiscoveryConfig, SelectionPolicy, ServiceDiscovery};
pub use election::{ElectionController, ElectionState, LeaderLease};
pub use error::{Error, KvErrorKind, Result, RpcErrorCode};
pub use model::{
    Command, CommandPriority, CommandProgress, Envelope, Event, RpcRequest, RpcResponse,
    ServiceDefinition, ServiceInstance, ServiceStatus,
};
pub use ports::{
    EntryStream, InboundMessage, KeyStream, KvEntry, KvStore, MessageBus, MessageHandler,
    PutOptions, Subscription, WatchEvent, WatchEventKind, WatchStream,
};
pub use registry::ServiceRegistry;
pub use retry::BackoffPolicy;
pub use runtime::commands::{CommandDispatcher, CommandHandler, ProgressReporter};
pub use runtime::config::ServiceConfig;
pub use runtime::dispatch::{RpcDispatcher, RpcHandler};
pub use runtime::events::{EventDispatcher, EventHandler, SubscriptionMode};
pub use runtime::service::Service;
pub use serialization::WireFormat;
pub use time::{Clock, SystemClock, system_clock};
