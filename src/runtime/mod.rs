//! Service Runtime & Dispatch (C7, §4.7): instance lifecycle, handler
//! registries, RPC call with retry-on-`NOT_ACTIVE`, event subscription
//! modes, and the heartbeat task. [`service::Service`] is the type
//! applications construct; the other submodules are its internal
//! collaborators, each usable on its own for finer-grained testing.

pub mod commands;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod heartbeat;
pub mod service;
