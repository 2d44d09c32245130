//! # lib_notify
//!
//! Fanout engine of the notification gateway. Events arrive from an upstream
//! stream (see [`ingestors`]), are routed by their `(tenant_id, workspace_id)`
//! scope through the [`core::Dispatcher`] and delivered to every WebSocket
//! session registered under that scope by a per-connection delivery worker.

#![forbid(unsafe_code)]

#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "core")]
pub mod ingestors;

#[cfg(feature = "core")]
pub use crate::core::{
    CloseReason, ConnectionHandle, ConnectionId, ConnectionState, DeliveryTag, Dispatcher,
    DispatcherConfig, Event, OperationalSignal, Outcome, OverflowPolicy, Registry, RegistryError,
    Scope,
};
#[cfg(feature = "core")]
pub use crate::ingestors::{ChannelSource, EventSource, SourceError};
#[cfg(feature = "redis")]
pub use crate::ingestors::{RedisSourceConfig, RedisStreamSource};
