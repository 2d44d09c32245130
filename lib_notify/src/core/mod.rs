//! # Core Engine Module
//!
//! The fanout/session engine of the notification gateway.
//!
//! ## Core Components:
//!
//! - **`scope`** / **`event`**: the routing key and the immutable inbound event
//!   with its pre-rendered outbound frame.
//! - **`connection`**: the registry-visible half of a WebSocket session and its
//!   bounded outbound queue.
//! - **`registry`**: scope-keyed index of live sessions behind one lock.
//! - **`lifecycle`**: the task that applies transport connect/disconnect
//!   notifications to the registry.
//! - **`dispatcher`**: resolves sessions per event and try-enqueues with the
//!   backpressure policy.
//! - **`delivery`**: the per-session worker writing frames to the socket.
//! - **`stats`**: counters and degraded / forced-close signals.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod connection;
pub mod delivery;
pub mod dispatcher;
pub mod event;
pub mod lifecycle;
pub mod registry;
pub mod scope;
pub mod stats;

// --- Public API Re-exports ---
pub use connection::{
    CloseReason, ConnectionHandle, ConnectionId, ConnectionState, OutboundQueue, OverflowPolicy, PushOutcome,
};
pub use delivery::{DeliveryConfig, DeliveryWorker, SinkError, TransportSink, WorkerSummary};
pub use dispatcher::{DispatchReport, Dispatcher, DispatcherConfig};
pub use event::{DeliveryTag, Event, EventParts, Outcome};
pub use lifecycle::{LifecycleCommand, LifecycleHandle, spawn_lifecycle};
pub use registry::{Registry, RegistryError};
pub use scope::{Scope, ScopeError};
pub use stats::{DispatchStats, OperationalSignal, ScopeDrops, StatsSnapshot};
