//! # Delivery Worker
//!
//! One worker per session. It owns the write half of the socket, pops the
//! session's outbound queue in FIFO order and writes one frame per event,
//! each write bounded by a timeout. Whatever ends the session, the worker
//! finishes the same way: queue torn down, session deregistered.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};

use crate::core::connection::{CloseReason, ConnectionHandle, ConnectionId, ConnectionState, OutboundQueue};
use crate::core::registry::Registry;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("socket closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}

/// Write half of a client transport.
pub trait TransportSink: Send {
    /// Writes one text frame.
    fn send_text(&mut self, text: &str) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Sends a close frame and closes the write half.
    fn close(&mut self, code: u16, reason: &str) -> impl Future<Output = Result<(), SinkError>> + Send;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryConfig {
    /// Upper bound on a single frame write.
    pub write_timeout_ms: u64,
    /// Time allowed to flush queued frames on a graceful close.
    pub drain_grace_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: 5_000,
            drain_grace_ms: 3_000,
        }
    }
}

impl DeliveryConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub connection_id: ConnectionId,
    pub delivered: u64,
    /// Events still queued when the queue was torn down.
    pub discarded: usize,
    pub reason: CloseReason,
}

pub struct DeliveryWorker<S> {
    connection: Arc<ConnectionHandle>,
    registry: Arc<Registry>,
    sink: S,
    config: DeliveryConfig,
    delivered: u64,
}

impl<S: TransportSink + 'static> DeliveryWorker<S> {
    pub fn new(connection: Arc<ConnectionHandle>, registry: Arc<Registry>, sink: S, config: DeliveryConfig) -> Self {
        Self {
            connection,
            registry,
            sink,
            config,
            delivered: 0,
        }
    }

    pub fn spawn(self) -> JoinHandle<WorkerSummary> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> WorkerSummary {
        let queue = Arc::clone(self.connection.queue());

        let mut reason = loop {
            let next = tokio::select! {
                biased;
                _ = self.connection.closed() => None,
                next = queue.pop() => next,
            };
            let Some(event) = next else {
                break self.connection.close_reason().unwrap_or(CloseReason::Requested);
            };

            if let Err(e) = self.write(event.frame()).await {
                log::warn!("Write to {} failed: {}", self.connection.id(), e);
                self.connection.request_close(CloseReason::TransportError);
                break CloseReason::TransportError;
            }
            self.delivered += 1;
        };

        if reason.drains() && !self.drain(&queue).await {
            reason = CloseReason::TransportError;
        }

        if let Some((code, text)) = reason.close_frame() {
            match timeout(self.config.write_timeout(), self.sink.close(code, text)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::debug!("Close frame to {} failed: {}", self.connection.id(), e),
                Err(_) => log::debug!("Close frame to {} timed out", self.connection.id()),
            }
        }

        let discarded = queue.close();
        self.connection.set_state(ConnectionState::Closed);
        self.registry.deregister(self.connection.id());

        log::info!(
            "Delivery worker for {} finished ({:?}): delivered={} discarded={}",
            self.connection.id(),
            reason,
            self.delivered,
            discarded
        );
        WorkerSummary {
            connection_id: self.connection.id(),
            delivered: self.delivered,
            discarded,
            reason,
        }
    }

    /// Flushes what is queued within the grace period. Returns `false` if the
    /// transport failed while flushing.
    async fn drain(&mut self, queue: &OutboundQueue) -> bool {
        if self.connection.state() != ConnectionState::Closed {
            self.connection.set_state(ConnectionState::Draining);
        }
        let deadline = Instant::now() + self.config.drain_grace();

        while !queue.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::debug!("Drain grace for {} expired with {} queued", self.connection.id(), queue.len());
                return true;
            }
            let Some(event) = queue.try_pop() else {
                return true;
            };
            let budget = remaining.min(self.config.write_timeout());
            match timeout(budget, self.sink.send_text(event.frame())).await {
                Ok(Ok(())) => self.delivered += 1,
                Ok(Err(e)) => {
                    log::debug!("Drain write to {} failed: {}", self.connection.id(), e);
                    return false;
                }
                Err(_) if budget < self.config.write_timeout() => {
                    log::debug!("Drain grace for {} expired mid-write", self.connection.id());
                    return true;
                }
                Err(_) => {
                    log::debug!("Drain write to {} timed out", self.connection.id());
                    return false;
                }
            }
        }
        true
    }

    async fn write(&mut self, text: &str) -> Result<(), SinkError> {
        let limit = self.config.write_timeout();
        match timeout(limit, self.sink.send_text(text)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(limit)),
        }
    }
}
