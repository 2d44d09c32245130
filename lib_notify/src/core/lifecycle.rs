//! # Connection Lifecycle Actor
//!
//! Transport callbacks (upgrade completed, socket gone) do not touch the
//! registry themselves. They send a `LifecycleCommand` to one task that
//! applies commands in arrival order and answers through a oneshot channel.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::core::connection::{CloseReason, ConnectionHandle, ConnectionId};
use crate::core::registry::{Registry, RegistryError};

pub enum LifecycleCommand {
    Connect {
        connection: Arc<ConnectionHandle>,
        responder: oneshot::Sender<Result<(), RegistryError>>,
    },
    Disconnect {
        id: ConnectionId,
        reason: CloseReason,
        responder: oneshot::Sender<bool>,
    },
}

/// Cloneable sender side handed to the transport layer.
#[derive(Clone)]
pub struct LifecycleHandle {
    tx: mpsc::UnboundedSender<LifecycleCommand>,
}

impl LifecycleHandle {
    /// Registers a freshly upgraded session.
    pub async fn connect(&self, connection: Arc<ConnectionHandle>) -> Result<(), RegistryError> {
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(LifecycleCommand::Connect { connection, responder })
            .map_err(|_| RegistryError::LifecycleClosed)?;
        rx.await.unwrap_or(Err(RegistryError::LifecycleClosed))
    }

    /// Deregisters a session and asks its worker to stop. Returns whether the
    /// session was still registered.
    pub async fn disconnect(&self, id: ConnectionId, reason: CloseReason) -> Result<bool, RegistryError> {
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(LifecycleCommand::Disconnect { id, reason, responder })
            .map_err(|_| RegistryError::LifecycleClosed)?;
        rx.await.map_err(|_| RegistryError::LifecycleClosed)
    }
}

/// Spawns the lifecycle task. It runs until every `LifecycleHandle` is dropped.
pub fn spawn_lifecycle(registry: Arc<Registry>) -> (LifecycleHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_lifecycle(registry, rx));
    (LifecycleHandle { tx }, task)
}

async fn run_lifecycle(registry: Arc<Registry>, mut rx: mpsc::UnboundedReceiver<LifecycleCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            LifecycleCommand::Connect { connection, responder } => {
                let id = connection.id();
                let scope = connection.scope().clone();
                let result = registry.register(connection);
                match &result {
                    Ok(()) => log::info!("Client {} connected to {}; total={}", id, scope, registry.len()),
                    Err(e) => log::error!("Rejected registration of {}: {}", id, e),
                }
                let _ = responder.send(result);
            }
            LifecycleCommand::Disconnect { id, reason, responder } => {
                let removed = registry.deregister(id);
                if let Some(handle) = &removed {
                    handle.request_close(reason);
                    log::info!(
                        "Client {} disconnected from {} ({:?}); total={}",
                        id,
                        handle.scope(),
                        reason,
                        registry.len()
                    );
                }
                let _ = responder.send(removed.is_some());
            }
        }
    }
    log::debug!("Lifecycle task stopped");
}
