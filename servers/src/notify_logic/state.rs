use crate::notify_logic::config::Config;
use crate::notify_logic::model::StatsResponse;
use lib_notify::core::{DeliveryConfig, Dispatcher, LifecycleHandle, Registry, spawn_lifecycle};
use std::sync::Arc;
use tokio_util::task::TaskTracker;

/// Everything the HTTP handlers, the upstream task and the monitor share.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub dispatcher: Arc<Dispatcher>,
    // Registration and deregistration requests from socket handlers
    pub lifecycle: LifecycleHandle,
    pub delivery: DeliveryConfig,
    // One delivery worker per connected client
    pub workers: TaskTracker,
    pub service_name: Arc<str>,
    pub env: Arc<str>,
}

impl AppState {
    /// Must be called inside the runtime: it spawns the lifecycle task.
    pub fn new(config: &Config) -> Self {
        let registry = Arc::new(Registry::new());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), config.dispatcher_config()));
        let (lifecycle, _lifecycle_task) = spawn_lifecycle(Arc::clone(&registry));
        Self {
            registry,
            dispatcher,
            lifecycle,
            delivery: config.delivery_config(),
            workers: TaskTracker::new(),
            service_name: Arc::from(config.service_name()),
            env: Arc::from(config.env()),
        }
    }

    /// New clients are refused once the dispatcher has stopped.
    pub fn accepting(&self) -> bool {
        !self.dispatcher.is_closed()
    }

    pub fn stats(&self) -> StatsResponse {
        StatsResponse {
            connections: self.registry.len(),
            scopes: self.registry.scope_count(),
            accepting: self.accepting(),
            dispatch: self.dispatcher.stats().snapshot(),
        }
    }
}
