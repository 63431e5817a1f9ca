//! Application state for Axum handlers.

use conveyor_jobs::{Broker, DispatchConfig, Dispatcher, JobRegistry, StatusResolver};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub resolver: StatusResolver,
    pub registry: Arc<JobRegistry>,
    pub broker: Arc<dyn Broker>,
}

impl AppState {
    /// Creates a new application state over one broker and registry.
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<JobRegistry>, dispatch: &DispatchConfig) -> Self {
        Self {
            dispatcher: Dispatcher::with_config(broker.clone(), registry.clone(), dispatch),
            resolver: StatusResolver::new(broker.clone()),
            registry,
            broker,
        }
    }
}
