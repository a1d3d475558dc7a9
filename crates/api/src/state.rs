//! Shared application state for the Axum API server.

use std::sync::Arc;

use courier_common::config::AppConfig;
use courier_queue::Broker;
use courier_store::Store;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub broker: Arc<dyn Broker>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, broker: Arc<dyn Broker>, config: AppConfig) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }
}
