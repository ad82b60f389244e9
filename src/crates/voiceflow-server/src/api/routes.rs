//! Router and shared state

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use voiceflow_core::{Settings, Workflow};

use crate::api::{handlers, ws};
use crate::registry::CallRegistry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub workflow: Arc<Workflow>,
    pub settings: Arc<Settings>,
    pub registry: Arc<CallRegistry>,
}

impl AppState {
    pub fn new(workflow: Workflow, settings: Settings, registry: CallRegistry) -> Self {
        Self {
            workflow: Arc::new(workflow),
            settings: Arc::new(settings),
            registry: Arc::new(registry),
        }
    }
}

/// Build the complete router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/calls/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
