//! Plain HTTP handlers

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::api::routes::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub workflow: String,
    pub active_calls: usize,
    pub total_calls: u64,
    pub version: String,
}

/// Handler for GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        workflow: state.workflow.id().to_string(),
        active_calls: state.registry.len(),
        total_calls: state.registry.total_connected(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_workflow;
    use crate::registry::CallRegistry;
    use voiceflow_core::Settings;

    #[tokio::test]
    async fn test_health_counts_calls() {
        let settings = Settings::in_memory();
        let workflow = build_workflow(&settings).unwrap();
        let state = AppState::new(workflow, settings, CallRegistry::default());
        state.registry.connect().unwrap();

        let Json(health) = health(State(state)).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.workflow, "salon_booking");
        assert_eq!(health.active_calls, 1);
        assert_eq!(health.total_calls, 1);
    }
}
