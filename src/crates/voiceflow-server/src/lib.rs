//! Websocket call server for voiceflow booking workflows
//!
//! A telephony bridge opens one websocket per phone call on `/calls/ws` and
//! sends JSON events tagged by `event`:
//!
//! ```text
//!  {"event":"start","call":{...}}        -> {"event":"greeting",...}
//!  {"event":"media","transcript":"..."}  -> {"event":"reply",...}
//!  {"event":"stop"}                      -> {"event":"closed"}
//! ```
//!
//! Every connection owns its own [`WorkflowExecutor`](voiceflow_core::WorkflowExecutor).
//! The shared [`CallRegistry`] only tracks metadata for `/health`.

pub mod api;
pub mod config;
pub mod registry;

use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;
use voiceflow_core::{
    HttpInitClient, HttpKbSearch, InitClient, KbSearch, ScriptedLlm, Settings, StaticInitClient, StaticKbSearch,
    Workflow, WorkflowError,
};

pub use api::events::{CallEvent, CallResponse, PromptReason};
pub use api::routes::{create_router, AppState};
pub use api::ws::CallConnection;
pub use config::ServerConfig;
pub use registry::{CallEntry, CallRegistry};

/// Errors raised while setting up or serving calls
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Call limit reached: {0} active calls")]
    CallLimit(usize),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Build the salon booking graph from configured endpoints
///
/// Without an init URL callers are greeted as new guests; without a KB URL
/// service codes come from the static table.
pub fn build_workflow(settings: &Settings) -> Result<Workflow> {
    let endpoints = &settings.endpoints;

    let init: Arc<dyn InitClient> = match &endpoints.init_url {
        Some(url) => Arc::new(HttpInitClient::new(url.clone(), endpoints, settings.retry.clone())?),
        None => {
            warn!("No init endpoint configured, using an empty call context");
            Arc::new(StaticInitClient::new(json!({ "dynamic_variables": {} })))
        }
    };

    let kb: Arc<dyn KbSearch> = match &endpoints.kb_search_url {
        Some(url) => Arc::new(HttpKbSearch::new(url.clone(), endpoints, settings.retry.clone())?),
        None => Arc::new(StaticKbSearch::new()),
    };

    let workflow = Workflow::salon_booking(Arc::new(ScriptedLlm::new()), init, kb);
    workflow.validate()?;
    Ok(workflow)
}
