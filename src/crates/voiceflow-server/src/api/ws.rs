//! `/calls/ws` connection handling
//!
//! One socket is one call. Events are handled strictly in order; a reply is
//! sent before the next event is read. Timeout prompts from the executor's
//! timers arrive on a channel and go out between replies.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use voiceflow_core::{Defaults, TimeoutCallback, WorkflowExecutor};

use crate::api::events::{CallEvent, CallResponse, PromptReason};
use crate::api::routes::AppState;
use crate::registry::CallRegistry;

/// Handler for GET /calls/ws
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let connection_id = match state.registry.connect() {
        Ok(id) => id,
        Err(e) => {
            warn!("Rejecting call: {}", e);
            let _ = send(&mut sender, &CallResponse::error(e.to_string())).await;
            return;
        }
    };
    let (prompt_tx, mut prompts) = mpsc::unbounded_channel();
    let mut call = CallConnection::new(connection_id, &state, prompt_tx);
    info!(connection_id = %call.id(), "Call connected");

    loop {
        let response = tokio::select! {
            message = receiver.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(connection_id = %call.id(), "Websocket error: {}", e);
                        break;
                    }
                };
                match serde_json::from_str::<CallEvent>(&text) {
                    Ok(event) => call.handle(event).await,
                    Err(e) => CallResponse::error(format!("Invalid event: {}", e)),
                }
            }
            Some(prompt) = prompts.recv() => prompt,
        };

        if let Err(e) = send(&mut sender, &response).await {
            warn!(connection_id = %call.id(), "Failed to send response: {}", e);
            break;
        }
        if call.is_closed() {
            break;
        }
    }

    call.close().await;
}

async fn send(sender: &mut SplitSink<WebSocket, Message>, response: &CallResponse) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(response).map_err(axum::Error::new)?;
    sender.send(Message::Text(payload)).await
}

/// Per-connection call state
///
/// Owns the call's executor. Dropping the socket without a `stop` event
/// still goes through [`CallConnection::close`]. While the caller is silent
/// the executor's soft and turn timers push [`CallResponse::Prompt`] into
/// `prompts`.
pub struct CallConnection {
    id: String,
    executor: WorkflowExecutor,
    registry: Arc<CallRegistry>,
    started: bool,
    closed: bool,
}

impl CallConnection {
    pub fn new(id: String, state: &AppState, prompts: mpsc::UnboundedSender<CallResponse>) -> Self {
        let mut executor = WorkflowExecutor::new(Arc::clone(&state.workflow), state.settings.as_ref().clone());

        let engagement = executor.engagement_handler();
        executor.set_soft_timeout_callback(prompt_callback(prompts.clone(), PromptReason::SoftTimeout, move || {
            engagement.get_engagement_message().to_string()
        }));
        executor.set_turn_timeout_callback(prompt_callback(prompts, PromptReason::TurnTimeout, || {
            Defaults::TURN_TIMEOUT_PROMPT.to_string()
        }));

        Self {
            id,
            executor,
            registry: Arc::clone(&state.registry),
            started: false,
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn executor(&self) -> &WorkflowExecutor {
        &self.executor
    }

    /// Apply one inbound event and produce the reply
    pub async fn handle(&mut self, event: CallEvent) -> CallResponse {
        if self.closed {
            return CallResponse::Closed;
        }

        match event {
            CallEvent::Start { call } => {
                if self.started {
                    return CallResponse::error("Call already started");
                }
                let caller_id = call.caller_id.clone();
                match self.executor.execute_init(call).await {
                    Ok(init) => {
                        self.started = true;
                        self.registry.attach(&self.id, &init.session_id, &caller_id);
                        info!(connection_id = %self.id, session_id = %init.session_id, "Call initialized");
                        init.into()
                    }
                    Err(e) => {
                        error!(connection_id = %self.id, "Call init failed: {}", e);
                        CallResponse::error(e.to_string())
                    }
                }
            }
            CallEvent::Media { transcript } => {
                if !self.started {
                    return CallResponse::error("Call not started");
                }
                match self.executor.process_user_input(&transcript).await {
                    Ok(turn) => {
                        let turns = self.registry.record_turn(&self.id);
                        debug!(connection_id = %self.id, turns, "Turn processed");
                        turn.into()
                    }
                    Err(e) => {
                        error!(connection_id = %self.id, "Turn failed: {}", e);
                        CallResponse::error(e.to_string())
                    }
                }
            }
            CallEvent::Stop => {
                self.close().await;
                CallResponse::Closed
            }
        }
    }

    /// Cancel the executor and drop the registry entry; idempotent
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.executor.cancel().await;
        if let Some(entry) = self.registry.disconnect(&self.id) {
            info!(connection_id = %self.id, turns = entry.turns, "Call closed");
        }
    }
}

fn prompt_callback<F>(prompts: mpsc::UnboundedSender<CallResponse>, reason: PromptReason, message: F) -> TimeoutCallback
where
    F: Fn() -> String + Send + Sync + 'static,
{
    Arc::new(move || {
        let prompt = CallResponse::Prompt {
            reason,
            message: message(),
        };
        // receiver is gone once the socket loop ends
        let _ = prompts.send(prompt);
        Box::pin(async {})
    })
}
