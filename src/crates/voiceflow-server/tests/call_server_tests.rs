//! End-to-end tests over a real listener
//!
//! Calls go through `/calls/ws` with a websocket client; the LLM is scripted.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use voiceflow_core::{ScriptedLlm, Settings, StaticInitClient, StaticKbSearch, Workflow};
use voiceflow_server::{create_router, AppState, CallRegistry};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_server(llm: ScriptedLlm) -> (SocketAddr, AppState) {
    let init = StaticInitClient::new(json!({
        "dynamic_variables": {"first_name": "Ana", "is_new_user": false}
    }));
    let workflow = Workflow::salon_booking(Arc::new(llm), Arc::new(init), Arc::new(StaticKbSearch::new()));
    let state = AppState::new(workflow, Settings::in_memory(), CallRegistry::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{}/calls/ws", addr)).await.unwrap();
    client
}

async fn exchange(client: &mut Client, event: Value) -> Value {
    client.send(Message::Text(event.to_string())).await.unwrap();
    loop {
        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

fn start_event() -> Value {
    json!({
        "event": "start",
        "call": {
            "caller_id": "+15550100",
            "center_id": "center-1",
            "org_id": "org-1",
            "agent_id": "agent-1"
        }
    })
}

async fn wait_for_empty(registry: &CallRegistry) {
    for _ in 0..50 {
        if registry.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("call was not removed from the registry");
}

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, _state) = spawn_server(ScriptedLlm::new()).await;
    let body: Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["workflow"], "salon_booking");
    assert_eq!(body["active_calls"], 0);
}

#[tokio::test]
async fn test_full_call_over_websocket() {
    let llm = ScriptedLlm::new().with_tool_reply(
        "Lovely, a Swedish massage.",
        "route_to_booking",
        json!({"service_names": ["Swedish Massage"]}),
    );
    let (addr, state) = spawn_server(llm).await;
    let mut client = connect(addr).await;

    let greeting = exchange(&mut client, start_event()).await;
    assert_eq!(greeting["event"], "greeting");
    assert_eq!(greeting["message"], "Hey Ana, how can I help you today?");
    assert_eq!(state.registry.len(), 1);

    let reply = exchange(
        &mut client,
        json!({"event": "media", "transcript": "can I get a swedish massage"}),
    )
    .await;
    assert_eq!(reply["event"], "reply");
    assert_eq!(reply["response"], "Lovely, a Swedish massage.");
    assert_eq!(reply["detected_intent"], "BOOK");
    assert_eq!(reply["next_node"], "fallback_agent");

    let closed = exchange(&mut client, json!({"event": "stop"})).await;
    assert_eq!(closed["event"], "closed");
    wait_for_empty(&state.registry).await;
}

#[tokio::test]
async fn test_invalid_event_keeps_call_open() {
    let (addr, state) = spawn_server(ScriptedLlm::new()).await;
    let mut client = connect(addr).await;

    let error = exchange(&mut client, json!({"event": "dtmf", "digit": "1"})).await;
    assert_eq!(error["event"], "error");
    assert!(error["message"].as_str().unwrap().starts_with("Invalid event"));

    let greeting = exchange(&mut client, start_event()).await;
    assert_eq!(greeting["event"], "greeting");
    assert_eq!(state.registry.len(), 1);
}

#[tokio::test]
async fn test_disconnect_removes_call() {
    let (addr, state) = spawn_server(ScriptedLlm::new()).await;
    let mut client = connect(addr).await;
    exchange(&mut client, start_event()).await;
    assert_eq!(state.registry.len(), 1);

    client.close(None).await.unwrap();
    drop(client);
    wait_for_empty(&state.registry).await;
    assert_eq!(state.registry.total_connected(), 1);
}
