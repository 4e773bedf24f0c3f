//! ==============================================================================
//! server.rs - websocket endpoint and connection lifecycle
//! ==============================================================================
//!
//! purpose:
//!     accepts websocket clients, registers them with the broadcast hub and
//!     runs one command dispatcher per connection.
//!
//! per connection:
//!
//!     ┌──────────────┐   text frames   ┌──────────────────┐
//!     │ socket stream│ ───────────────►│ CommandDispatcher│──┐ replies
//!     └──────────────┘                 └──────────────────┘  │
//!                                                            ▼
//!     ┌──────────────┐    mpsc queue   ┌──────────────────┐  ClientHandle
//!     │ socket sink  │ ◄────────────── │   writer task    │ ◄── hub broadcast
//!     └──────────────┘                 └──────────────────┘ ◄── per-client loop
//!
//!     everything outbound funnels through the one queue, so a client sees
//!     replies and frames in the order they were produced for it.
//!
//! teardown:
//!     dispatcher loop cancelled -> registration guard dropped (deregisters
//!     exactly once) -> last sender gone -> writer closes the socket.
//!
//! ==============================================================================

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use crate::dispatcher::CommandDispatcher;
use crate::domain::{AppState, StatusReport};
use crate::error::ProtocolError;
use crate::hub::ClientHandle;
use crate::protocol::Outbound;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/api/status", get(status_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the shared shutdown token fires.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_session(socket, state))
}

/// json snapshot of calibration, conversion, last frame and client count
async fn status_handler(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.status().await)
}

async fn run_session(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let id = state.hub.next_id();
    let timeout = state.hub.send_timeout();

    let (tx, mut rx) = mpsc::channel::<String>(state.feed.client_buffer);
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text)).await {
                tracing::debug!(client = %id, error = %e, "socket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let client = ClientHandle::new(id, tx);
    let registration = state.hub.register_guarded(client.clone());
    let mut dispatcher = CommandDispatcher::new(state.clone(), client.clone());

    let greeting = Outbound::Connection {
        message: "Connected to scale telemetry".to_string(),
        client_id: registration.id().0,
    };
    let mut open = client.send(greeting.to_text(), timeout).await.is_ok();

    while open {
        let message = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            message = stream.next() => message,
        };

        let reply = match message {
            Some(Ok(Message::Text(text))) => dispatcher.handle_text(&text).await,
            Some(Ok(Message::Binary(_))) => Outbound::error(ProtocolError::UnsupportedFrame.to_string()),
            Some(Ok(Message::Close(_))) | None => break,
            // ping/pong are answered by axum
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(client = %id, error = %e, "socket read failed");
                break;
            }
        };

        if let Err(e) = client.send(reply.to_text(), timeout).await {
            tracing::warn!(client = %id, error = %e, "reply could not be delivered");
            open = false;
        }
    }

    dispatcher.shutdown().await;
    drop(registration);
    drop(client);

    let abort = writer.abort_handle();
    if tokio::time::timeout(timeout, writer).await.is_err() {
        abort.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::testing::fake_state;
    use crate::hub::ClientId;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    /// Next text frame as JSON, skipping control frames.
    async fn next_json(ws: &mut Client) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(1), ws.next())
                .await
                .expect("no frame within 1s")
                .expect("socket closed")
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    /// Skip telemetry frames until a message of another type shows up.
    async fn next_reply(ws: &mut Client) -> Value {
        loop {
            let value = next_json(ws).await;
            if value["type"] != "weight_data" {
                return value;
            }
        }
    }

    #[tokio::test]
    async fn status_endpoint_reports_calibration_and_clients() {
        let (state, _, _) = fake_state(1000);
        state.calibration.zero().await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = state.shutdown.clone();
        let server = tokio::spawn(serve(listener, state));

        let body: Value = reqwest::get(format!("http://{addr}/api/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["calibration"]["phase"], "zeroed");
        assert_eq!(body["calibration"]["zero_offset"], 1000.0);
        assert_eq!(body["clients"], 0);
        assert!(body["latest_frame"].is_null());

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn plain_get_on_websocket_route_is_rejected() {
        let (state, _, _) = fake_state(1000);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = state.shutdown.clone();
        let server = tokio::spawn(serve(listener, state));

        let response = reqwest::get(format!("http://{addr}/ws")).await.unwrap();
        assert!(response.status().is_client_error());
        drop(response);

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn websocket_session_greets_answers_and_cleans_up_on_disconnect() {
        let (state, _, _) = fake_state(1000);
        let hub = state.hub.clone();
        let shutdown = state.shutdown.clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, state));

        let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();

        let greeting = next_json(&mut ws).await;
        assert_eq!(greeting["type"], "connection");
        let id = ClientId(greeting["client_id"].as_u64().unwrap());
        assert_eq!(hub.len(), 1);

        ws.send(WsMessage::Text(json!({"command": "foo"}).to_string())).await.unwrap();
        let reply = next_reply(&mut ws).await;
        assert_eq!(reply["type"], "response");
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["message"], "Unknown command: foo");

        ws.send(WsMessage::Binary(vec![1, 2, 3])).await.unwrap();
        let reply = next_reply(&mut ws).await;
        assert_eq!(reply["type"], "error");
        assert!(reply["message"].as_str().unwrap().contains("unsupported frame"));

        ws.send(WsMessage::Text(json!({"command": "start_measuring"}).to_string())).await.unwrap();
        let reply = next_reply(&mut ws).await;
        assert_eq!(reply["message"], "Measurement started");
        loop {
            if next_json(&mut ws).await["type"] == "weight_data" {
                break;
            }
        }

        // abrupt disconnect while the push loop is running
        drop(ws);
        tokio::time::timeout(Duration::from_secs(1), async {
            while !hub.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("client still registered after disconnect");
        assert!(!hub.deregister(id), "teardown left the client registered");
        assert_eq!(hub.len(), 0);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}
