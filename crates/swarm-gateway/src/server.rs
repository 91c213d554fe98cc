//! Gateway server: Axum HTTP + WebSocket front of the shared worker
//!
//! Every WebSocket is one caller channel of the multiplexer: text frames are
//! channel commands, and the channel's events are written back to that socket only.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use swarm_worker::{ChannelHandle, ChannelId, Multiplexer, WorkerCommand, WorkerEvent};

/// Shared state for all connections
#[derive(Clone)]
pub struct GatewayState {
    pub multiplexer: Multiplexer,
    pub start_time: std::time::Instant,
}

pub struct GatewayServer {
    state: GatewayState,
    bind: SocketAddr,
}

impl GatewayServer {
    pub fn new(bind: SocketAddr, multiplexer: Multiplexer) -> Self {
        let state = GatewayState {
            multiplexer,
            start_time: std::time::Instant::now(),
        };
        Self { state, bind }
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.state.multiplexer
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/api/status", get(status_handler))
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` fires
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        let router = self.router();
        info!("Gateway listening on {}", listener.local_addr()?);

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

        info!("Gateway stopped");
        Ok(())
    }
}

// ── HTTP Handlers ──

async fn status_handler(State(state): State<GatewayState>) -> impl IntoResponse {
    axum::Json(status_body(&state))
}

fn status_body(state: &GatewayState) -> Value {
    serde_json::json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "resource": state.multiplexer.snapshot(),
    })
}

// ── WebSocket Handler ──

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    info!("WebSocket connection from {}", addr);
    ws.on_upgrade(move |socket| handle_ws(socket, state, addr))
}

async fn handle_ws(socket: WebSocket, state: GatewayState, addr: SocketAddr) {
    let ChannelHandle { id, mut events } = state.multiplexer.attach();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    debug!("Client {} is channel {}", addr, id);

    // Forward this channel's events to this socket
    let send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize event: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                debug!("Client {} closed the socket", addr);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("WebSocket error from {}: {}", addr, e);
                break;
            }
        };
        handle_frame(&state.multiplexer, &id, text.as_str());
    }

    state.multiplexer.detach(&id);
    send_task.abort();
    info!("Client {} disconnected", addr);
}

/// Apply one inbound text frame. Bad frames are answered on the same channel.
fn handle_frame(multiplexer: &Multiplexer, channel: &ChannelId, raw: &str) {
    match WorkerCommand::from_json(raw) {
        Ok(command) => multiplexer.dispatch(channel, command),
        Err(e) => {
            warn!("Channel {}: {}", channel, e);
            let _ = multiplexer.notify(channel, WorkerEvent::error(&e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use swarm_worker::engines::{ScriptedConfig, ScriptedEngine};
    use swarm_worker::{IdlePolicy, ResourcePhase};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn multiplexer() -> Multiplexer {
        let engine = Arc::new(ScriptedEngine::new(ScriptedConfig {
            token_delay_ms: 0,
            reply: Some("<think>x</think>done".to_string()),
        }));
        Multiplexer::new(engine, IdlePolicy::KeepLoaded)
    }

    async fn next_event(ch: &mut ChannelHandle) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(5), ch.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_handle_frame_unknown_command() {
        let mux = multiplexer();
        let mut ch = mux.attach();
        next_event(&mut ch).await;

        handle_frame(&mux, &ch.id, r#"{"type":"reboot","payload":{}}"#);
        assert_eq!(
            next_event(&mut ch).await,
            WorkerEvent::error("Unknown command: reboot")
        );
    }

    #[tokio::test]
    async fn test_handle_frame_load_then_ask() {
        let mux = multiplexer();
        let mut ch = mux.attach();
        next_event(&mut ch).await;

        handle_frame(&mux, &ch.id, r#"{"type":"loadModel","payload":{"modelName":"tiny"}}"#);
        loop {
            if let WorkerEvent::WorkerStatus { message: Some(m), .. } = next_event(&mut ch).await {
                if m == "Model tiny loaded." {
                    break;
                }
            }
        }

        handle_frame(&mux, &ch.id, r#"{"type":"askQuestion","payload":{"content":"q"}}"#);
        loop {
            if let WorkerEvent::FinalResult { result } = next_event(&mut ch).await {
                assert_eq!(result, "x\r\n\r\nResponse: done");
                break;
            }
        }
    }

    #[test]
    fn test_status_body() {
        let state = GatewayState {
            multiplexer: multiplexer(),
            start_time: std::time::Instant::now(),
        };
        let body = status_body(&state);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["resource"]["phase"], "empty");
        assert_eq!(body["resource"]["channels"], 0);
        assert_eq!(state.multiplexer.snapshot().phase, ResourcePhase::Empty);
    }

    #[tokio::test]
    async fn test_websocket_channel_roundtrip() {
        let server = GatewayServer::new("127.0.0.1:0".parse().unwrap(), multiplexer());
        let mux = server.multiplexer().clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server_task = tokio::spawn(server.serve(listener, shutdown.clone()));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();

        let first = ws.next().await.unwrap().unwrap();
        let hello: Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
        assert_eq!(hello["type"], "workerConnected");
        assert!(hello["channelId"].as_str().unwrap().starts_with("worker-port-"));
        assert_eq!(mux.channel_count(), 1);

        ws.send(WsMessage::Text(r#"{"type":"ping"}"#.into()))
            .await
            .unwrap();
        let pong = ws.next().await.unwrap().unwrap();
        let pong: Value = serde_json::from_str(pong.to_text().unwrap()).unwrap();
        assert_eq!(pong["type"], "pong");

        ws.close(None).await.unwrap();
        for _ in 0..50 {
            if mux.channel_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(mux.channel_count(), 0);

        shutdown.cancel();
        server_task.await.unwrap().unwrap();
    }
}
