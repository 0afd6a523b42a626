use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use kai_hub::{MessageHub, RequestContext};
use kai_telemetry::DaemonMetrics;

use crate::client::{ClientRegistry, RateLimiter};
use crate::rpc::{RpcRequest, RpcResponse};

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    /// Burst capacity per client.
    pub rate_limit_burst: u32,
    /// Tokens restored per second.
    pub rate_limit_per_sec: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9420,
            max_send_queue: 256,
            rate_limit_burst: 100,
            rate_limit_per_sec: 100.0,
        }
    }
}

/// Shared state for the Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<MessageHub>,
    pub registry: Arc<ClientRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<DaemonMetrics>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns a handle for graceful shutdown.
pub async fn start(
    config: ServerConfig,
    hub: Arc<MessageHub>,
    metrics: Arc<DaemonMetrics>,
) -> Result<ServerHandle, std::io::Error> {
    let registry = ClientRegistry::new(hub.clone(), config.max_send_queue);
    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit_burst,
        config.rate_limit_per_sec,
    ));

    let state = AppState {
        hub,
        registry,
        rate_limiter,
        metrics,
    };

    let router = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let shutdown = CancellationToken::new();
    let shutdown_for_axum = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_for_axum.cancelled().await;
            })
            .await
            .ok();
    });

    tracing::info!(port = local_addr.port(), "kai daemon listening");

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
    })
}

/// Keeps the server task alive; `shutdown()` then `drain()` to stop.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        tracing::info!("server shutdown initiated");
        self.shutdown.cancel();
    }

    pub async fn drain(self) {
        let _ = self.server.await;
        tracing::debug!("server task drained");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, mut outbound) = state.registry.register();
    tracing::info!(client_id = %client_id, "websocket client connected");

    let established = serde_json::json!({
        "type": "connection.established",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "data": {"clientId": client_id.to_string()},
    });
    state
        .registry
        .send_to(&client_id, established.to_string());

    let (mut sink, mut stream) = socket.split();

    // Outbound pump: registry queue -> socket
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    // Inbound: parse and dispatch RPC frames
    while let Some(Ok(message)) = stream.next().await {
        let raw = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Close(_) => break,
            _ => continue,
        };

        if !state.rate_limiter.check(&client_id) {
            let response = RpcResponse::rate_limited(None);
            if let Ok(frame) = serde_json::to_string(&response) {
                state.registry.send_to(&client_id, frame);
            }
            continue;
        }

        let request: RpcRequest = match serde_json::from_str(&raw) {
            Ok(request) => request,
            Err(_) => {
                if let Ok(frame) = serde_json::to_string(&RpcResponse::parse_error()) {
                    state.registry.send_to(&client_id, frame);
                }
                continue;
            }
        };

        state.metrics.record_rpc_request();
        let params = request.params.unwrap_or(serde_json::json!({}));

        // Channel membership is a connection concern, handled here rather
        // than by a hub method.
        let response = match request.method.as_str() {
            "channel.join" => match params.get("channel").and_then(|c| c.as_str()) {
                Some(channel) => {
                    state.registry.join(&client_id, channel);
                    RpcResponse::success(request.id, serde_json::json!({"joined": channel}))
                }
                None => RpcResponse::error(
                    request.id,
                    "INVALID_PARAMS",
                    "Missing required parameter: channel",
                ),
            },
            "channel.leave" => match params.get("channel").and_then(|c| c.as_str()) {
                Some(channel) => {
                    state.registry.leave(&client_id, channel);
                    RpcResponse::success(request.id, serde_json::json!({"left": channel}))
                }
                None => RpcResponse::error(
                    request.id,
                    "INVALID_PARAMS",
                    "Missing required parameter: channel",
                ),
            },
            method => {
                let ctx = RequestContext {
                    client_id: Some(client_id.clone()),
                };
                match state.hub.request(method, params, Some(ctx)).await {
                    Ok(result) => RpcResponse::success(request.id, result),
                    Err(e) => RpcResponse::from_hub_error(request.id, &e),
                }
            }
        };

        if let Ok(frame) = serde_json::to_string(&response) {
            state.registry.send_to(&client_id, frame);
        }
    }

    // Disconnect: nothing is retained for this client.
    state.registry.disconnect(&client_id);
    state.rate_limiter.remove(&client_id);
    writer.abort();
    tracing::info!(client_id = %client_id, "websocket client disconnected");
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state
        .hub
        .request("health", serde_json::json!({}), None)
        .await
    {
        Ok(result) => (axum::http::StatusCode::OK, axum::Json(result)),
        Err(_) => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(serde_json::json!({"status": "unhealthy"})),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hub_with_health() -> Arc<MessageHub> {
        let hub = Arc::new(MessageHub::new());
        hub.on_request("health", |_d, _c| async move {
            Ok(json!({"status": "healthy"}))
        });
        hub
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let hub = hub_with_health();
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        let handle = start(config, hub, Arc::new(DaemonMetrics::new()))
            .await
            .unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");

        handle.shutdown();
        handle.drain().await;
    }

    #[tokio::test]
    async fn health_without_handler_is_unavailable() {
        let hub = Arc::new(MessageHub::new());
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        let handle = start(config, hub, Arc::new(DaemonMetrics::new()))
            .await
            .unwrap();

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 503);

        handle.shutdown();
        handle.drain().await;
    }

    #[tokio::test]
    async fn shutdown_stops_listener() {
        let hub = hub_with_health();
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        let handle = start(config, hub, Arc::new(DaemonMetrics::new()))
            .await
            .unwrap();
        let port = handle.port;

        handle.shutdown();
        handle.drain().await;

        let result = reqwest::get(format!("http://127.0.0.1:{port}/health")).await;
        assert!(result.is_err(), "expected connection error after shutdown");
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let hub = hub_with_health();
        let handle = start(
            ServerConfig {
                port: 0,
                ..Default::default()
            },
            hub,
            Arc::new(DaemonMetrics::new()),
        )
        .await
        .unwrap();
        handle.shutdown();
        handle.shutdown();
        handle.drain().await;
    }

    #[test]
    fn build_router_creates_routes() {
        let hub = Arc::new(MessageHub::new());
        let state = AppState {
            hub: hub.clone(),
            registry: ClientRegistry::new(hub, 32),
            rate_limiter: Arc::new(RateLimiter::new(10, 10.0)),
            metrics: Arc::new(DaemonMetrics::new()),
        };
        let _router = build_router(state);
    }
}
