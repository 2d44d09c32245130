use crate::notify_logic::config::Config;
use crate::notify_logic::model::{ErrorResponse, HealthResponse, ScopeQuery};
use crate::notify_logic::state::AppState;
use anyhow::Context;
use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use axum_server::tls_rustls::RustlsConfig;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use lib_notify::core::{CloseReason, ConnectionHandle, DeliveryWorker, Scope, SinkError, TransportSink};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

/// Write half of an axum WebSocket, driven by the connection's delivery worker.
pub struct AxumSink {
    sink: SplitSink<WebSocket, Message>,
}

impl AxumSink {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self { sink }
    }
}

impl TransportSink for AxumSink {
    async fn send_text(&mut self, text: &str) -> Result<(), SinkError> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), SinkError> {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        self.sink.close().await.map_err(|e| SinkError::Transport(e.to_string()))
    }
}

pub fn router(state: AppState, allow_origins: &[String]) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(cors_layer(allow_origins))
        .with_state(state)
}

fn cors_layer(allow_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allow_origins.is_empty() || allow_origins.iter().any(|o| o.trim() == "*") {
        return cors.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = allow_origins
        .iter()
        .filter_map(|o| match o.trim().parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("Ignoring invalid CORS origin '{}'", o);
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(origins))
}

/// Serves until `handle` is told to shut down. A server that cannot start
/// cancels `shutdown` so the rest of the gateway stops too.
pub async fn run(
    config: Config,
    app_state: AppState,
    handle: axum_server::Handle,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let result = serve(&config, app_state, handle).await;
    if let Err(e) = &result {
        log::error!("Downstream server failed: {:#}", e);
        shutdown.cancel();
    }
    result
}

async fn serve(config: &Config, app_state: AppState, handle: axum_server::Handle) -> anyhow::Result<()> {
    let app = router(app_state, &config.allow_origins());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));

    match config.tls_paths() {
        Some((cert_path, key_path)) => {
            log::info!("Loading TLS certs from: {}", cert_path.display());
            let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
                .await
                .context("TLS configuration error")?;
            log::info!("Downstream server listening on wss://{}/ws", addr);
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            log::info!("Downstream server listening on ws://{}/ws", addr);
            axum_server::bind(addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
    }
    log::info!("Downstream server stopped.");
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, Query(query): Query<ScopeQuery>, State(state): State<AppState>) -> Response {
    let scope = match Scope::new(
        query.tenant_id.unwrap_or_default(),
        query.workspace_id.unwrap_or_default(),
    ) {
        Ok(scope) => scope,
        Err(e) => {
            log::debug!("Rejected upgrade: {}", e);
            let body = ErrorResponse { error: e.to_string() };
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };
    if !state.accepting() {
        let body = ErrorResponse {
            error: "shutting down".to_string(),
        };
        return (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, scope))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        service: state.service_name.to_string(),
        env: state.env.to_string(),
    })
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.stats())
}

async fn handle_socket(socket: WebSocket, state: AppState, scope: Scope) {
    let connection = ConnectionHandle::new(scope, state.dispatcher.config().queue_capacity);
    let (sink, stream) = socket.split();

    if let Err(e) = state.lifecycle.connect(Arc::clone(&connection)).await {
        log::error!("Could not register {}: {}", connection.id(), e);
        let _ = AxumSink::new(sink).close(1011, "registration failed").await;
        return;
    }

    let worker = DeliveryWorker::new(
        Arc::clone(&connection),
        Arc::clone(&state.registry),
        AxumSink::new(sink),
        state.delivery.clone(),
    );
    state.workers.spawn(worker.run());

    read_until_closed(stream, &connection, &state).await;
}

/// Clients are not expected to send anything; the read half only exists to
/// notice the socket going away.
async fn read_until_closed(mut stream: SplitStream<WebSocket>, connection: &ConnectionHandle, state: &AppState) {
    let id = connection.id();
    let reason = loop {
        tokio::select! {
            // Closed from our side: the worker owns the rest of the teardown.
            _ = connection.closed() => return,
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break CloseReason::ClientGone,
                Some(Ok(_)) => log::trace!("Ignoring inbound frame from {}", id),
                Some(Err(e)) => {
                    log::debug!("Read from {} failed: {}", id, e);
                    break CloseReason::TransportError;
                }
            }
        }
    };

    if let Err(e) = state.lifecycle.disconnect(id, reason).await {
        // Lifecycle is gone; make sure the worker still stops.
        log::warn!("Could not deregister {}: {}", id, e);
        connection.request_close(reason);
    }
}
