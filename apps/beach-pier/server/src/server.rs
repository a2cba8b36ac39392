use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Query, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::bridge::{ReceiveError, SessionBridge};
use crate::config::ServerConfig;
use crate::remote::{session_pipes, SessionBackend, Target, TargetQuery};
use crate::title::TitleContext;

/// WebSocket sub-protocol spoken by the browser client.
pub const SUBPROTOCOL: &str = "docker-tty";

pub struct AppState {
    pub config: ServerConfig,
    pub backend: Arc<dyn SessionBackend>,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let static_dir = state.config.static_dir.clone();
    let router = Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let router = match static_dir {
        Some(dir) => router.fallback_service(ServeDir::new(dir)),
        None => router,
    };
    router.layer(TraceLayer::new_for_http())
}

pub async fn run(
    config: ServerConfig,
    backend: Arc<dyn SessionBackend>,
    metrics: Option<PrometheusHandle>,
) -> Result<()> {
    let listen_addr = config.listen_addr;
    let shutdown_grace = config.shutdown_grace;
    let listener = TcpListener::bind(listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("beach-pier listening on {}", listen_addr);

    let state = Arc::new(AppState {
        config,
        backend,
        metrics,
    });
    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

/// Serves on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error")
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Query(query): Query<TargetQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let target = match Target::resolve(
        &query,
        &state.config.default_target,
        state.config.backend.kind,
    ) {
        Ok(target) => target,
        Err(err) => {
            warn!(%remote_addr, error = %err, "rejecting connection with bad target");
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };

    ws.protocols([SUBPROTOCOL])
        .on_failed_upgrade(move |err| {
            warn!(%remote_addr, error = %err, "failed to upgrade connection");
        })
        .on_upgrade(move |socket| handle_socket(socket, state, target, remote_addr))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    target: Target,
    remote_addr: SocketAddr,
) {
    let session_id = Uuid::new_v4();
    let span = info_span!("session", %session_id, %remote_addr, target = %target);
    async move {
        info!("client connected");
        counter!("beach_pier_sessions_total").increment(1);

        let (remote_io, bridge_io) = session_pipes(state.config.session.pipe_capacity);
        let (sink, incoming) = split_socket(socket);
        let remote = match state.backend.open(&target, remote_io) {
            Ok(remote) => remote,
            Err(err) => {
                warn!(error = %err, "failed to prepare remote session");
                let mut sink = sink;
                let _ = sink.close().await;
                return;
            }
        };

        let title = TitleContext {
            command: state.backend.command_line(),
            target: target.to_string(),
        };
        let bridge = SessionBridge::new(session_id, Arc::clone(&state.config.session), sink, title);
        if let Err(err) = bridge.run(incoming, remote, bridge_io).await {
            warn!(error = %err, "session aborted during handshake");
        }
    }
    .instrument(span)
    .await
}

/// Adapts the WebSocket into frame sink/stream halves. Frames go out as text;
/// inbound text and binary messages are both accepted and control messages
/// other than close are skipped.
fn split_socket(
    socket: WebSocket,
) -> (
    impl Sink<Vec<u8>, Error = axum::Error> + Send + Unpin + 'static,
    impl Stream<Item = Result<Vec<u8>, ReceiveError>> + Send + Unpin + 'static,
) {
    let (ws_tx, ws_rx) = socket.split();
    let sink = ws_tx.with(|frame: Vec<u8>| {
        future::ready(Ok::<_, axum::Error>(Message::Text(
            String::from_utf8_lossy(&frame).into_owned(),
        )))
    });
    let incoming = ws_rx.filter_map(|message| {
        future::ready(match message {
            Ok(Message::Text(text)) => Some(Ok(text.into_bytes())),
            Ok(Message::Binary(bytes)) => Some(Ok(bytes)),
            Ok(Message::Close(frame)) => Some(Err(ReceiveError::Closed(
                frame.map(|f| f.reason.to_string()),
            ))),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
            Err(err) => Some(Err(ReceiveError::Transport(err.to_string()))),
        })
    });
    (sink, incoming)
}
