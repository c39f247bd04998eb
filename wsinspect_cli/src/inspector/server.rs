//! Local control API with WebSocket support

use super::adapter;
use super::format::MessageFormat;
use super::log::LogEntry;
use super::registry::Connection;
use super::session::{SessionError, SessionState};
use super::store::{InspectorStore, StatusSnapshot, StoreEvent};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use wsinspect_common::constants;
use wsinspect_listener::{check_address, EventSink, Listener, ListenerError};

/// App state for the control API
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<InspectorStore>,
    pub listener: Arc<Listener>,
    /// Queue feeding the adapter, shared with `/ingest`
    pub events: EventSink,
    /// Used when a start request names no address
    pub default_address: Arc<String>,
    /// Used when a read names no format
    pub format: MessageFormat,
}

/// Build the control API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/status", get(get_status))
        // Listener lifecycle
        .route("/api/server/check", post(check_server_address))
        .route("/api/server/start", post(start_listener))
        .route("/api/server/stop", post(stop_listener))
        // Connections
        .route("/api/connections", get(get_connections))
        .route("/api/connections/{id}", get(get_connection))
        .route("/api/connections/{id}/send", post(send_message))
        .route("/api/connections/{id}/close", post(close_connection))
        // Log
        .route("/api/log", get(get_log))
        .route("/api/log/clear", post(clear_log))
        .route("/api/log/toggle", post(toggle_log))
        // WebSocket
        .route("/ws", get(ws_handler))
        .route("/ingest", get(ingest_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the control API on the given port
pub async fn start_server(port: u16, state: AppState) -> Result<JoinHandle<()>> {
    let app = router(state);

    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context(format!("Failed to bind control API to {}", addr))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    Ok(handle)
}

fn error_response(status: StatusCode, message: impl ToString) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.to_string() })),
    )
        .into_response()
}

fn listener_error(e: ListenerError) -> Response {
    let status = match &e {
        ListenerError::InvalidAddress(_) | ListenerError::Protocol(_) => StatusCode::BAD_REQUEST,
        ListenerError::UnknownClient(_) => StatusCode::NOT_FOUND,
        ListenerError::ClientGone(_) => StatusCode::GONE,
        ListenerError::AlreadyStarted | ListenerError::NotStarted => StatusCode::CONFLICT,
        ListenerError::Bind { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e)
}

fn command_error(e: CommandError) -> Response {
    match e {
        CommandError::Session(e) => error_response(StatusCode::CONFLICT, e),
        CommandError::Listener(e) => listener_error(e),
    }
}

/// Errors from the start and stop commands
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// How long a command waits for the listener's status to reach the store
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Move the session to starting and start the listener
///
/// Returns once the `started` notification has been applied. On failure the
/// session goes back to stopped.
pub async fn start_session(
    store: &InspectorStore,
    listener: &Listener,
    requested: &str,
) -> Result<SocketAddr, CommandError> {
    let address = check_address(requested)?;
    let events = store.subscribe();
    store.request_start(address).await?;

    match listener.start(requested).await {
        Ok(bound) => {
            settle(store, events, |session| {
                session.is_started() || session == SessionState::Stopped
            })
            .await;
            Ok(bound)
        }
        Err(e) => {
            tracing::warn!("Failed to start listener on {}: {}", address, e);
            // The listener's own `stopped` may already have reverted it
            if let Err(revert) = store.start_failed().await {
                tracing::debug!("Start not reverted: {}", revert);
            }
            Err(e.into())
        }
    }
}

/// Move the session to stopping and stop the listener
///
/// Returns once the `stopped` notification has reset the store, so a start
/// may follow right away. On failure the session goes back to started.
pub async fn stop_session(store: &InspectorStore, listener: &Listener) -> Result<(), CommandError> {
    let events = store.subscribe();
    store.request_stop().await?;

    match listener.stop().await {
        Ok(()) => {
            settle(store, events, |session| session == SessionState::Stopped).await;
            Ok(())
        }
        Err(e) => {
            tracing::warn!("Failed to stop listener: {}", e);
            if let Err(revert) = store.stop_failed().await {
                tracing::debug!("Stop not reverted: {}", revert);
            }
            Err(e.into())
        }
    }
}

/// Stop the listener whatever state the session is in
///
/// Used on exit, where a session stuck in `starting` must not leave the
/// socket bound.
pub async fn shutdown_session(store: &InspectorStore, listener: &Listener) -> Result<(), CommandError> {
    if listener.address().await.is_none() {
        return Ok(());
    }

    match stop_session(store, listener).await {
        Err(CommandError::Session(e)) => {
            tracing::debug!("Stopping listener outside the session: {}", e);
            listener.stop().await?;
            Ok(())
        }
        result => result,
    }
}

/// Wait until the adapter has applied a session state accepted by `done`
async fn settle<F>(store: &InspectorStore, mut events: broadcast::Receiver<StoreEvent>, done: F)
where
    F: Fn(SessionState) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(StoreEvent::Session(session)) if done(session) => return,
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    if done(store.session().await) {
                        return;
                    }
                }
                Err(RecvError::Closed) => return,
            }
        }
    };

    if tokio::time::timeout(SETTLE_TIMEOUT, wait).await.is_err() {
        tracing::warn!("Session still {} after listener command", store.session().await);
    }
}

#[derive(Deserialize)]
struct FormatQuery {
    format: Option<String>,
}

impl FormatQuery {
    fn resolve(&self, default: MessageFormat) -> Result<MessageFormat, Response> {
        match &self.format {
            Some(name) => name
                .parse()
                .map_err(|e| error_response(StatusCode::BAD_REQUEST, e)),
            None => Ok(default),
        }
    }
}

// ============================================================================
// Health & Status
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    service: String,
    version: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        service: constants::SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    status: StatusSnapshot,
    clients: usize,
    format: MessageFormat,
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: state.store.status().await,
        clients: state.listener.client_count(),
        format: state.format,
    })
}

// ============================================================================
// Listener Lifecycle
// ============================================================================

#[derive(Debug, Deserialize)]
struct AddressRequest {
    address: Option<String>,
}

#[derive(Debug, Serialize)]
struct AddressResponse {
    address: SocketAddr,
}

/// Validate an address without binding it
async fn check_server_address(Json(req): Json<AddressRequest>) -> Response {
    let Some(address) = req.address else {
        return error_response(StatusCode::BAD_REQUEST, "Missing address");
    };
    match check_address(&address) {
        Ok(address) => Json(AddressResponse { address }).into_response(),
        Err(e) => listener_error(e),
    }
}

async fn start_listener(State(state): State<AppState>, body: Option<Json<AddressRequest>>) -> Response {
    let requested = body
        .and_then(|Json(req)| req.address)
        .unwrap_or_else(|| (*state.default_address).clone());

    match start_session(&state.store, &state.listener, &requested).await {
        Ok(address) => Json(AddressResponse { address }).into_response(),
        Err(e) => command_error(e),
    }
}

async fn stop_listener(State(state): State<AppState>) -> Response {
    match stop_session(&state.store, &state.listener).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => command_error(e),
    }
}

// ============================================================================
// Connections
// ============================================================================

#[derive(Debug, Serialize)]
struct ConnectionSummary {
    identifier: u64,
    address: String,
    path: String,
    open: bool,
    messages: usize,
    connected_at: DateTime<Utc>,
    close_code: Option<u16>,
    close_reason: Option<String>,
}

impl From<&Connection> for ConnectionSummary {
    fn from(connection: &Connection) -> Self {
        let disconnection = connection.disconnection.as_ref();
        Self {
            identifier: connection.identifier(),
            address: connection.request.client.address.clone(),
            path: connection.request.path.clone(),
            open: connection.is_open(),
            messages: connection.messages.len(),
            connected_at: connection.request.time,
            close_code: disconnection.and_then(|d| d.close_code()),
            close_reason: disconnection.and_then(|d| d.close_reason()).map(str::to_owned),
        }
    }
}

/// A log entry with its payload rendered in the requested format
#[derive(Debug, Serialize)]
struct RenderedEntry {
    entry: LogEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    rendered: Option<String>,
}

fn render_entries(entries: Vec<LogEntry>, format: MessageFormat) -> Vec<RenderedEntry> {
    entries
        .into_iter()
        .map(|entry| {
            let rendered = match &entry {
                LogEntry::Message(message) => Some(format.render_or_placeholder(&message.body)),
                LogEntry::Connect(_) | LogEntry::Disconnect(_) => None,
            };
            RenderedEntry { entry, rendered }
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct ConnectionDetail {
    #[serde(flatten)]
    summary: ConnectionSummary,
    format: MessageFormat,
    timeline: Vec<RenderedEntry>,
}

async fn get_connections(State(state): State<AppState>) -> Json<Vec<ConnectionSummary>> {
    let connections = state.store.connections().await;
    Json(connections.iter().map(ConnectionSummary::from).collect())
}

async fn get_connection(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<FormatQuery>,
) -> Response {
    let format = match query.resolve(state.format) {
        Ok(format) => format,
        Err(response) => return response,
    };
    match state.store.connection(id).await {
        Some(connection) => Json(ConnectionDetail {
            summary: ConnectionSummary::from(&connection),
            format,
            timeline: render_entries(connection.timeline(), format),
        })
        .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Connection not found"),
    }
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    text: Option<String>,
    /// Base64 encoded
    binary: Option<String>,
}

async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<SendRequest>,
) -> Response {
    let result = match (req.text, req.binary) {
        (Some(text), None) => state.listener.send_text(id, &text).await,
        (None, Some(encoded)) => match STANDARD.decode(encoded.as_bytes()) {
            Ok(data) => state.listener.send_binary(id, &data).await,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, format!("Invalid base64: {}", e))
            }
        },
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "Exactly one of 'text' or 'binary' is required",
            )
        }
    };

    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => listener_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct CloseRequest {
    code: Option<u16>,
    reason: Option<String>,
}

async fn close_connection(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    body: Option<Json<CloseRequest>>,
) -> Response {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let code = req.code.unwrap_or(constants::NORMAL_CLOSE_CODE);
    let reason = req
        .reason
        .unwrap_or_else(|| constants::NORMAL_CLOSE_REASON.to_string());

    match state.listener.close(id, code, &reason).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => listener_error(e),
    }
}

// ============================================================================
// Log
// ============================================================================

async fn get_log(State(state): State<AppState>, Query(query): Query<FormatQuery>) -> Response {
    match query.resolve(state.format) {
        Ok(format) => Json(render_entries(state.store.log_entries().await, format)).into_response(),
        Err(response) => response,
    }
}

async fn clear_log(State(state): State<AppState>) -> StatusCode {
    state.store.clear_log().await;
    StatusCode::OK
}

#[derive(Serialize)]
struct CaptureResponse {
    capturing: bool,
}

async fn toggle_log(State(state): State<AppState>) -> Json<CaptureResponse> {
    Json(CaptureResponse {
        capturing: state.store.toggle_capture().await,
    })
}

// ============================================================================
// WebSocket
// ============================================================================

/// WebSocket handler for live updates
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Send a snapshot, then every store event
async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let (snapshot, mut event_rx) = state.store.snapshot_and_subscribe().await;
    let initial_msg = serde_json::json!({
        "type": "snapshot",
        "data": snapshot
    });
    if let Ok(json) = serde_json::to_string(&initial_msg) {
        if sender.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    let send_task = tokio::spawn(async move {
        loop {
            let event = match event_rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Live subscriber lagged, skipped {} events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if let Ok(json) = serde_json::to_string(&event) {
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
            break;
        }
    }

    send_task.abort();
}

/// WebSocket for an out-of-process listener pushing notifications
async fn ingest_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ingest(socket, state.events))
}

/// Text frames carry JSON, binary frames MessagePack
async fn handle_ingest(mut socket: WebSocket, events: EventSink) {
    tracing::info!("Event source connected");

    while let Some(msg) = socket.next().await {
        let decoded = match msg {
            Ok(Message::Text(text)) => adapter::decode_text(text.as_str()),
            Ok(Message::Binary(data)) => adapter::decode_binary(&data),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        match decoded {
            Ok(notification) => {
                if events.send(notification).is_err() {
                    break;
                }
            }
            Err(e) => tracing::debug!("Dropping malformed frame: {}", e),
        }
    }

    tracing::info!("Event source disconnected");
}
