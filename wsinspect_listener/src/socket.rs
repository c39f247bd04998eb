//! Per-client WebSocket handling

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    response::Response,
    Router,
};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use http::{HeaderMap, Uri};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use wsinspect_common::{
    ClientHandle, CloseFrame, ConnectEvent, Direction, DisconnectEvent, MessageBody,
    MessageEvent, Notification,
};

/// How long a client gets to flush its close handshake
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to a connected client
#[derive(Debug, Clone)]
pub(crate) struct ClientEntry {
    pub handle: ClientHandle,
    /// Frames queued for the client's writer task
    pub tx: mpsc::UnboundedSender<Message>,
}

/// State shared by every client connection
#[derive(Clone)]
pub(crate) struct ListenerState {
    pub events: mpsc::UnboundedSender<Notification>,
    pub clients: Arc<DashMap<u64, ClientEntry>>,
    pub next_id: Arc<AtomicU64>,
    /// Set once a stopping listener stops waiting for close handshakes
    pub closing: Arc<watch::Sender<bool>>,
    /// Client tasks that have not yet reported their disconnect
    pub sockets: Arc<AtomicUsize>,
    pub drained: Arc<Notify>,
}

impl ListenerState {
    pub fn new(events: mpsc::UnboundedSender<Notification>) -> Self {
        Self {
            events,
            clients: Arc::new(DashMap::new()),
            // Identifiers are never reset, so they stay unique across sessions
            next_id: Arc::new(AtomicU64::new(1)),
            closing: Arc::new(watch::Sender::new(false)),
            sockets: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    pub fn emit(&self, notification: Notification) {
        if self.events.send(notification).is_err() {
            tracing::debug!("Inspector is gone, dropping notification");
        }
    }

    /// Resolve once every client task has finished
    pub async fn wait_for_sockets(&self) {
        loop {
            let drained = self.drained.notified();
            if self.sockets.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }
}

/// Every path accepts a WebSocket upgrade
pub(crate) fn router(state: ListenerState) -> Router {
    Router::new().fallback(ws_handler).with_state(state)
}

/// WebSocket upgrade handler
async fn ws_handler(
    State(state): State<ListenerState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let path = uri.path().trim_start_matches('/').to_string();
    let query = Query::<BTreeMap<String, String>>::try_from_uri(&uri)
        .map(|Query(query)| query)
        .unwrap_or_default();
    let headers = convert_headers(&headers);

    tracing::debug!("Upgrade from {} on /{}", remote, path);

    ws.on_upgrade(move |socket| handle_socket(socket, state, remote, path, query, headers))
}

/// Handle one client from handshake to disconnect
async fn handle_socket(
    socket: WebSocket,
    state: ListenerState,
    remote: SocketAddr,
    path: String,
    query: BTreeMap<String, String>,
    headers: HashMap<String, Vec<String>>,
) {
    state.sockets.fetch_add(1, Ordering::AcqRel);
    let identifier = state.next_id.fetch_add(1, Ordering::Relaxed);
    let client = ClientHandle::new(identifier, remote.to_string());
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Emit before registering so a send can never be reported ahead of the connect
    state.emit(Notification::ClientConnect(ConnectEvent {
        client: client.clone(),
        path,
        query,
        headers,
        time: Utc::now(),
    }));
    state.clients.insert(
        identifier,
        ClientEntry {
            handle: client.clone(),
            tx,
        },
    );

    // Writer: forwards operator frames until every sender is dropped
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let mut closing = state.closing.subscribe();
    let mut close = None;
    let mut dropped = false;
    loop {
        if *closing.borrow_and_update() {
            dropped = true;
            break;
        }
        let result = tokio::select! {
            result = receiver.next() => result,
            _ = closing.changed() => continue,
        };
        let Some(result) = result else {
            break;
        };

        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("WebSocket error from client {}: {}", identifier, e);
                break;
            }
        };

        let body = match msg {
            Message::Text(text) => MessageBody::Text(text.as_str().to_owned()),
            Message::Binary(data) => MessageBody::Binary(data.to_vec()),
            Message::Ping(data) => MessageBody::Ping(data.to_vec()),
            Message::Pong(data) => MessageBody::Pong(data.to_vec()),
            Message::Close(frame) => {
                close = frame.map(|frame| CloseFrame {
                    code: frame.code,
                    reason: frame.reason.as_str().to_owned(),
                });
                break;
            }
        };

        state.emit(Notification::ClientMessage(MessageEvent::new(
            client.clone(),
            Direction::FromClient,
            body,
        )));
    }

    // Dropping the entry closes the writer's channel
    state.clients.remove(&identifier);
    if dropped {
        tracing::debug!("Client {} did not finish the close handshake", identifier);
        send_task.abort();
    } else if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }

    state.emit(Notification::ClientDisconnect(DisconnectEvent {
        client,
        close,
        time: Utc::now(),
    }));
    tracing::debug!("Client {} disconnected", identifier);

    state.sockets.fetch_sub(1, Ordering::AcqRel);
    state.drained.notify_waiters();
}

/// Collect header values per name, decoding lossily
fn convert_headers(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut converted: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        converted
            .entry(name.as_str().to_owned())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    converted
}
