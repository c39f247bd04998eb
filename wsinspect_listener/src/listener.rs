//! Listener lifecycle and operator commands

use crate::socket::{self, ListenerState};
use crate::ListenerError;
use axum::extract::ws::{CloseFrame, Message};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use wsinspect_common::{
    constants, validate_close_code, Direction, MessageBody, MessageEvent, Notification,
    ServerStatus,
};

/// Channel the listener reports its observations on
pub type EventSink = mpsc::UnboundedSender<Notification>;

/// How long a graceful shutdown may take before the server task is aborted
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long clients get to answer the going-away close before they are dropped
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

struct RunningServer {
    address: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// WebSocket listener that can be started and stopped repeatedly
pub struct Listener {
    state: ListenerState,
    running: Mutex<Option<RunningServer>>,
}

/// Parse and validate a socket address
pub fn check_address(address: &str) -> Result<SocketAddr, ListenerError> {
    Ok(address.trim().parse::<SocketAddr>()?)
}

impl Listener {
    /// Create a stopped listener reporting to `events`
    pub fn new(events: EventSink) -> Self {
        Self {
            state: ListenerState::new(events),
            running: Mutex::new(None),
        }
    }

    /// Address the listener is bound to, if running
    pub async fn address(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|running| running.address)
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.state.clients.len()
    }

    /// Bind `address` and start accepting clients
    ///
    /// Returns the bound address, which differs from the requested one when
    /// port 0 was asked for.
    pub async fn start(&self, address: &str) -> Result<SocketAddr, ListenerError> {
        let address = check_address(address)?;

        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ListenerError::AlreadyStarted);
        }

        tracing::info!("Starting listener on {}", address);
        self.state
            .emit(Notification::ServerStatus(ServerStatus::Starting {
                address: address.to_string(),
            }));

        let bound = match bind(address).await {
            Ok(bound) => bound,
            Err(e) => {
                self.state
                    .emit(Notification::ServerStatus(ServerStatus::Stopped));
                return Err(e);
            }
        };
        let (tcp, local_addr) = bound;

        self.state.closing.send_replace(false);
        let app = socket::router(self.state.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let server = axum::serve(
                tcp,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown_rx.await.ok();
            });
            if let Err(e) = server.await {
                tracing::error!("Listener error: {}", e);
            }
        });

        *running = Some(RunningServer {
            address: local_addr,
            shutdown_tx,
            handle,
        });

        tracing::info!("Listener started on {}", local_addr);
        self.state
            .emit(Notification::ServerStatus(ServerStatus::Started {
                address: local_addr.to_string(),
            }));

        Ok(local_addr)
    }

    /// Close every client and stop accepting new ones
    pub async fn stop(&self) -> Result<(), ListenerError> {
        let RunningServer {
            address,
            shutdown_tx,
            mut handle,
        } = self
            .running
            .lock()
            .await
            .take()
            .ok_or(ListenerError::NotStarted)?;

        tracing::info!("Stopping listener on {}", address);
        self.state
            .emit(Notification::ServerStatus(ServerStatus::Stopping));

        for entry in self.state.clients.iter() {
            let _ = entry.tx.send(Message::Close(Some(CloseFrame {
                code: constants::GOING_AWAY_CLOSE_CODE,
                reason: constants::GOING_AWAY_CLOSE_REASON.into(),
            })));
        }

        let _ = shutdown_tx.send(());

        // Upgraded sockets outlive the server task, so they are ended here
        if tokio::time::timeout(CLOSE_HANDSHAKE_TIMEOUT, self.state.wait_for_sockets())
            .await
            .is_err()
        {
            tracing::debug!(
                "{} clients did not answer the close handshake, dropping them",
                self.state.clients.len()
            );
        }
        self.state.closing.send_replace(true);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.state.wait_for_sockets())
            .await
            .is_err()
        {
            tracing::warn!("Client tasks did not finish in time");
            self.state.clients.clear();
        }

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle)
            .await
            .is_err()
        {
            tracing::warn!("Listener did not shut down in time, aborting");
            handle.abort();
        }

        tracing::info!("Listener stopped");
        self.state
            .emit(Notification::ServerStatus(ServerStatus::Stopped));

        Ok(())
    }

    /// Send a text message to a client
    pub async fn send_text(&self, identifier: u64, text: &str) -> Result<(), ListenerError> {
        self.send(
            identifier,
            Message::Text(text.into()),
            MessageBody::Text(text.to_string()),
        )
    }

    /// Send a binary message to a client
    pub async fn send_binary(&self, identifier: u64, data: &[u8]) -> Result<(), ListenerError> {
        self.send(
            identifier,
            Message::Binary(data.to_vec().into()),
            MessageBody::Binary(data.to_vec()),
        )
    }

    /// Start the close handshake with a client
    ///
    /// The disconnect notification follows once the client answers.
    pub async fn close(
        &self,
        identifier: u64,
        code: u16,
        reason: &str,
    ) -> Result<(), ListenerError> {
        let code = validate_close_code(code)?;
        let entry = self
            .state
            .clients
            .get(&identifier)
            .map(|entry| entry.value().clone())
            .ok_or(ListenerError::UnknownClient(identifier))?;

        entry
            .tx
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .map_err(|_| ListenerError::ClientGone(identifier))?;

        tracing::debug!("Closing client {} with code {}", identifier, code);
        Ok(())
    }

    fn send(&self, identifier: u64, msg: Message, body: MessageBody) -> Result<(), ListenerError> {
        let entry = self
            .state
            .clients
            .get(&identifier)
            .map(|entry| entry.value().clone())
            .ok_or(ListenerError::UnknownClient(identifier))?;

        entry
            .tx
            .send(msg)
            .map_err(|_| ListenerError::ClientGone(identifier))?;

        self.state.emit(Notification::ClientMessage(MessageEvent::new(
            entry.handle,
            Direction::ToClient,
            body,
        )));
        Ok(())
    }
}

async fn bind(address: SocketAddr) -> Result<(TcpListener, SocketAddr), ListenerError> {
    let bind_error = |source| ListenerError::Bind { address, source };
    let tcp = TcpListener::bind(address).await.map_err(bind_error)?;
    let local_addr = tcp.local_addr().map_err(bind_error)?;
    Ok((tcp, local_addr))
}
