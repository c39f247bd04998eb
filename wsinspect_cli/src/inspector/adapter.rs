//! Event source adapter
//!
//! Turns listener notifications into domain events and session status
//! changes, and feeds them to the store from a single consumer task so they
//! are applied in arrival order.

use super::log::LogEntry;
use super::session::ListenerStatus;
use super::store::{DomainEvent, InspectorStore};
use std::net::{AddrParseError, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use wsinspect_common::{Notification, ProtocolError, ServerStatus};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Invalid address '{address}' in server status: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: AddrParseError,
    },
}

/// A notification after translation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Domain(DomainEvent),
    Status(ListenerStatus),
}

/// Translate one notification
pub fn translate(notification: Notification) -> Result<Inbound, AdapterError> {
    Ok(match notification {
        Notification::ClientConnect(event) => Inbound::Domain(LogEntry::Connect(event)),
        Notification::ClientDisconnect(event) => Inbound::Domain(LogEntry::Disconnect(event)),
        Notification::ClientMessage(event) => Inbound::Domain(LogEntry::Message(event)),
        Notification::ServerStatus(status) => Inbound::Status(translate_status(status)?),
    })
}

fn translate_status(status: ServerStatus) -> Result<ListenerStatus, AdapterError> {
    Ok(match status {
        ServerStatus::Starting { address } => ListenerStatus::Starting(parse_address(address)?),
        ServerStatus::Started { address } => ListenerStatus::Started(parse_address(address)?),
        ServerStatus::Stopping => ListenerStatus::Stopping,
        ServerStatus::Stopped => ListenerStatus::Stopped,
    })
}

fn parse_address(address: String) -> Result<SocketAddr, AdapterError> {
    address
        .parse()
        .map_err(|source| AdapterError::InvalidAddress { address, source })
}

/// Decode a JSON text frame from an out-of-process listener
pub fn decode_text(frame: &str) -> Result<Notification, AdapterError> {
    Ok(Notification::from_json(frame)?)
}

/// Decode a MessagePack binary frame from an out-of-process listener
pub fn decode_binary(frame: &[u8]) -> Result<Notification, AdapterError> {
    Ok(Notification::from_bytes(frame)?)
}

/// Translate and apply one notification
///
/// Malformed notifications are dropped here and never reach the store.
pub async fn apply(store: &InspectorStore, notification: Notification) {
    let name = notification.name();
    match translate(notification) {
        Ok(Inbound::Domain(event)) => {
            store.ingest(event).await;
        }
        Ok(Inbound::Status(status)) => {
            if let Err(e) = store.apply_status(status).await {
                tracing::warn!("Ignoring server status {:?}: {}", status, e);
            }
        }
        Err(e) => {
            tracing::debug!("Dropping malformed {} notification: {}", name, e);
        }
    }
}

/// Spawn the consumer for the notification queue
///
/// The task ends once every sender is dropped.
pub fn spawn(
    store: Arc<InspectorStore>,
    mut events: mpsc::UnboundedReceiver<Notification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = events.recv().await {
            apply(&store, notification).await;
        }
        tracing::debug!("Notification queue closed");
    })
}
