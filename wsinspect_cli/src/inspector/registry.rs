//! Per-connection view of a session

use super::log::LogEntry;
use serde::Serialize;
use std::collections::BTreeMap;
use wsinspect_common::{ConnectEvent, DisconnectEvent, MessageEvent};

/// One client connection, from handshake to (optional) disconnect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub request: ConnectEvent,
    /// Append-only, in arrival order
    pub messages: Vec<MessageEvent>,
    /// Set at most once; closure is terminal
    pub disconnection: Option<DisconnectEvent>,
}

impl Connection {
    fn new(request: ConnectEvent) -> Self {
        Self {
            request,
            messages: Vec::new(),
            disconnection: None,
        }
    }

    pub fn identifier(&self) -> u64 {
        self.request.client.identifier
    }

    pub fn is_open(&self) -> bool {
        self.disconnection.is_none()
    }

    /// Request, messages and disconnection as one ordered list
    pub fn timeline(&self) -> Vec<LogEntry> {
        let mut timeline = Vec::with_capacity(self.messages.len() + 2);
        timeline.push(LogEntry::Connect(self.request.clone()));
        timeline.extend(self.messages.iter().cloned().map(LogEntry::Message));
        if let Some(disconnection) = &self.disconnection {
            timeline.push(LogEntry::Disconnect(disconnection.clone()));
        }
        timeline
    }
}

/// Connections of the current session keyed by identifier
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: BTreeMap<u64, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a connection
    ///
    /// An existing entry with the same identifier is replaced.
    pub fn open(&mut self, event: ConnectEvent) -> bool {
        let identifier = event.client.identifier;
        if let Some(previous) = self.connections.get(&identifier) {
            if previous.is_open() {
                tracing::warn!(
                    "Connect for client {} which is still open, replacing it",
                    identifier
                );
            }
        }
        self.connections.insert(identifier, Connection::new(event));
        true
    }

    /// Append a message to its open connection
    pub fn message(&mut self, event: MessageEvent) -> bool {
        match self.connections.get_mut(&event.client.identifier) {
            Some(connection) if connection.is_open() => {
                connection.messages.push(event);
                true
            }
            _ => {
                tracing::trace!(
                    "Dropping message for unknown or closed client {}",
                    event.client.identifier
                );
                false
            }
        }
    }

    /// Record the disconnection of an open connection
    pub fn close(&mut self, event: DisconnectEvent) -> bool {
        match self.connections.get_mut(&event.client.identifier) {
            Some(connection) if connection.is_open() => {
                connection.disconnection = Some(event);
                true
            }
            _ => {
                tracing::trace!(
                    "Dropping disconnect for unknown or closed client {}",
                    event.client.identifier
                );
                false
            }
        }
    }

    pub fn get(&self, identifier: u64) -> Option<&Connection> {
        self.connections.get(&identifier)
    }

    /// All connections, ordered by identifier
    pub fn all(&self) -> &BTreeMap<u64, Connection> {
        &self.connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn open_count(&self) -> usize {
        self.connections.values().filter(|c| c.is_open()).count()
    }

    pub fn reset(&mut self) {
        self.connections.clear();
    }
}
