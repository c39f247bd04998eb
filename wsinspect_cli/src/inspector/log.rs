//! Chronological log of every event in a session

use chrono::{DateTime, Utc};
use serde::Serialize;
use wsinspect_common::{ClientHandle, ConnectEvent, DisconnectEvent, MessageEvent};

/// One event as recorded in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum LogEntry {
    Connect(ConnectEvent),
    Disconnect(DisconnectEvent),
    Message(MessageEvent),
}

impl LogEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            LogEntry::Connect(_) => "connect",
            LogEntry::Disconnect(_) => "disconnect",
            LogEntry::Message(_) => "message",
        }
    }

    pub fn client(&self) -> &ClientHandle {
        match self {
            LogEntry::Connect(event) => &event.client,
            LogEntry::Disconnect(event) => &event.client,
            LogEntry::Message(event) => &event.client,
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            LogEntry::Connect(event) => event.time,
            LogEntry::Disconnect(event) => event.time,
            LogEntry::Message(event) => event.time,
        }
    }
}

/// Append-only audit trail with a capture switch
#[derive(Debug)]
pub struct EventLog {
    entries: Vec<LogEntry>,
    active: bool,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            active: true,
        }
    }

    /// Record an entry if capture is active
    pub fn append(&mut self, entry: LogEntry) -> bool {
        if !self.active {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Flip capture, returning the new state
    pub fn toggle_active(&mut self) -> bool {
        self.active = !self.active;
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Entries in arrival order
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
