//! WebSocket Inspector Common - Shared event protocol
//!
//! This crate contains the event types emitted by the listener when it
//! observes a client, and the serialization helpers used by both the
//! listener and the inspector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to serialize notification: {0}")]
    Serialize(#[from] rmp_serde::encode::Error),

    #[error("Failed to deserialize notification: {0}")]
    Deserialize(#[from] rmp_serde::decode::Error),

    #[error("Invalid JSON notification: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Close code {0} is outside the range {min}..={max}", min = constants::CLOSE_CODE_MIN, max = constants::CLOSE_CODE_MAX)]
    InvalidCloseCode(u16),
}

/// A client connection as seen by the listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHandle {
    /// Listener-assigned identifier, never reused while the listener process lives
    pub identifier: u64,

    /// Remote socket address of the client
    pub address: String,
}

impl ClientHandle {
    pub fn new(identifier: u64, address: impl Into<String>) -> Self {
        Self {
            identifier,
            address: address.into(),
        }
    }
}

/// Which side sent a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    /// Received from the client
    FromClient,

    /// Sent by the operator to the client
    ToClient,
}

/// Payload of a WebSocket message
///
/// The set of kinds is fixed by the WebSocket protocol, so this is a closed
/// enum. Byte payloads travel as Base64 strings in JSON so that arbitrary,
/// non UTF-8 content survives the round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum MessageBody {
    Text(String),
    Binary(#[serde(with = "base64_bytes")] Vec<u8>),
    Ping(#[serde(with = "base64_bytes")] Vec<u8>),
    Pong(#[serde(with = "base64_bytes")] Vec<u8>),
}

impl MessageBody {
    /// Upper-case label used by the log views
    pub fn label(&self) -> &'static str {
        match self {
            MessageBody::Text(_) => "TEXT",
            MessageBody::Binary(_) => "BINARY",
            MessageBody::Ping(_) => "PING",
            MessageBody::Pong(_) => "PONG",
        }
    }

    /// Raw payload bytes (UTF-8 bytes for text)
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MessageBody::Text(text) => text.as_bytes(),
            MessageBody::Binary(data) | MessageBody::Ping(data) | MessageBody::Pong(data) => data,
        }
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Close frame sent by either side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

/// A client completed the WebSocket handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectEvent {
    pub client: ClientHandle,

    /// Request path without the leading slash
    pub path: String,

    /// Query string parameters
    #[serde(default)]
    pub query: BTreeMap<String, String>,

    /// Request headers, keys as received
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,

    pub time: DateTime<Utc>,
}

impl ConnectEvent {
    /// Connect event stamped now, with no query or headers
    pub fn new(client: ClientHandle, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
            query: BTreeMap::new(),
            headers: HashMap::new(),
            time: Utc::now(),
        }
    }
}

/// A client connection ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectEvent {
    pub client: ClientHandle,

    /// Close frame, `None` when the connection ended abnormally
    pub close: Option<CloseFrame>,

    pub time: DateTime<Utc>,
}

impl DisconnectEvent {
    pub fn new(client: ClientHandle, close: Option<CloseFrame>) -> Self {
        Self {
            client,
            close,
            time: Utc::now(),
        }
    }

    pub fn close_code(&self) -> Option<u16> {
        self.close.as_ref().map(|frame| frame.code)
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close.as_ref().map(|frame| frame.reason.as_str())
    }
}

/// A message exchanged with a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub client: ClientHandle,
    pub direction: Direction,
    pub body: MessageBody,
    pub time: DateTime<Utc>,
}

impl MessageEvent {
    pub fn new(client: ClientHandle, direction: Direction, body: MessageBody) -> Self {
        Self {
            client,
            direction,
            body,
            time: Utc::now(),
        }
    }

    pub fn text(client: ClientHandle, direction: Direction, text: impl Into<String>) -> Self {
        Self::new(client, direction, MessageBody::Text(text.into()))
    }

    pub fn binary(client: ClientHandle, direction: Direction, data: impl Into<Vec<u8>>) -> Self {
        Self::new(client, direction, MessageBody::Binary(data.into()))
    }
}

/// Listener lifecycle status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum ServerStatus {
    Starting { address: String },
    Started { address: String },
    Stopping,
    Stopped,
}

/// Notification emitted by the listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum Notification {
    ClientConnect(ConnectEvent),
    ClientDisconnect(DisconnectEvent),
    ClientMessage(MessageEvent),
    ServerStatus(ServerStatus),
}

impl Notification {
    /// Client the notification is about, if any
    pub fn client(&self) -> Option<&ClientHandle> {
        match self {
            Notification::ClientConnect(event) => Some(&event.client),
            Notification::ClientDisconnect(event) => Some(&event.client),
            Notification::ClientMessage(event) => Some(&event.client),
            Notification::ServerStatus(_) => None,
        }
    }

    /// Event name as used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Notification::ClientConnect(_) => constants::EVENT_CLIENT_CONNECT,
            Notification::ClientDisconnect(_) => constants::EVENT_CLIENT_DISCONNECT,
            Notification::ClientMessage(_) => constants::EVENT_CLIENT_MESSAGE,
            Notification::ServerStatus(_) => constants::EVENT_SERVER_STATUS,
        }
    }

    /// Serialize the notification to MessagePack bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize from MessagePack bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(data)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Check that a close code may be sent by the operator
pub fn validate_close_code(code: u16) -> Result<u16, ProtocolError> {
    if (constants::CLOSE_CODE_MIN..=constants::CLOSE_CODE_MAX).contains(&code) {
        Ok(code)
    } else {
        Err(ProtocolError::InvalidCloseCode(code))
    }
}

/// Constants for the protocol
pub mod constants {
    /// Address the listener binds when none is given
    pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:3030";

    /// Port of the local control API
    pub const DEFAULT_CONTROL_PORT: u16 = 3031;

    /// Service name reported by the control API health check
    pub const SERVICE_NAME: &str = "wsinspect";

    /// Wire names of the notifications
    pub const EVENT_CLIENT_CONNECT: &str = "client_connect";
    pub const EVENT_CLIENT_DISCONNECT: &str = "client_disconnect";
    pub const EVENT_CLIENT_MESSAGE: &str = "client_message";
    pub const EVENT_SERVER_STATUS: &str = "server_status";

    /// Close codes an operator may send
    pub const CLOSE_CODE_MIN: u16 = 1000;
    pub const CLOSE_CODE_MAX: u16 = 4999;

    /// Normal closure
    pub const NORMAL_CLOSE_CODE: u16 = 1000;
    pub const NORMAL_CLOSE_REASON: &str =
        "Normal closure; the connection successfully completed whatever purpose for which it was created.";

    /// Sent to every client when the listener shuts down
    pub const GOING_AWAY_CLOSE_CODE: u16 = 1001;
    pub const GOING_AWAY_CLOSE_REASON: &str = "Server stopping";
}

/// Serde helpers for `Vec<u8>` as Base64
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientHandle {
        ClientHandle::new(7, "127.0.0.1:50000")
    }

    #[test]
    fn test_notification_json_shape() {
        let notification = Notification::ClientMessage(MessageEvent::text(
            client(),
            Direction::FromClient,
            "hi",
        ));

        let value: serde_json::Value =
            serde_json::from_str(&notification.to_json().unwrap()).unwrap();

        assert_eq!(value["event"], "client_message");
        assert_eq!(value["payload"]["client"]["identifier"], 7);
        assert_eq!(value["payload"]["direction"], "FROM_CLIENT");
        assert_eq!(value["payload"]["body"]["kind"], "text");
        assert_eq!(value["payload"]["body"]["data"], "hi");
    }

    #[test]
    fn test_binary_body_survives_json() {
        let bytes = vec![0xff, 0x00, 0xfe, 0x80, 0x7f];
        let notification = Notification::ClientMessage(MessageEvent::binary(
            client(),
            Direction::ToClient,
            bytes.clone(),
        ));

        let json = notification.to_json().unwrap();
        assert!(json.contains("/wD+gH8="));

        match Notification::from_json(&json).unwrap() {
            Notification::ClientMessage(event) => {
                assert_eq!(event.body, MessageBody::Binary(bytes));
                assert_eq!(event.direction, Direction::ToClient);
            }
            other => panic!("Wrong notification: {:?}", other),
        }
    }

    #[test]
    fn test_notification_msgpack() {
        let mut connect = ConnectEvent::new(client(), "chat");
        connect.query.insert("room".to_string(), "1".to_string());
        connect
            .headers
            .insert("Sec-WebSocket-Version".to_string(), vec!["13".to_string()]);
        let notification = Notification::ClientConnect(connect.clone());

        let bytes = notification.to_bytes().unwrap();
        let decoded = Notification::from_bytes(&bytes).unwrap();

        assert_eq!(decoded, Notification::ClientConnect(connect));
    }

    #[test]
    fn test_server_status_json() {
        let started: Notification = serde_json::from_str(
            r#"{"event":"server_status","payload":{"name":"started","address":"127.0.0.1:3030"}}"#,
        )
        .unwrap();
        assert_eq!(
            started,
            Notification::ServerStatus(ServerStatus::Started {
                address: "127.0.0.1:3030".to_string()
            })
        );

        let stopped: Notification =
            serde_json::from_str(r#"{"event":"server_status","payload":{"name":"stopped"}}"#)
                .unwrap();
        assert_eq!(stopped, Notification::ServerStatus(ServerStatus::Stopped));
        assert!(stopped.client().is_none());
    }

    #[test]
    fn test_missing_field_is_rejected() {
        let result = Notification::from_json(
            r#"{"event":"client_disconnect","payload":{"client":{"identifier":1,"address":"x"}}}"#,
        );
        assert!(result.is_err());

        let result = Notification::from_json(r#"{"event":"client_message","payload":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_abnormal_disconnect() {
        let event = DisconnectEvent::new(client(), None);
        assert_eq!(event.close_code(), None);
        assert_eq!(event.close_reason(), None);

        let event = DisconnectEvent::new(
            client(),
            Some(CloseFrame {
                code: 1000,
                reason: "bye".to_string(),
            }),
        );
        assert_eq!(event.close_code(), Some(1000));
        assert_eq!(event.close_reason(), Some("bye"));
    }

    #[test]
    fn test_close_code_range() {
        assert!(validate_close_code(1000).is_ok());
        assert!(validate_close_code(4999).is_ok());
        assert!(matches!(
            validate_close_code(999),
            Err(ProtocolError::InvalidCloseCode(999))
        ));
        assert!(validate_close_code(5000).is_err());
    }
}
