//! Inspector state and broadcast for live subscribers

use super::log::{EventLog, LogEntry};
use super::registry::{Connection, ConnectionRegistry};
use super::session::{ListenerStatus, SessionController, SessionError, SessionState};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::sync::{broadcast, RwLock};

/// Capacity of the live event channel
const BROADCAST_CAPACITY: usize = 256;

/// A connect, message or disconnect observed by the listener
///
/// Domain events are recorded in the log exactly as they are ingested.
pub type DomainEvent = LogEntry;

/// Result of ingesting one domain event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    /// Not attributable, or no session running
    Dropped,
    Applied { logged: bool },
}

impl Ingested {
    pub fn is_applied(&self) -> bool {
        matches!(self, Ingested::Applied { .. })
    }
}

/// Counters for the status endpoint
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub session: SessionState,
    pub capturing: bool,
    pub connections: usize,
    pub open_connections: usize,
    pub log_entries: usize,
}

/// Everything a new subscriber needs before following live events
#[derive(Debug, Clone, Serialize)]
pub struct StoreSnapshot {
    pub session: SessionState,
    pub capturing: bool,
    pub connections: Vec<Connection>,
    pub log: Vec<LogEntry>,
}

/// Events broadcast to live subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum StoreEvent {
    #[serde(rename = "event")]
    Ingested { entry: LogEntry, logged: bool },
    #[serde(rename = "clear")]
    LogCleared,
    #[serde(rename = "capture")]
    CaptureChanged { active: bool },
    #[serde(rename = "session")]
    Session(SessionState),
}

/// Registry, log and session owned together so every event applies atomically
#[derive(Debug, Default)]
pub struct InspectorState {
    registry: ConnectionRegistry,
    log: EventLog,
    session: SessionController,
}

impl InspectorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a domain event to the registry, then the log if it was accepted
    pub fn ingest(&mut self, event: DomainEvent) -> Ingested {
        if !self.session.state().is_started() {
            tracing::trace!(
                "Dropping {} for client {}, server is {}",
                event.kind(),
                event.client().identifier,
                self.session.state()
            );
            return Ingested::Dropped;
        }

        let applied = match &event {
            LogEntry::Connect(connect) => self.registry.open(connect.clone()),
            LogEntry::Message(message) => self.registry.message(message.clone()),
            LogEntry::Disconnect(disconnect) => self.registry.close(disconnect.clone()),
        };
        if !applied {
            return Ingested::Dropped;
        }

        Ingested::Applied {
            logged: self.log.append(event),
        }
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    pub fn toggle_capture(&mut self) -> bool {
        self.log.toggle_active()
    }

    pub fn request_start(&mut self, address: SocketAddr) -> Result<SessionState, SessionError> {
        self.transition(|session| session.request_start(address))
    }

    pub fn confirm_started(&mut self, address: SocketAddr) -> Result<SessionState, SessionError> {
        self.transition(|session| session.confirm_started(address))
    }

    pub fn start_failed(&mut self) -> Result<SessionState, SessionError> {
        self.transition(SessionController::start_failed)
    }

    pub fn request_stop(&mut self) -> Result<SessionState, SessionError> {
        self.transition(SessionController::request_stop)
    }

    pub fn confirm_stopped(&mut self) -> Result<SessionState, SessionError> {
        self.transition(SessionController::confirm_stopped)
    }

    pub fn stop_failed(&mut self) -> Result<SessionState, SessionError> {
        self.transition(SessionController::stop_failed)
    }

    pub fn apply_status(
        &mut self,
        status: ListenerStatus,
    ) -> Result<Option<SessionState>, SessionError> {
        let next = self.session.apply_status(status)?;
        if let Some(state) = next {
            self.on_session_change(state);
        }
        Ok(next)
    }

    fn transition<F>(&mut self, apply: F) -> Result<SessionState, SessionError>
    where
        F: FnOnce(&mut SessionController) -> Result<SessionState, SessionError>,
    {
        let state = apply(&mut self.session)?;
        self.on_session_change(state);
        Ok(state)
    }

    /// Per-session data only lives while a listener is running
    fn on_session_change(&mut self, state: SessionState) {
        if state == SessionState::Stopped {
            self.registry.reset();
            self.log.clear();
            self.log.set_active(true);
        }
    }

    pub fn session(&self) -> SessionState {
        self.session.state()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            session: self.session.state(),
            capturing: self.log.is_active(),
            connections: self.registry.len(),
            open_connections: self.registry.open_count(),
            log_entries: self.log.len(),
        }
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            session: self.session.state(),
            capturing: self.log.is_active(),
            connections: self.registry.all().values().cloned().collect(),
            log: self.log.entries().to_vec(),
        }
    }
}

/// Shared inspector state with broadcast capability
pub struct InspectorStore {
    state: RwLock<InspectorState>,
    broadcast_tx: broadcast::Sender<StoreEvent>,
}

impl InspectorStore {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            state: RwLock::new(InspectorState::new()),
            broadcast_tx,
        }
    }

    /// Ingest a domain event and broadcast it if it was applied
    pub async fn ingest(&self, event: DomainEvent) -> Ingested {
        let mut state = self.state.write().await;
        let outcome = state.ingest(event.clone());
        if let Ingested::Applied { logged } = outcome {
            // Sent under the lock so subscribers see events in apply order
            let _ = self.broadcast_tx.send(StoreEvent::Ingested {
                entry: event,
                logged,
            });
        }
        outcome
    }

    pub async fn apply_status(
        &self,
        status: ListenerStatus,
    ) -> Result<Option<SessionState>, SessionError> {
        let mut state = self.state.write().await;
        let next = state.apply_status(status)?;
        if let Some(session) = next {
            let _ = self.broadcast_tx.send(StoreEvent::Session(session));
        }
        Ok(next)
    }

    pub async fn request_start(&self, address: SocketAddr) -> Result<SessionState, SessionError> {
        self.transition(|state| state.request_start(address)).await
    }

    pub async fn confirm_started(
        &self,
        address: SocketAddr,
    ) -> Result<SessionState, SessionError> {
        self.transition(|state| state.confirm_started(address)).await
    }

    pub async fn start_failed(&self) -> Result<SessionState, SessionError> {
        self.transition(InspectorState::start_failed).await
    }

    pub async fn request_stop(&self) -> Result<SessionState, SessionError> {
        self.transition(InspectorState::request_stop).await
    }

    pub async fn confirm_stopped(&self) -> Result<SessionState, SessionError> {
        self.transition(InspectorState::confirm_stopped).await
    }

    pub async fn stop_failed(&self) -> Result<SessionState, SessionError> {
        self.transition(InspectorState::stop_failed).await
    }

    async fn transition<F>(&self, apply: F) -> Result<SessionState, SessionError>
    where
        F: FnOnce(&mut InspectorState) -> Result<SessionState, SessionError>,
    {
        let mut state = self.state.write().await;
        let session = apply(&mut state)?;
        let _ = self.broadcast_tx.send(StoreEvent::Session(session));
        Ok(session)
    }

    /// Clear the log; connections are kept
    pub async fn clear_log(&self) {
        self.state.write().await.clear_log();
        let _ = self.broadcast_tx.send(StoreEvent::LogCleared);
    }

    /// Pause or resume capture, returning the new flag
    pub async fn toggle_capture(&self) -> bool {
        let mut state = self.state.write().await;
        let active = state.toggle_capture();
        let _ = self.broadcast_tx.send(StoreEvent::CaptureChanged { active });
        active
    }

    pub async fn session(&self) -> SessionState {
        self.state.read().await.session()
    }

    pub async fn status(&self) -> StatusSnapshot {
        self.state.read().await.status()
    }

    /// All connections ordered by identifier
    pub async fn connections(&self) -> Vec<Connection> {
        self.state
            .read()
            .await
            .registry()
            .all()
            .values()
            .cloned()
            .collect()
    }

    pub async fn connection(&self, identifier: u64) -> Option<Connection> {
        self.state.read().await.registry().get(identifier).cloned()
    }

    pub async fn log_entries(&self) -> Vec<LogEntry> {
        self.state.read().await.log().entries().to_vec()
    }

    /// Subscribe to store events
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Take a snapshot and subscribe without missing anything in between
    pub async fn snapshot_and_subscribe(&self) -> (StoreSnapshot, broadcast::Receiver<StoreEvent>) {
        let state = self.state.read().await;
        (state.snapshot(), self.broadcast_tx.subscribe())
    }
}

impl Default for InspectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use wsinspect_common::{
        ClientHandle, CloseFrame, ConnectEvent, Direction, DisconnectEvent, MessageEvent,
    };

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 3030))
    }

    fn client(identifier: u64) -> ClientHandle {
        ClientHandle::new(identifier, "127.0.0.1:9001")
    }

    fn connect(identifier: u64, path: &str) -> DomainEvent {
        LogEntry::Connect(ConnectEvent::new(client(identifier), path))
    }

    fn text(identifier: u64, text: &str) -> DomainEvent {
        LogEntry::Message(MessageEvent::text(
            client(identifier),
            Direction::FromClient,
            text,
        ))
    }

    fn disconnect(identifier: u64, code: u16, reason: &str) -> DomainEvent {
        LogEntry::Disconnect(DisconnectEvent::new(
            client(identifier),
            Some(CloseFrame {
                code,
                reason: reason.to_string(),
            }),
        ))
    }

    fn started() -> InspectorState {
        let mut state = InspectorState::new();
        state.request_start(addr()).unwrap();
        state.confirm_started(addr()).unwrap();
        state
    }

    fn message_texts(connection: &Connection) -> Vec<String> {
        connection
            .messages
            .iter()
            .map(|m| match &m.body {
                wsinspect_common::MessageBody::Text(text) => text.clone(),
                other => panic!("unexpected body {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_events_dropped_unless_started() {
        let mut state = InspectorState::new();
        assert_eq!(state.ingest(connect(1, "")), Ingested::Dropped);

        state.request_start(addr()).unwrap();
        assert_eq!(state.ingest(connect(1, "")), Ingested::Dropped);

        state.confirm_started(addr()).unwrap();
        assert_eq!(
            state.ingest(connect(1, "")),
            Ingested::Applied { logged: true }
        );

        state.request_stop().unwrap();
        assert_eq!(state.ingest(text(1, "late")), Ingested::Dropped);
        assert!(state.registry().get(1).unwrap().messages.is_empty());
    }

    #[test]
    fn test_open_message_close_scenario() {
        let mut state = started();

        state.ingest(LogEntry::Connect(ConnectEvent::new(
            ClientHandle::new(1, "127.0.0.1:9001"),
            "chat",
        )));
        let connection = state.registry().get(1).unwrap();
        assert!(connection.is_open());
        assert_eq!(connection.messages.len(), 0);
        assert_eq!(state.registry().len(), 1);

        state.ingest(text(1, "hi"));
        assert_eq!(state.registry().get(1).unwrap().messages.len(), 1);

        state.ingest(disconnect(1, 1000, "bye"));
        let closed = state.registry().get(1).unwrap();
        assert_eq!(closed.disconnection.as_ref().unwrap().close_code(), Some(1000));
        assert_eq!(closed.disconnection.as_ref().unwrap().close_reason(), Some("bye"));

        assert_eq!(state.ingest(text(1, "after")), Ingested::Dropped);
        assert_eq!(state.registry().get(1).unwrap().messages.len(), 1);
        assert_eq!(state.log().len(), 3);
    }

    #[test]
    fn test_capture_off_still_updates_registry() {
        let mut state = started();
        assert!(!state.toggle_capture());

        assert_eq!(
            state.ingest(connect(2, "")),
            Ingested::Applied { logged: false }
        );
        state.ingest(text(2, "x"));
        state.ingest(disconnect(2, 1000, "done"));

        let connection = state.registry().get(2).unwrap();
        assert_eq!(connection.messages.len(), 1);
        assert!(!connection.is_open());
        assert!(state.log().is_empty());
    }

    #[test]
    fn test_capture_off_counts_messages() {
        let mut state = started();
        state.ingest(connect(1, ""));
        let before = state.log().len();
        state.toggle_capture();

        for i in 0..5 {
            state.ingest(text(1, &i.to_string()));
        }

        assert_eq!(state.registry().get(1).unwrap().messages.len(), 5);
        assert_eq!(state.log().len(), before);
    }

    #[test]
    fn test_duplicate_disconnect_is_idempotent() {
        let mut once = started();
        once.ingest(connect(1, ""));
        let event = disconnect(1, 1000, "bye");
        once.ingest(event.clone());

        let mut twice = started();
        twice.ingest(connect(1, ""));
        twice.ingest(event.clone());
        assert_eq!(twice.ingest(event), Ingested::Dropped);

        let once_connection = once.registry().get(1).unwrap();
        let twice_connection = twice.registry().get(1).unwrap();
        assert_eq!(once_connection.disconnection, twice_connection.disconnection);
        assert_eq!(once_connection.messages, twice_connection.messages);
        assert_eq!(once.log().len(), twice.log().len());
    }

    #[test]
    fn test_session_cycle_resets_everything() {
        let mut state = InspectorState::new();
        state.request_start(addr()).unwrap();
        state.confirm_started(addr()).unwrap();

        state.ingest(connect(1, "a"));
        state.ingest(connect(2, "b"));
        state.ingest(text(1, "hi"));
        state.toggle_capture();
        assert!(!state.registry().is_empty());

        state.request_stop().unwrap();
        state.confirm_stopped().unwrap();

        assert_eq!(state.session(), SessionState::Stopped);
        assert!(state.registry().is_empty());
        assert!(state.log().is_empty());
        assert!(state.log().is_active());
    }

    #[test]
    fn test_failed_stop_keeps_connections() {
        let mut state = started();
        state.ingest(connect(1, ""));

        state.request_stop().unwrap();
        state.stop_failed().unwrap();

        assert!(state.session().is_started());
        assert_eq!(state.registry().len(), 1);
        assert_eq!(state.ingest(text(1, "again")), Ingested::Applied { logged: true });
    }

    #[test]
    fn test_clear_log_keeps_registry() {
        let mut state = started();
        state.ingest(connect(1, ""));
        state.clear_log();

        assert!(state.log().is_empty());
        assert_eq!(state.registry().len(), 1);
    }

    #[test]
    fn test_status_counters() {
        let mut state = started();
        state.ingest(connect(1, ""));
        state.ingest(connect(2, ""));
        state.ingest(disconnect(2, 1000, ""));

        let status = state.status();
        assert_eq!(status.connections, 2);
        assert_eq!(status.open_connections, 1);
        assert_eq!(status.log_entries, 3);
        assert!(status.capturing);
        assert_eq!(status.session, SessionState::Started { address: addr() });
    }

    #[tokio::test]
    async fn test_store_broadcasts_applied_events() {
        let store = InspectorStore::new();
        store.request_start(addr()).await.unwrap();
        store.confirm_started(addr()).await.unwrap();

        let mut rx = store.subscribe();
        assert!(store.ingest(connect(1, "")).await.is_applied());
        assert!(!store.ingest(text(9, "nobody")).await.is_applied());
        store.toggle_capture().await;

        match rx.recv().await.unwrap() {
            StoreEvent::Ingested { entry, logged } => {
                assert_eq!(entry.kind(), "connect");
                assert!(logged);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            StoreEvent::CaptureChanged { active: false }
        ));
    }

    #[tokio::test]
    async fn test_store_snapshot_then_live() {
        let store = InspectorStore::new();
        store.request_start(addr()).await.unwrap();
        store.confirm_started(addr()).await.unwrap();
        store.ingest(connect(1, "")).await;

        let (snapshot, mut rx) = store.snapshot_and_subscribe().await;
        assert_eq!(snapshot.connections.len(), 1);
        assert_eq!(snapshot.log.len(), 1);

        store.clear_log().await;
        assert!(matches!(rx.recv().await.unwrap(), StoreEvent::LogCleared));
        assert!(store.log_entries().await.is_empty());
        assert_eq!(store.connections().await.len(), 1);
    }

    #[tokio::test]
    async fn test_store_invalid_transition_is_not_broadcast() {
        let store = InspectorStore::new();
        let mut rx = store.subscribe();

        assert!(store.request_stop().await.is_err());
        assert!(store.apply_status(ListenerStatus::Stopped).await.unwrap().is_none());
        assert!(rx.try_recv().is_err());
        assert_eq!(store.session().await, SessionState::Stopped);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Connect(u64),
        Message(u64),
        Disconnect(u64),
        Toggle,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            1 => (1u64..4).prop_map(Op::Connect),
            4 => (1u64..4).prop_map(Op::Message),
            1 => (1u64..4).prop_map(Op::Disconnect),
            1 => Just(Op::Toggle),
        ]
    }

    proptest! {
        #[test]
        fn prop_messages_grow_and_disconnection_is_final(ops in prop::collection::vec(op(), 0..64)) {
            let mut state = started();
            // Connect up front so overwrites are the only way a list shrinks
            for identifier in 1..4 {
                state.ingest(connect(identifier, ""));
            }

            for (n, op) in ops.into_iter().enumerate() {
                let before: Vec<(u64, usize, Option<DisconnectEvent>)> = state
                    .registry()
                    .all()
                    .values()
                    .map(|c| (c.identifier(), c.messages.len(), c.disconnection.clone()))
                    .collect();

                match op {
                    Op::Connect(_) => continue,
                    Op::Message(id) => { state.ingest(text(id, &n.to_string())); }
                    Op::Disconnect(id) => { state.ingest(disconnect(id, 1000, &n.to_string())); }
                    Op::Toggle => { state.toggle_capture(); }
                }

                for (id, len, disconnection) in before {
                    let connection = state.registry().get(id).unwrap();
                    prop_assert!(connection.messages.len() >= len);
                    if disconnection.is_some() {
                        prop_assert_eq!(&connection.disconnection, &disconnection);
                        prop_assert_eq!(connection.messages.len(), len);
                    }
                }
            }
        }

        #[test]
        fn prop_per_client_order_is_arrival_order(
            sends in prop::collection::vec((1u64..4, any::<u16>()), 0..64)
        ) {
            let mut state = started();
            for identifier in 1..4 {
                state.ingest(connect(identifier, ""));
            }

            for (identifier, value) in &sends {
                state.ingest(text(*identifier, &value.to_string()));
            }

            for identifier in 1..4 {
                let expected: Vec<String> = sends
                    .iter()
                    .filter(|(id, _)| *id == identifier)
                    .map(|(_, value)| value.to_string())
                    .collect();
                let connection = state.registry().get(identifier).unwrap();
                prop_assert_eq!(message_texts(connection), expected);
            }
        }

        #[test]
        fn prop_stop_always_empties_state(ops in prop::collection::vec(op(), 0..64)) {
            let mut state = started();
            for op in ops {
                match op {
                    Op::Connect(id) => { state.ingest(connect(id, "")); }
                    Op::Message(id) => { state.ingest(text(id, "x")); }
                    Op::Disconnect(id) => { state.ingest(disconnect(id, 1000, "")); }
                    Op::Toggle => { state.toggle_capture(); }
                }
            }

            state.request_stop().unwrap();
            state.confirm_stopped().unwrap();

            prop_assert!(state.registry().is_empty());
            prop_assert!(state.log().is_empty());
        }
    }
}
