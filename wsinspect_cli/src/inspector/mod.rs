//! Connection and event state store for the WebSocket listener

pub mod adapter;
mod format;
mod log;
mod registry;
mod server;
mod session;
mod store;

pub use format::MessageFormat;
pub use log::LogEntry;
pub use server::{shutdown_session, start_server, start_session, AppState};
pub use store::{InspectorStore, StoreEvent};
