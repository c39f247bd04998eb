//! WebSocket Inspector Listener
//!
//! Accepts WebSocket clients on any path and reports what it observes
//! (connects, messages, disconnects, and its own lifecycle) as
//! [`Notification`]s on an unbounded channel. It also executes the operator
//! commands: start, stop, send and close.

mod listener;
mod socket;

pub use listener::{check_address, EventSink, Listener};

use std::net::{AddrParseError, SocketAddr};
use thiserror::Error;
use wsinspect_common::ProtocolError;

#[doc(no_inline)]
pub use wsinspect_common::Notification;

/// Errors returned by listener commands
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Invalid socket address: {0}")]
    InvalidAddress(#[from] AddrParseError),

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server already started")]
    AlreadyStarted,

    #[error("Server not started")]
    NotStarted,

    #[error("Unknown client {0}")]
    UnknownClient(u64),

    #[error("Client {0} is no longer connected")]
    ClientGone(u64),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
