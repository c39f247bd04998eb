//! Listener session state machine
//!
//! Stopped -> Starting -> Started -> Stopping -> Stopped, with a failed start
//! going back to Stopped and a failed stop going back to Started.

use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Cannot {action} while the server is {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },
}

/// Lifecycle of the listener as seen by the inspector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum SessionState {
    Stopped,
    Starting { address: SocketAddr },
    Started { address: SocketAddr },
    /// Keeps the address to restore if stopping fails
    Stopping { address: SocketAddr },
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Stopped => "stopped",
            SessionState::Starting { .. } => "starting",
            SessionState::Started { .. } => "started",
            SessionState::Stopping { .. } => "stopping",
        }
    }

    pub fn address(&self) -> Option<SocketAddr> {
        match self {
            SessionState::Stopped => None,
            SessionState::Starting { address }
            | SessionState::Started { address }
            | SessionState::Stopping { address } => Some(*address),
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, SessionState::Started { .. })
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address() {
            Some(address) => write!(f, "{} ({})", self.name(), address),
            None => f.write_str(self.name()),
        }
    }
}

/// Status reported by the listener, with its address already parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStatus {
    Starting(SocketAddr),
    Started(SocketAddr),
    Stopping,
    Stopped,
}

/// Owns the session state and enforces its transitions
#[derive(Debug)]
pub struct SessionController {
    state: SessionState,
}

impl SessionController {
    pub fn new() -> Self {
        Self {
            state: SessionState::Stopped,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn request_start(&mut self, address: SocketAddr) -> Result<SessionState, SessionError> {
        match self.state {
            SessionState::Stopped => self.enter(SessionState::Starting { address }),
            _ => Err(self.invalid("start")),
        }
    }

    /// The listener is bound; `address` is the one it actually bound
    pub fn confirm_started(&mut self, address: SocketAddr) -> Result<SessionState, SessionError> {
        match self.state {
            SessionState::Starting { .. } => self.enter(SessionState::Started { address }),
            _ => Err(self.invalid("confirm start")),
        }
    }

    pub fn start_failed(&mut self) -> Result<SessionState, SessionError> {
        match self.state {
            SessionState::Starting { .. } => self.enter(SessionState::Stopped),
            _ => Err(self.invalid("fail start")),
        }
    }

    pub fn request_stop(&mut self) -> Result<SessionState, SessionError> {
        match self.state {
            SessionState::Started { address } => self.enter(SessionState::Stopping { address }),
            _ => Err(self.invalid("stop")),
        }
    }

    pub fn confirm_stopped(&mut self) -> Result<SessionState, SessionError> {
        match self.state {
            SessionState::Stopping { .. } => self.enter(SessionState::Stopped),
            _ => Err(self.invalid("confirm stop")),
        }
    }

    pub fn stop_failed(&mut self) -> Result<SessionState, SessionError> {
        match self.state {
            SessionState::Stopping { address } => self.enter(SessionState::Started { address }),
            _ => Err(self.invalid("fail stop")),
        }
    }

    /// Follow a status reported by the listener
    ///
    /// Returns `None` when the controller is already in the reported state,
    /// which happens after an optimistic transition made by a command.
    pub fn apply_status(
        &mut self,
        status: ListenerStatus,
    ) -> Result<Option<SessionState>, SessionError> {
        let next = match (status, self.state) {
            (ListenerStatus::Starting(_), SessionState::Starting { .. })
            | (ListenerStatus::Stopping, SessionState::Stopping { .. })
            | (ListenerStatus::Stopped, SessionState::Stopped) => return Ok(None),
            (ListenerStatus::Started(address), SessionState::Started { address: current })
                if address == current =>
            {
                return Ok(None)
            }
            (ListenerStatus::Starting(address), _) => self.request_start(address)?,
            (ListenerStatus::Started(address), SessionState::Stopping { .. }) => {
                // The listener is still up after a stop attempt
                let restored = self.stop_failed()?;
                if restored.address() == Some(address) {
                    restored
                } else {
                    self.enter(SessionState::Started { address })?
                }
            }
            (ListenerStatus::Started(address), _) => self.confirm_started(address)?,
            (ListenerStatus::Stopping, _) => self.request_stop()?,
            (ListenerStatus::Stopped, SessionState::Starting { .. }) => self.start_failed()?,
            (ListenerStatus::Stopped, _) => self.confirm_stopped()?,
        };
        Ok(Some(next))
    }

    fn enter(&mut self, state: SessionState) -> Result<SessionState, SessionError> {
        tracing::debug!("Session {} -> {}", self.state, state);
        self.state = state;
        Ok(state)
    }

    fn invalid(&self, action: &'static str) -> SessionError {
        SessionError::InvalidTransition {
            action,
            state: self.state.name(),
        }
    }
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}
