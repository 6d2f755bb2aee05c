// src/connection/state.rs

//! Connection lifecycle states and the events broadcast on every transition.

use crate::core::errors::ClientError;
use std::time::Duration;
use strum_macros::{Display, IntoStaticStr};

/// The lifecycle state of one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    /// Lazy connection that has not been asked to connect yet.
    Wait,
    Connecting,
    /// The socket is established and the handshake is running.
    Connect,
    Ready,
    Close,
    Reconnecting,
    /// Terminal. No further reconnects will happen.
    End,
}

impl ConnectionState {
    /// Whether commands may be written straight to the socket.
    pub fn is_writable(self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::End)
    }
}

/// A lifecycle notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connecting,
    Connect,
    Ready,
    Error(ClientError),
    Close,
    Reconnecting { attempt: u32, delay: Duration },
    End,
}

impl ConnectionEvent {
    /// The state entered when this event fires, if the event is a transition.
    pub fn state(&self) -> Option<ConnectionState> {
        match self {
            ConnectionEvent::Connecting => Some(ConnectionState::Connecting),
            ConnectionEvent::Connect => Some(ConnectionState::Connect),
            ConnectionEvent::Ready => Some(ConnectionState::Ready),
            ConnectionEvent::Error(_) => None,
            ConnectionEvent::Close => Some(ConnectionState::Close),
            ConnectionEvent::Reconnecting { .. } => Some(ConnectionState::Reconnecting),
            ConnectionEvent::End => Some(ConnectionState::End),
        }
    }
}
