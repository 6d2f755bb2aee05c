// src/core/errors.rs

//! Defines the error types surfaced by the client.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The structured kind of an error reply, extracted from its leading code word
/// at decode time so that routing logic never has to string-match messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerErrorKind {
    /// The slot is permanently served by another node.
    Moved { slot: u16, addr: String },
    /// The slot is being migrated; retry once against `addr` after `ASKING`.
    Ask { slot: u16, addr: String },
    /// Multi-key operation during resharding; safe to retry later.
    TryAgain,
    /// The cluster cannot serve the slot right now.
    ClusterDown,
    /// The requested script is not in the server's script cache.
    NoScript,
    /// The server is still loading its dataset.
    Loading,
    /// A write was sent to a read-only replica.
    ReadOnly,
    NoAuth,
    WrongPass,
    WrongType,
    /// `EXEC` was rejected because a queued command failed to queue.
    ExecAbort,
    /// The server is busy running a script.
    Busy,
    MasterDown,
    /// The generic `ERR` code.
    Generic,
    /// Any other code word, kept verbatim.
    Other(String),
}

/// An error reply sent by the server (the `-` frame type).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub kind: ServerErrorKind,
    pub message: String,
}

impl ServerError {
    /// Classifies a raw error line (without the leading `-` and trailing CRLF).
    pub fn parse(line: &str) -> Self {
        let (code, rest) = match line.split_once(' ') {
            Some((code, rest)) => (code, rest),
            None => (line, ""),
        };

        let kind = match code {
            "MOVED" | "ASK" => match parse_redirect(rest) {
                Some((slot, addr)) if code == "MOVED" => ServerErrorKind::Moved { slot, addr },
                Some((slot, addr)) => ServerErrorKind::Ask { slot, addr },
                None => ServerErrorKind::Other(code.to_string()),
            },
            "TRYAGAIN" => ServerErrorKind::TryAgain,
            "CLUSTERDOWN" => ServerErrorKind::ClusterDown,
            "NOSCRIPT" => ServerErrorKind::NoScript,
            "LOADING" => ServerErrorKind::Loading,
            "READONLY" => ServerErrorKind::ReadOnly,
            "NOAUTH" => ServerErrorKind::NoAuth,
            "WRONGPASS" => ServerErrorKind::WrongPass,
            "WRONGTYPE" => ServerErrorKind::WrongType,
            "EXECABORT" => ServerErrorKind::ExecAbort,
            "BUSY" => ServerErrorKind::Busy,
            "MASTERDOWN" => ServerErrorKind::MasterDown,
            "ERR" => ServerErrorKind::Generic,
            other => ServerErrorKind::Other(other.to_string()),
        };

        Self {
            kind,
            message: line.to_string(),
        }
    }

    /// Returns `true` for MOVED and ASK.
    pub fn is_redirect(&self) -> bool {
        matches!(
            self.kind,
            ServerErrorKind::Moved { .. } | ServerErrorKind::Ask { .. }
        )
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Parses the `<slot> <host:port>` tail of a MOVED/ASK error.
fn parse_redirect(rest: &str) -> Option<(u16, String)> {
    let (slot, addr) = rest.split_once(' ')?;
    let slot = slot.parse::<u16>().ok()?;
    let addr = addr.trim();
    if addr.is_empty() {
        return None;
    }
    Some((slot, addr.to_string()))
}

/// The main error enum for every client operation.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Command timed out")]
    CommandTimeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Server(ServerError),

    #[error("Stream isn't writeable and the offline queue is disabled")]
    NotReady,

    #[error("Offline queue is full ({0} commands)")]
    OfflineQueueFull(usize),

    #[error("Connection closed before the reply arrived")]
    ConnectionClosed,

    #[error("Connection is closed.")]
    ConnectionEnded,

    #[error("Reached the max retries per request limit ({0})")]
    MaxRetriesPerRequest(u32),

    /// A transaction was dropped because its WATCH did not survive a reconnect.
    #[error("WATCH state was lost to a disconnect; transaction aborted")]
    WatchLost,

    #[error("Connection in subscriber mode, only subscriber commands may be used")]
    SubscriberMode,

    #[error("CROSSSLOT Keys in request don't hash to the same slot")]
    CrossSlot,

    #[error("Too many cluster redirections or retries ({attempts}); last error: {last}")]
    RoutingExhausted {
        attempts: usize,
        last: Box<ClientError>,
    },

    #[error("Failed to refresh slots cache: {0}")]
    ClusterInit(String),

    #[error("Transaction discarded because of previous errors")]
    ExecAbort {
        /// Position in the transaction and queuing error for each rejected command.
        errors: Vec<(usize, ServerError)>,
    },

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl ClientError {
    /// The server error carried by this error, if any.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            ClientError::Server(e) => Some(e),
            _ => None,
        }
    }

    /// Returns `true` if this is a MOVED or ASK reply.
    pub fn is_redirect(&self) -> bool {
        self.server_error().is_some_and(ServerError::is_redirect)
    }

    /// Returns `true` for failures of the transport rather than of the command.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::ConnectTimeout(_)
                | ClientError::Protocol(_)
                | ClientError::ConnectionClosed
                | ClientError::ConnectionEnded
                | ClientError::NotReady
        )
    }
}

impl PartialEq for ClientError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ClientError::Io(e1), ClientError::Io(e2)) => e1.to_string() == e2.to_string(),
            (ClientError::Server(e1), ClientError::Server(e2)) => e1 == e2,
            (ClientError::Protocol(s1), ClientError::Protocol(s2)) => s1 == s2,
            (ClientError::UnexpectedReply(s1), ClientError::UnexpectedReply(s2)) => s1 == s2,
            (ClientError::InvalidArgument(s1), ClientError::InvalidArgument(s2)) => s1 == s2,
            (ClientError::ClusterInit(s1), ClientError::ClusterInit(s2)) => s1 == s2,
            (ClientError::ExecAbort { errors: e1 }, ClientError::ExecAbort { errors: e2 }) => {
                e1 == e2
            }
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(Arc::new(e))
    }
}

impl From<ServerError> for ClientError {
    fn from(e: ServerError) -> Self {
        ClientError::Server(e)
    }
}

impl From<std::str::Utf8Error> for ClientError {
    fn from(e: std::str::Utf8Error) -> Self {
        ClientError::UnexpectedReply(format!("invalid UTF-8: {e}"))
    }
}

impl From<std::num::ParseIntError> for ClientError {
    fn from(e: std::num::ParseIntError) -> Self {
        ClientError::UnexpectedReply(format!("not an integer: {e}"))
    }
}

impl From<std::num::ParseFloatError> for ClientError {
    fn from(e: std::num::ParseFloatError) -> Self {
        ClientError::UnexpectedReply(format!("not a float: {e}"))
    }
}
