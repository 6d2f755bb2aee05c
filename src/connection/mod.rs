// src/connection/mod.rs

//! A single logical connection to one server node.
//!
//! `Connection` is a cheap, cloneable handle. The socket itself is owned by a
//! background actor task (see `actor`), which survives reconnects; the handle
//! queues commands to it and awaits one-shot replies.

mod actor;
mod handshake;
mod options;
pub(crate) mod queue;
mod state;
mod stream;

pub use handshake::loading_wait;
pub use options::{ConnectionOptions, Credentials, OfflineFlush};
pub use queue::OfflineQueuePolicy;
pub use state::{ConnectionEvent, ConnectionState};
pub use stream::{Connector, DefaultConnector, Endpoint, NodeStream, TlsSettings, Transport};

use crate::core::commands::{Command, cmd};
use crate::core::errors::ClientError;
use crate::core::protocol::{FromRespValue, RespFrame, RespValue};
use crate::core::pubsub::{MessageFilter, MessageStream, PubSubHub};
use actor::{ConnectionActor, Lifecycle, Request};
use queue::{BatchCollector, FrameResult, Pending, Responder};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// The capacity of the lifecycle event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

struct Shared {
    tx: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    hub: Arc<PubSubHub>,
    options: Arc<ConnectionOptions>,
}

/// A handle to one connection. Clones share the same socket.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.shared.options.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Spawns the connection actor. Unless `lazy_connect` is set, it starts
    /// connecting immediately. Must be called within a tokio runtime.
    pub fn new(options: ConnectionOptions) -> Self {
        Self::with_hub(options, Arc::new(PubSubHub::new()))
    }

    /// Like `new`, but sharing an existing pub/sub hub (listeners and the
    /// subscription set to replay).
    pub fn with_hub(options: ConnectionOptions, hub: Arc<PubSubHub>) -> Self {
        let options = Arc::new(options);
        let initial = if options.lazy_connect {
            ConnectionState::Wait
        } else {
            ConnectionState::Connecting
        };
        let (state_tx, state_rx) = watch::channel(initial);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();

        let actor = ConnectionActor::new(
            options.clone(),
            rx,
            Lifecycle::new(state_tx, events.clone()),
            hub.clone(),
        );
        tokio::spawn(actor.run());

        Self {
            shared: Arc::new(Shared {
                tx,
                state: state_rx,
                events,
                hub,
                options,
            }),
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.shared.options
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.options.endpoint
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Subscribes to lifecycle events from now on.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// A receiver that observes every state change.
    pub fn state_watcher(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.clone()
    }

    /// Resolves once the connection is ready, or fails once it has ended.
    pub async fn wait_until_ready(&self) -> Result<(), ClientError> {
        let mut rx = self.shared.state.clone();
        loop {
            match *rx.borrow_and_update() {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::End => return Err(ClientError::ConnectionEnded),
                _ => {}
            }
            rx.changed()
                .await
                .map_err(|_| ClientError::ConnectionEnded)?;
        }
    }

    /// Starts a lazy or ended connection and waits until it is ready.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut rx = self.shared.state.clone();
        let was_ended = rx.borrow_and_update().is_terminal();
        self.request(Request::Connect)?;
        if was_ended {
            rx.changed()
                .await
                .map_err(|_| ClientError::ConnectionEnded)?;
        }
        self.wait_until_ready().await
    }

    /// Closes the socket. With `reconnect`, a new one is opened right away;
    /// otherwise the connection ends and pending commands fail.
    pub fn disconnect(&self, reconnect: bool) {
        let _ = self.request(Request::Disconnect { reconnect });
    }

    /// Sends QUIT and ends the connection once the server closes it.
    pub async fn quit(&self) -> Result<(), ClientError> {
        self.send(cmd("QUIT")).await.map(|_| ())
    }

    /// Replaces the AUTH parameters and reconnects with them.
    pub fn update_credentials(&self, credentials: Option<Credentials>) {
        let _ = self.request(Request::UpdateCredentials(credentials));
    }

    /// A new, independent connection with the same options.
    pub fn duplicate(&self) -> Self {
        Self::new((*self.shared.options).clone())
    }

    fn request(&self, request: Request) -> Result<(), ClientError> {
        self.shared
            .tx
            .send(request)
            .map_err(|_| ClientError::ConnectionEnded)
    }

    /// Sends a command and returns its transformed reply.
    ///
    /// The configured key prefix is applied to every key argument.
    pub async fn send(&self, command: Command) -> Result<RespValue, ClientError> {
        let command = match &self.shared.options.key_prefix {
            Some(prefix) => command.with_key_prefix(prefix),
            None => command,
        };
        let transform = command.transform();
        transform.apply(self.send_raw(command).await?)
    }

    /// Sends a command and converts the reply into `T`.
    pub async fn query<T: FromRespValue>(&self, command: Command) -> Result<T, ClientError> {
        T::from_resp(self.send(command).await?)
    }

    /// Sends a command as-is. Error replies come back as `Ok(RespFrame::Error)`.
    pub async fn send_raw(&self, command: Command) -> Result<RespFrame, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.request(Request::Command(Pending::new(command, Responder::Caller(tx))))?;
        self.await_reply(rx).await?
    }

    /// Writes `commands` back to back in one flush. With `transaction`, the
    /// batch is treated as one MULTI..EXEC unit: it fails as a whole on
    /// disconnect and is aborted if an outstanding WATCH was lost.
    pub(crate) async fn send_batch(
        &self,
        commands: Vec<Command>,
        transaction: bool,
    ) -> Result<Vec<FrameResult>, ClientError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let (tx, rx) = oneshot::channel();
        let collector = BatchCollector::new(commands.len(), tx);
        let entries = commands
            .into_iter()
            .enumerate()
            .map(|(index, command)| {
                let mut pending = Pending::new(
                    command,
                    Responder::Batch {
                        collector: collector.clone(),
                        index,
                    },
                );
                pending.in_transaction = transaction;
                pending.tx_start = transaction && index == 0;
                pending
            })
            .collect();
        self.request(Request::Batch(entries))?;
        self.await_reply(rx).await
    }

    async fn await_reply<T>(&self, rx: oneshot::Receiver<T>) -> Result<T, ClientError> {
        let reply = match self.shared.options.command_timeout {
            // The command stays queued; its late reply is discarded.
            Some(timeout) => tokio::time::timeout(timeout, rx)
                .await
                .map_err(|_| ClientError::CommandTimeout)?,
            None => rx.await,
        };
        reply.map_err(|_| ClientError::ConnectionEnded)
    }

    /// The pub/sub hub of this connection.
    pub fn hub(&self) -> &Arc<PubSubHub> {
        &self.shared.hub
    }

    /// Registers a listener for published messages.
    pub fn messages(&self, filter: MessageFilter) -> MessageStream {
        self.shared.hub.listen(filter)
    }
}
