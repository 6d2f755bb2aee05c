// src/connection/actor.rs

//! The per-connection event loop.
//!
//! One actor task owns the socket, the in-flight queue, the offline queue and
//! the reconnect timer. Handles talk to it only through an mpsc channel, so
//! every write goes through a single writer in call order and every reply is
//! matched against the oldest in-flight command.
//!
//! Lifecycle: `wait` (lazy) → `connecting` → `connect` → `ready`, and on any
//! transport failure `close` → `reconnecting` → `connecting` ... until the
//! reconnect policy gives up (`end`).

use super::handshake::{self, NodeFramed};
use super::options::{ConnectionOptions, Credentials, OfflineFlush};
use super::queue::{InternalKind, OfflineQueue, Pending, Responder};
use super::state::{ConnectionEvent, ConnectionState};
use crate::core::commands::{Command, SubscriptionOp, cmd};
use crate::core::errors::ClientError;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use crate::core::pubsub::{PubSubHub, PubSubMessage, SubscriptionKind, parse_ack};
use crate::core::reconnect::ReconnectAction;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Requests accepted more than this many at a time still get one flush each batch.
const MAX_COALESCED_REQUESTS: usize = 256;

/// Messages from handles to the actor.
pub(crate) enum Request {
    Command(Pending),
    /// Entries written back to back with a single flush.
    Batch(Vec<Pending>),
    Connect,
    Disconnect { reconnect: bool },
    UpdateCredentials(Option<Credentials>),
}

/// Publishes state transitions and lifecycle events.
#[derive(Clone)]
pub(crate) struct Lifecycle {
    state: Arc<watch::Sender<ConnectionState>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Lifecycle {
    pub(crate) fn new(
        state: watch::Sender<ConnectionState>,
        events: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            state: Arc::new(state),
            events,
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Some(state) = event.state() {
            self.state.send_replace(state);
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// How a connected (or connecting) phase ended.
enum Exit {
    Reconnect,
    Shutdown,
}

pub(crate) struct ConnectionActor {
    options: Arc<ConnectionOptions>,
    credentials: Option<Credentials>,
    rx: mpsc::UnboundedReceiver<Request>,
    lifecycle: Lifecycle,
    hub: Arc<PubSubHub>,
    in_flight: VecDeque<Pending>,
    offline: OfflineQueue,
    /// Consecutive failed connection attempts.
    attempt: u32,
    ready: bool,
    next_ready_check: Option<Instant>,
    /// A WATCH has been acknowledged on the current socket.
    watching: bool,
    /// A WATCH was outstanding when the socket dropped.
    watch_lost: bool,
    /// Skip the backoff delay on the next reconnect.
    reconnect_now: bool,
    /// A command to resend before anything else after a forced reconnect.
    resend: Option<Pending>,
    /// `disconnect(false)`, `QUIT` or all handles dropped.
    closing: bool,
}

impl ConnectionActor {
    pub(crate) fn new(
        options: Arc<ConnectionOptions>,
        rx: mpsc::UnboundedReceiver<Request>,
        lifecycle: Lifecycle,
        hub: Arc<PubSubHub>,
    ) -> Self {
        Self {
            credentials: options.credentials.clone(),
            offline: OfflineQueue::new(options.offline_queue),
            options,
            rx,
            lifecycle,
            hub,
            in_flight: VecDeque::new(),
            attempt: 0,
            ready: false,
            next_ready_check: None,
            watching: false,
            watch_lost: false,
            reconnect_now: false,
            resend: None,
            closing: false,
        }
    }

    /// The main run loop. Returns once every handle has been dropped.
    pub(crate) async fn run(mut self) {
        let mut start_now = !self.options.lazy_connect;
        loop {
            if !start_now && !self.wait_for_connect().await {
                return;
            }
            start_now = false;

            loop {
                let exit = match self.connect_phase().await {
                    Ok(framed) => self.serve(framed).await,
                    Err(exit) => exit,
                };
                match exit {
                    Exit::Reconnect if self.schedule_reconnect().await => continue,
                    _ => break,
                }
            }

            if !self.end().await {
                return;
            }
            // `connect()` after `end` starts over.
            self.closing = false;
            self.attempt = 0;
            start_now = true;
        }
    }

    /// Waits in the `wait` state for the first command or an explicit connect.
    /// Returns `false` if the connection should stop instead.
    async fn wait_for_connect(&mut self) -> bool {
        loop {
            match self.rx.recv().await {
                None => return false,
                Some(Request::Connect) => return true,
                Some(Request::Disconnect { .. }) => {
                    self.closing = true;
                    self.lifecycle.emit(ConnectionEvent::End);
                }
                Some(Request::UpdateCredentials(creds)) => self.credentials = creds,
                Some(Request::Command(pending)) => {
                    self.admit_lazy(vec![pending]);
                    return true;
                }
                Some(Request::Batch(entries)) => {
                    self.admit_lazy(entries);
                    return true;
                }
            }
        }
    }

    /// The first command of a lazy connection is queued regardless of the
    /// offline queue being disabled, since it is what triggers the connect.
    fn admit_lazy(&mut self, entries: Vec<Pending>) {
        match self.offline.check_admission(entries.len()) {
            Ok(()) | Err(ClientError::NotReady) => {
                for pending in entries {
                    self.offline.push_back(pending);
                }
            }
            Err(e) => fail_all(entries, &e),
        }
    }

    /// Accepts a request while no socket is writable.
    fn queue_offline(&mut self, request: Request) {
        match request {
            Request::Command(pending) => self.admit_offline(vec![pending]),
            Request::Batch(entries) => self.admit_offline(entries),
            Request::UpdateCredentials(creds) => self.credentials = creds,
            Request::Connect | Request::Disconnect { .. } => {}
        }
    }

    fn admit_offline(&mut self, entries: Vec<Pending>) {
        match self.offline.check_admission(entries.len()) {
            Ok(()) => {
                for pending in entries {
                    self.offline.push_back(pending);
                }
            }
            Err(e) => {
                debug!("Rejecting {} command(s) while not writable: {e}", entries.len());
                fail_all(entries, &e);
            }
        }
    }

    /// Opens the socket and runs the handshake while queueing incoming requests.
    async fn connect_phase(&mut self) -> Result<NodeFramed, Exit> {
        self.lifecycle.emit(ConnectionEvent::Connecting);
        info!("Connecting to {}", self.options.endpoint);

        let options = self.options.clone();
        let credentials = self.credentials.clone();
        let lifecycle = self.lifecycle.clone();
        let establish = async move {
            let stream = tokio::time::timeout(
                options.connect_timeout,
                options.connector.connect(&options.endpoint),
            )
            .await
            .map_err(|_| ClientError::ConnectTimeout(options.connect_timeout))??;
            lifecycle.emit(ConnectionEvent::Connect);

            let mut framed = Framed::new(stream, RespFrameCodec);
            handshake::perform_handshake(&mut framed, &options, credentials.as_ref()).await?;
            if options.enable_ready_check && options.offline_flush == OfflineFlush::AfterReady {
                handshake::wait_until_ready(&mut framed).await?;
            }
            Ok::<_, ClientError>(framed)
        };
        tokio::pin!(establish);

        loop {
            tokio::select! {
                result = &mut establish => {
                    return result.map_err(|e| {
                        warn!("Failed to connect to {}: {e}", self.options.endpoint);
                        self.lifecycle.emit(ConnectionEvent::Error(e));
                        self.lifecycle.emit(ConnectionEvent::Close);
                        if self.closing { Exit::Shutdown } else { Exit::Reconnect }
                    });
                }
                request = self.rx.recv() => match request {
                    None => {
                        self.closing = true;
                        return Err(Exit::Shutdown);
                    }
                    Some(Request::Disconnect { reconnect: false }) => {
                        self.closing = true;
                        self.lifecycle.emit(ConnectionEvent::Close);
                        return Err(Exit::Shutdown);
                    }
                    Some(Request::Disconnect { reconnect: true }) => {
                        self.reconnect_now = true;
                        self.lifecycle.emit(ConnectionEvent::Close);
                        return Err(Exit::Reconnect);
                    }
                    Some(request) => self.queue_offline(request),
                },
            }
        }
    }

    /// Drives an established socket until it fails or is closed.
    async fn serve(&mut self, mut framed: NodeFramed) -> Exit {
        self.ready = false;
        self.next_ready_check = None;

        let check_pending = self.options.enable_ready_check
            && self.options.offline_flush == OfflineFlush::OnConnect;
        if !check_pending {
            self.become_ready();
        }

        if let Err(e) = self.on_writable(&mut framed, check_pending).await {
            return self.teardown(Some(e));
        }

        loop {
            let check_at = self.next_ready_check;
            tokio::select! {
                frame = framed.next() => match frame {
                    Some(Ok(frame)) => {
                        if let Some(exit) = self.on_frame(frame) {
                            return exit;
                        }
                    }
                    Some(Err(e)) => {
                        error!("Protocol error on {}: {e}", self.options.endpoint);
                        return self.teardown(Some(e));
                    }
                    None => {
                        let reason = (!self.closing).then_some(ClientError::ConnectionClosed);
                        return self.teardown(reason);
                    }
                },
                request = self.rx.recv() => {
                    let Some(request) = request else {
                        self.closing = true;
                        return self.teardown(None);
                    };
                    if let Some(exit) = self.on_requests(request, &mut framed).await {
                        return exit;
                    }
                },
                _ = sleep_until_check(check_at), if check_at.is_some() => {
                    self.next_ready_check = None;
                    let check = Pending::new(
                        cmd("INFO"),
                        Responder::Internal(InternalKind::ReadyCheck),
                    );
                    let result = match self.dispatch_unit(&mut framed, vec![check]).await {
                        Ok(()) => flush(&mut framed).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        return self.teardown(Some(e));
                    }
                },
            }
        }
    }

    fn become_ready(&mut self) {
        self.ready = true;
        self.attempt = 0;
        info!("Connection to {} is ready", self.options.endpoint);
        self.lifecycle.emit(ConnectionEvent::Ready);
    }

    /// Replays subscriptions, then the offline queue, in one flush.
    async fn on_writable(
        &mut self,
        framed: &mut NodeFramed,
        ready_check: bool,
    ) -> Result<(), ClientError> {
        if self.options.auto_resubscribe {
            let set = self.hub.subscriptions();
            let channels: Vec<_> = set.channels().cloned().collect();
            let patterns: Vec<_> = set.patterns().cloned().collect();
            for (name, targets) in [("SUBSCRIBE", channels), ("PSUBSCRIBE", patterns)] {
                if targets.is_empty() {
                    continue;
                }
                info!("Resubscribing to {} {}(s)", targets.len(), name.to_ascii_lowercase());
                let command = cmd(name).args(targets);
                let pending = Pending::new(command, Responder::Internal(InternalKind::Resubscribe));
                self.dispatch_unit(framed, vec![pending]).await?;
            }
        }

        if let Some(resend) = self.resend.take() {
            self.offline.requeue_front(vec![resend]);
        }
        if !self.offline.is_empty() {
            debug!("Flushing {} offline command(s)", self.offline.len());
        }
        while let Some(unit) = self.pop_offline_unit() {
            self.dispatch_unit(framed, unit).await?;
        }

        if ready_check {
            let pending = Pending::new(cmd("INFO"), Responder::Internal(InternalKind::ReadyCheck));
            self.dispatch_unit(framed, vec![pending]).await?;
        }
        flush(framed).await
    }

    /// Pops the next command, or a whole MULTI..EXEC group.
    fn pop_offline_unit(&mut self) -> Option<Vec<Pending>> {
        let first = self.offline.pop_front()?;
        if !first.tx_start {
            return Some(vec![first]);
        }
        let mut unit = vec![first];
        while let Some(next) = self.offline.pop_front() {
            let is_exec = next.command.name() == "EXEC";
            unit.push(next);
            if is_exec {
                break;
            }
        }
        Some(unit)
    }

    /// Handles one request plus whatever else is already waiting, then flushes once.
    async fn on_requests(&mut self, first: Request, framed: &mut NodeFramed) -> Option<Exit> {
        let mut next = Some(first);
        let mut handled = 0;
        while let Some(request) = next.take() {
            let result = match request {
                Request::Command(pending) => self.dispatch_unit(framed, vec![pending]).await,
                Request::Batch(entries) => self.dispatch_unit(framed, entries).await,
                Request::Connect => Ok(()),
                Request::Disconnect { reconnect } => {
                    if reconnect {
                        info!("Disconnect requested on {}, reconnecting", self.options.endpoint);
                        self.reconnect_now = true;
                    } else {
                        info!("Disconnect requested on {}", self.options.endpoint);
                        self.closing = true;
                    }
                    let _ = flush(framed).await;
                    return Some(self.teardown(None));
                }
                Request::UpdateCredentials(creds) => {
                    info!("Credentials updated for {}, reconnecting", self.options.endpoint);
                    self.credentials = creds;
                    self.reconnect_now = true;
                    let _ = flush(framed).await;
                    return Some(self.teardown(None));
                }
            };
            if let Err(e) = result {
                return Some(self.teardown(Some(e)));
            }
            handled += 1;
            if handled < MAX_COALESCED_REQUESTS {
                next = self.rx.try_recv().ok();
            }
        }
        match flush(framed).await {
            Ok(()) => None,
            Err(e) => Some(self.teardown(Some(e))),
        }
    }

    fn subscriber_mode(&self) -> bool {
        !self.hub.subscriptions().is_empty()
    }

    /// Writes a command or group without flushing. A transaction whose WATCH
    /// was lost to a disconnect is failed here without being sent.
    async fn dispatch_unit(
        &mut self,
        framed: &mut NodeFramed,
        unit: Vec<Pending>,
    ) -> Result<(), ClientError> {
        if self.watch_lost && unit.first().is_some_and(|p| p.tx_start) {
            self.watch_lost = false;
            debug!("WATCH was lost to a disconnect; aborting transaction without sending it");
            fail_all(unit, &ClientError::WatchLost);
            return Ok(());
        }

        let mut entries = unit.into_iter();
        while let Some(mut pending) = entries.next() {
            let command = &pending.command;
            if self.subscriber_mode() && !command.allowed_in_subscriber_mode() {
                pending.fail(ClientError::SubscriberMode);
                continue;
            }
            if let Some(op) = command.subscription_op() {
                pending.acks_remaining = self.expected_acks(op, command);
            }
            match command.name() {
                "WATCH" => self.watch_lost = false,
                "QUIT" => self.closing = true,
                _ => {}
            }

            let written = framed.feed(&pending.command).await;
            self.in_flight.push_back(pending);
            if let Err(e) = written {
                // Unwritten entries are settled by the teardown like in-flight ones.
                self.in_flight.extend(entries);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Number of acknowledgements a subscription command produces.
    fn expected_acks(&self, op: SubscriptionOp, command: &Command) -> usize {
        let targets = command.subscription_targets().len();
        if targets > 0 {
            return targets;
        }
        let kind = if op.is_pattern() {
            SubscriptionKind::Pattern
        } else {
            SubscriptionKind::Channel
        };
        self.hub.subscriptions().len(kind).max(1)
    }

    /// Handles one decoded frame. Returns an exit if the socket must go.
    fn on_frame(&mut self, frame: RespFrame) -> Option<Exit> {
        let is_push = matches!(frame, RespFrame::Push(_));
        let awaiting_ack = self.in_flight.front().is_some_and(|p| p.acks_remaining > 0);
        let out_of_band = is_push || awaiting_ack || self.subscriber_mode();

        if out_of_band && let Some(message) = PubSubMessage::from_frame(&frame) {
            self.hub.dispatch(message);
            return None;
        }

        // Anywhere else an ack-shaped array is the reply to a regular command.
        if out_of_band && let Some(ack) = parse_ack(&frame) {
            self.apply_ack(&ack.kind, ack.name.as_deref(), ack.count);
            let head_op = self
                .in_flight
                .front()
                .and_then(|p| p.command.subscription_op());
            if awaiting_ack
                && let Some(op) = head_op
                && op.ack_kind() == ack.kind.as_ref()
                && let Some(head) = self.in_flight.front_mut()
            {
                head.acks_remaining -= 1;
                let unsubscribed_all = ack.count == 0
                    && head.command.subscription_targets().is_empty()
                    && matches!(op, SubscriptionOp::Unsubscribe | SubscriptionOp::PUnsubscribe);
                if (head.acks_remaining == 0 || unsubscribed_all)
                    && let Some(pending) = self.in_flight.pop_front()
                {
                    pending.responder.resolve(Ok(frame));
                }
            }
            return None;
        }

        let Some(pending) = self.in_flight.pop_front() else {
            warn!("Discarding reply with no pending command: {frame:?}");
            return None;
        };
        self.track_transaction_state(&pending.command, &frame);

        if let Responder::Internal(kind) = pending.responder {
            if kind == InternalKind::ReadyCheck {
                self.on_ready_check_reply(&frame);
            }
            return None;
        }

        if let RespFrame::Error(err) = &frame {
            match self.options.reconnect.on_server_error(err) {
                ReconnectAction::No => {}
                ReconnectAction::Reconnect => {
                    warn!("Reconnecting to {} after error: {err}", self.options.endpoint);
                    pending.responder.resolve(Ok(frame));
                    self.reconnect_now = true;
                    return Some(self.teardown(None));
                }
                ReconnectAction::ReconnectAndResend => {
                    warn!(
                        "Reconnecting to {} and resending {} after error: {err}",
                        self.options.endpoint,
                        pending.command.name()
                    );
                    self.resend = Some(pending);
                    self.reconnect_now = true;
                    return Some(self.teardown(None));
                }
            }
        }

        pending.responder.resolve(Ok(frame));
        None
    }

    fn apply_ack(&self, kind: &[u8], name: Option<&[u8]>, count: i64) {
        self.hub.update_subscriptions(|set| {
            match (kind, name) {
                (b"subscribe", Some(name)) => {
                    set.add(SubscriptionKind::Channel, name.to_vec().into());
                }
                (b"psubscribe", Some(name)) => {
                    set.add(SubscriptionKind::Pattern, name.to_vec().into());
                }
                (b"unsubscribe", Some(name)) => {
                    set.remove(SubscriptionKind::Channel, name);
                }
                (b"punsubscribe", Some(name)) => {
                    set.remove(SubscriptionKind::Pattern, name);
                }
                _ => {}
            }
            if count == 0 {
                set.clear();
            }
        });
    }

    fn track_transaction_state(&mut self, command: &Command, reply: &RespFrame) {
        match command.name() {
            "WATCH" if !matches!(reply, RespFrame::Error(_)) => self.watching = true,
            "UNWATCH" | "EXEC" | "DISCARD" => {
                self.watching = false;
                self.watch_lost = false;
            }
            _ => {}
        }
    }

    fn on_ready_check_reply(&mut self, frame: &RespFrame) {
        let info = frame
            .as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        match handshake::loading_wait(&info) {
            Some(wait) => {
                info!("Server is still loading; checking again in {wait:?}");
                self.next_ready_check = Some(Instant::now() + wait);
            }
            None if !self.ready => self.become_ready(),
            None => {}
        }
    }

    /// Settles the in-flight queue after the socket is gone.
    fn teardown(&mut self, error: Option<ClientError>) -> Exit {
        if let Some(e) = error {
            warn!("Connection to {} lost: {e}", self.options.endpoint);
            self.lifecycle.emit(ConnectionEvent::Error(e));
        }
        self.lifecycle.emit(ConnectionEvent::Close);
        self.ready = false;
        self.next_ready_check = None;

        let mut replay = Vec::new();
        for pending in self.in_flight.drain(..) {
            if pending.responder.is_internal() {
                continue;
            }
            if self.closing
                || !self.options.auto_resend_unfulfilled_commands
                || pending.fails_on_disconnect()
            {
                pending.fail(ClientError::ConnectionClosed);
            } else {
                replay.push(pending);
            }
        }
        if !replay.is_empty() {
            debug!("Requeueing {} unfulfilled command(s)", replay.len());
            self.offline.requeue_front(replay);
        }

        if self.watching {
            self.watching = false;
            self.watch_lost = true;
        }
        if !self.options.auto_resubscribe {
            self.hub.update_subscriptions(|set| set.clear());
        }

        if self.closing {
            Exit::Shutdown
        } else {
            Exit::Reconnect
        }
    }

    /// Waits out the backoff delay. Returns `false` when the connection should end.
    async fn schedule_reconnect(&mut self) -> bool {
        self.offline.count_retry(self.options.max_retries_per_request);
        self.attempt += 1;

        let delay = if std::mem::take(&mut self.reconnect_now) {
            Some(Duration::ZERO)
        } else {
            self.options.reconnect.next_delay(self.attempt)
        };
        let Some(delay) = delay else {
            info!(
                "Giving up on {} after {} attempt(s)",
                self.options.endpoint, self.attempt
            );
            return false;
        };

        info!(
            "Will try to reconnect to {} in {delay:?} (attempt {})",
            self.options.endpoint, self.attempt
        );
        self.lifecycle.emit(ConnectionEvent::Reconnecting {
            attempt: self.attempt,
            delay,
        });

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                request = self.rx.recv() => match request {
                    None => {
                        self.closing = true;
                        return false;
                    }
                    Some(Request::Disconnect { reconnect: false }) => {
                        self.closing = true;
                        return false;
                    }
                    Some(Request::Disconnect { reconnect: true } | Request::Connect) => return true,
                    Some(request) => self.queue_offline(request),
                },
            }
        }
    }

    /// Fails everything, enters `end`, then answers requests with
    /// `ConnectionEnded` until a `connect()` or until every handle is gone.
    /// Returns `true` if the connection should start over.
    async fn end(&mut self) -> bool {
        for pending in self.in_flight.drain(..) {
            pending.fail(ClientError::ConnectionEnded);
        }
        self.offline.fail_all(&ClientError::ConnectionEnded);
        self.watching = false;
        self.watch_lost = false;
        self.lifecycle.emit(ConnectionEvent::End);
        info!("Connection to {} ended", self.options.endpoint);

        while let Some(request) = self.rx.recv().await {
            match request {
                Request::Command(pending) => pending.fail(ClientError::ConnectionEnded),
                Request::Batch(entries) => fail_all(entries, &ClientError::ConnectionEnded),
                Request::UpdateCredentials(creds) => self.credentials = creds,
                Request::Connect => return true,
                Request::Disconnect { .. } => {}
            }
        }
        false
    }
}

/// Flushes everything written with `feed`.
async fn flush(framed: &mut NodeFramed) -> Result<(), ClientError> {
    SinkExt::<&Command>::flush(framed).await
}

async fn sleep_until_check(at: Option<Instant>) {
    tokio::time::sleep_until(at.unwrap_or_else(Instant::now)).await
}

fn fail_all(entries: Vec<Pending>, error: &ClientError) {
    for pending in entries {
        pending.fail(error.clone());
    }
}
