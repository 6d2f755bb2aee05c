// src/core/cluster/router.rs

//! The cluster client: routes every command to the node serving its slot and
//! follows the cluster's redirections.
//!
//! The slot table is an immutable snapshot behind an `RwLock<Arc<_>>`. A MOVED
//! reply swaps in a copy with that one slot reassigned and schedules a full
//! refresh in the background; concurrent refresh requests collapse into one.
//! ASK redirections are one-shot and leave the table untouched. TRYAGAIN,
//! CLUSTERDOWN and connection failures are retried after a growing delay.
//! Every request gives up after `max_redirections` retries.
//!
//! Node connections live in a pool keyed by address. A node missing from two
//! consecutive refreshes is disconnected and dropped.

use super::slot::{command_slot, slot_of_keys};
use super::slot_table::{NodeRole, SlotTable};
use super::subscriber::ClusterSubscriber;
use super::{ReplicaSelection, ScaleReads};
use crate::connection::queue::FrameResult;
use crate::connection::{Connection, ConnectionOptions, Endpoint};
use crate::core::commands::{Command, ToArg, cmd};
use crate::core::errors::{ClientError, ServerError, ServerErrorKind};
use crate::core::pipeline::{BatchExecutor, Pipeline, Transaction};
use crate::core::protocol::{FromRespValue, RespFrame, RespValue};
use crate::core::pubsub::{MessageFilter, MessageStream, PubSubHub, parse_ack};
use crate::core::reconnect::ReconnectPolicy;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Consecutive refreshes a node may be absent from before it is dropped.
const EVICT_AFTER_MISSES: u32 = 2;

/// The retry delay doubles per attempt up to this many doublings.
const MAX_BACKOFF_DOUBLINGS: u32 = 5;

#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Nodes used to discover the cluster.
    pub seeds: Vec<Endpoint>,
    /// Template for every node connection; the endpoint is replaced per node.
    pub node: ConnectionOptions,
    pub scale_reads: ScaleReads,
    pub replica_selection: ReplicaSelection,
    pub max_redirections: usize,
    pub retry_delay_on_failover: Duration,
    pub retry_delay_on_cluster_down: Duration,
    pub retry_delay_on_try_again: Duration,
    /// Bound on each CLUSTER SLOTS / CLUSTER NODES attempt.
    pub slots_refresh_timeout: Duration,
    /// Refresh the table periodically, in addition to redirect-driven refreshes.
    pub slots_refresh_interval: Option<Duration>,
    pub key_prefix: Option<Bytes>,
    /// Retries of the initial discovery.
    pub init_retry: ReconnectPolicy,
}

impl ClusterOptions {
    pub fn new(seeds: Vec<Endpoint>) -> Self {
        let node = ConnectionOptions::new(
            seeds
                .first()
                .cloned()
                .unwrap_or_else(|| Endpoint::tcp("127.0.0.1", 6379)),
        );
        Self {
            seeds,
            node,
            scale_reads: ScaleReads::Master,
            replica_selection: ReplicaSelection::RoundRobin,
            max_redirections: 16,
            retry_delay_on_failover: Duration::from_millis(100),
            retry_delay_on_cluster_down: Duration::from_millis(100),
            retry_delay_on_try_again: Duration::from_millis(100),
            slots_refresh_timeout: Duration::from_secs(1),
            slots_refresh_interval: None,
            key_prefix: None,
            init_retry: ReconnectPolicy::never(),
        }
    }

    pub fn with_node_options(mut self, node: ConnectionOptions) -> Self {
        self.node = node;
        self
    }
}

#[derive(Debug)]
struct NodeEntry {
    conn: Connection,
    misses: u32,
}

#[derive(Debug)]
struct ClusterInner {
    options: ClusterOptions,
    table: RwLock<Arc<SlotTable>>,
    nodes: DashMap<Endpoint, NodeEntry>,
    refreshing: AtomicBool,
    closed: AtomicBool,
    round_robin: AtomicUsize,
    subscriber: ClusterSubscriber,
}

/// A handle to a cluster. Clones share the slot table and node pool.
#[derive(Debug, Clone)]
pub struct ClusterClient {
    inner: Arc<ClusterInner>,
}

impl ClusterClient {
    /// Discovers the cluster from its seeds and returns once a slot table is
    /// loaded.
    pub async fn connect(options: ClusterOptions) -> Result<Self, ClientError> {
        if options.seeds.is_empty() {
            return Err(ClientError::InvalidArgument(
                "at least one seed node is required".into(),
            ));
        }
        let client = Self {
            inner: Arc::new(ClusterInner {
                options,
                table: RwLock::new(Arc::new(SlotTable::empty())),
                nodes: DashMap::new(),
                refreshing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                round_robin: AtomicUsize::new(0),
                subscriber: ClusterSubscriber::default(),
            }),
        };

        let mut attempt = 0;
        while let Err(e) = client.refresh_slots().await {
            attempt += 1;
            match client.inner.options.init_retry.next_delay(attempt) {
                Some(delay) => {
                    warn!("Cluster discovery failed ({e}); retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    client.disconnect();
                    return Err(e);
                }
            }
        }

        client.spawn_periodic_refresh();
        Ok(client)
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.inner.options
    }

    /// The current slot table snapshot.
    pub fn slot_table(&self) -> Arc<SlotTable> {
        self.inner.table.read().clone()
    }

    /// The master currently serving `key`.
    pub fn node_for_key(&self, key: &[u8]) -> Option<Endpoint> {
        self.slot_table()
            .master_for_slot(super::slot::get_slot(key))
            .cloned()
    }

    /// Connections to every known node with the given role.
    pub fn nodes(&self, role: NodeRole) -> Vec<Connection> {
        self.slot_table()
            .nodes(role)
            .iter()
            .map(|endpoint| self.connection_for(endpoint))
            .collect()
    }

    /// Sends a command to the node owning its keys and returns the
    /// transformed reply.
    pub async fn send(&self, command: Command) -> Result<RespValue, ClientError> {
        let command = self.prefixed(command);
        let transform = command.transform();
        transform.apply(self.route(command).await?)
    }

    pub async fn query<T: FromRespValue>(&self, command: Command) -> Result<T, ClientError> {
        T::from_resp(self.send(command).await?)
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(Arc::new(self.clone()))
    }

    /// A MULTI/EXEC block. All keys must hash to one slot.
    pub fn transaction(&self) -> Transaction {
        Transaction::new(Arc::new(self.clone()))
    }

    /// Closes every node connection. Pending commands fail.
    pub fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.subscriber.disconnect();
        for entry in self.inner.nodes.iter() {
            entry.conn.disconnect(false);
        }
        self.inner.nodes.clear();
    }

    /// Sends QUIT to every node, then drops them.
    pub async fn quit(&self) -> Result<(), ClientError> {
        let conns: Vec<Connection> = self.inner.nodes.iter().map(|e| e.conn.clone()).collect();
        for conn in conns {
            if let Err(e) = conn.quit().await {
                debug!("QUIT to {} failed: {e}", conn.endpoint());
            }
        }
        self.disconnect();
        Ok(())
    }

    fn prefixed(&self, command: Command) -> Command {
        match &self.inner.options.key_prefix {
            Some(prefix) => command.with_key_prefix(prefix),
            None => command,
        }
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ClientError::ConnectionEnded);
        }
        Ok(())
    }

    /// Sends one command, following redirections. Error replies come back as
    /// `Err(ClientError::Server)`.
    async fn route(&self, command: Command) -> Result<RespFrame, ClientError> {
        let slot = command_slot(&command)?;
        let read_only = command.is_read_only();
        let mut target: Option<Endpoint> = None;
        let mut asking = false;
        let mut retries = 0;

        loop {
            self.ensure_open()?;
            let endpoint = match target.take() {
                Some(endpoint) => endpoint,
                None => self.pick_node(slot, read_only)?,
            };
            let conn = self.connection_for(&endpoint);

            let result = if std::mem::take(&mut asking) {
                conn.send_batch(vec![cmd("ASKING"), command.clone()], false)
                    .await
                    .and_then(|mut replies| {
                        replies.pop().unwrap_or_else(|| {
                            Err(ClientError::UnexpectedReply("missing reply after ASKING".into()))
                        })
                    })
            } else {
                conn.send_raw(command.clone()).await
            };

            let err = match result {
                Ok(RespFrame::Error(e)) => ClientError::Server(e),
                Ok(frame) => return Ok(frame),
                Err(e) => e,
            };

            retries += 1;
            if retries > self.inner.options.max_redirections {
                return Err(ClientError::RoutingExhausted {
                    attempts: retries,
                    last: Box::new(err),
                });
            }

            let kind = err.server_error().map(|e| e.kind.clone());
            match kind {
                Some(ServerErrorKind::Moved { slot: moved, addr }) => {
                    let Some(to) = Endpoint::parse_addr(&addr) else {
                        return Err(err);
                    };
                    debug!("Slot {moved} moved to {to}");
                    self.apply_moved(moved, to.clone());
                    self.schedule_refresh();
                    target = Some(to);
                }
                Some(ServerErrorKind::Ask { slot: asked, addr }) => {
                    let Some(to) = Endpoint::parse_addr(&addr) else {
                        return Err(err);
                    };
                    debug!("Slot {asked} is migrating; asking {to}");
                    target = Some(to);
                    asking = true;
                }
                Some(ServerErrorKind::TryAgain) => {
                    self.retry_sleep(self.inner.options.retry_delay_on_try_again, retries)
                        .await;
                }
                Some(ServerErrorKind::ClusterDown) => {
                    self.retry_sleep(self.inner.options.retry_delay_on_cluster_down, retries)
                        .await;
                    self.schedule_refresh();
                }
                None if is_failover_error(&err) => {
                    debug!("{endpoint} unreachable ({err}); retrying");
                    self.retry_sleep(self.inner.options.retry_delay_on_failover, retries)
                        .await;
                    self.schedule_refresh();
                }
                _ => return Err(err),
            }
        }
    }

    async fn retry_sleep(&self, base: Duration, retries: usize) {
        let doublings = (retries.saturating_sub(1) as u32).min(MAX_BACKOFF_DOUBLINGS);
        tokio::time::sleep(base.saturating_mul(1 << doublings)).await;
    }

    fn apply_moved(&self, slot: u16, master: Endpoint) {
        let mut table = self.inner.table.write();
        if table.master_for_slot(slot) != Some(&master) {
            *table = Arc::new(table.with_slot_moved(slot, master));
        }
    }

    /// Chooses the node for a slot. Keyless commands and unknown slots go to a
    /// random master.
    fn pick_node(&self, slot: Option<u16>, read_only: bool) -> Result<Endpoint, ClientError> {
        let table = self.slot_table();
        let Some(slot) = slot else {
            return self.random_node(&table);
        };
        let Some(shard) = table.shard_for_slot(slot) else {
            debug!("No owner known for slot {slot}");
            self.schedule_refresh();
            return self.random_node(&table);
        };
        if !read_only {
            return Ok(shard.master.clone());
        }

        let candidates: Vec<&Endpoint> = match self.inner.options.scale_reads {
            ScaleReads::Master => return Ok(shard.master.clone()),
            ScaleReads::Slave if shard.replicas.is_empty() => return Ok(shard.master.clone()),
            ScaleReads::Slave => shard.replicas.iter().collect(),
            ScaleReads::All => std::iter::once(&shard.master)
                .chain(shard.replicas.iter())
                .collect(),
        };
        let index = match self.inner.options.replica_selection {
            ReplicaSelection::First => 0,
            ReplicaSelection::RoundRobin => {
                self.inner.round_robin.fetch_add(1, Ordering::Relaxed) % candidates.len()
            }
        };
        Ok(candidates[index].clone())
    }

    fn random_node(&self, table: &SlotTable) -> Result<Endpoint, ClientError> {
        let mut candidates = table.nodes(NodeRole::Master);
        if candidates.is_empty() {
            candidates = self.inner.options.seeds.clone();
        }
        candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| ClientError::ClusterInit("no known cluster nodes".into()))
    }

    /// Pooled node connections do not reconnect or resend on their own. A
    /// lost node fails its commands at once and the router retries them
    /// against a refreshed table.
    fn node_options(&self, endpoint: &Endpoint, read_only: bool) -> ConnectionOptions {
        let mut options = self.inner.options.node.for_endpoint(endpoint.clone());
        options.key_prefix = None;
        options.lazy_connect = false;
        options.read_only = read_only;
        options.reconnect = options.reconnect.without_retries();
        options.auto_resend_unfulfilled_commands = false;
        options
    }

    /// The pooled connection to `endpoint`, opening one if needed. Ended
    /// connections are replaced.
    fn connection_for(&self, endpoint: &Endpoint) -> Connection {
        let read_only = self.inner.options.scale_reads != ScaleReads::Master
            && self.slot_table().is_replica(endpoint);
        let mut entry = self
            .inner
            .nodes
            .entry(endpoint.clone())
            .or_insert_with(|| NodeEntry {
                conn: Connection::new(self.node_options(endpoint, read_only)),
                misses: 0,
            });
        if entry.conn.state().is_terminal() {
            debug!("Replacing ended connection to {endpoint}");
            entry.conn = Connection::new(self.node_options(endpoint, read_only));
        }
        entry.conn.clone()
    }

    /// Starts a background refresh unless one is already running.
    fn schedule_refresh(&self) {
        if self
            .inner
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.refresh_slots().await {
                warn!("Background slot refresh failed: {e}");
            }
            client.inner.refreshing.store(false, Ordering::Release);
        });
    }

    fn spawn_periodic_refresh(&self) {
        let Some(period) = self.inner.options.slots_refresh_interval else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }
                ClusterClient { inner }.schedule_refresh();
            }
        });
    }

    /// Reloads the slot table from the first node that answers: known
    /// masters, then replicas and pooled nodes, then the seeds.
    pub async fn refresh_slots(&self) -> Result<(), ClientError> {
        self.ensure_open()?;
        let table = self.slot_table();
        let mut candidates = table.nodes(NodeRole::Master);
        candidates.shuffle(&mut rand::thread_rng());
        candidates.extend(table.nodes(NodeRole::Replica));
        candidates.extend(self.inner.nodes.iter().map(|e| e.key().clone()));
        candidates.extend(self.inner.options.seeds.iter().cloned());
        let mut seen = std::collections::HashSet::new();
        candidates.retain(|e| seen.insert(e.clone()));

        let mut last_error = ClientError::ClusterInit("no known cluster nodes".into());
        for endpoint in candidates {
            let conn = self.connection_for(&endpoint);
            let attempt = tokio::time::timeout(
                self.inner.options.slots_refresh_timeout,
                load_slot_table(&conn, &endpoint),
            )
            .await;
            match attempt {
                Ok(Ok(table)) => {
                    self.install(table);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    debug!("Slot refresh via {endpoint} failed: {e}");
                    last_error = e;
                }
                Err(_) => {
                    debug!("Slot refresh via {endpoint} timed out");
                    last_error = ClientError::CommandTimeout;
                }
            }
        }
        Err(ClientError::ClusterInit(format!(
            "no node returned a slot table; last error: {last_error}"
        )))
    }

    fn install(&self, table: SlotTable) {
        let table = Arc::new(table);
        *self.inner.table.write() = table.clone();
        info!(
            "Slot table loaded: {} shard(s), {} slot(s) covered",
            table.shards().len(),
            table.covered_slots()
        );

        let mut evicted = Vec::new();
        self.inner.nodes.retain(|endpoint, entry| {
            if table.contains_node(endpoint) {
                entry.misses = 0;
                return true;
            }
            entry.misses += 1;
            if entry.misses < EVICT_AFTER_MISSES {
                return true;
            }
            info!("Node {endpoint} left the cluster; disconnecting");
            entry.conn.disconnect(false);
            evicted.push(endpoint.clone());
            false
        });

        if !evicted.is_empty()
            && let Err(e) = self
                .inner
                .subscriber
                .on_evicted(&evicted, |hub| self.open_subscriber(hub))
        {
            warn!("Could not move the subscriber connection: {e}");
        }
    }

    /// The subscriber keeps the template's reconnect policy; it only moves
    /// once its node is evicted.
    fn open_subscriber(&self, hub: Arc<PubSubHub>) -> Result<Connection, ClientError> {
        let endpoint = self.random_node(&self.slot_table())?;
        let mut options = self.node_options(&endpoint, false);
        options.reconnect = self.inner.options.node.reconnect.clone();
        options.auto_resend_unfulfilled_commands =
            self.inner.options.node.auto_resend_unfulfilled_commands;
        options.auto_resubscribe = true;
        // Pooling the node makes it subject to eviction.
        self.connection_for(&endpoint);
        debug!("Opening subscriber connection to {endpoint}");
        Ok(Connection::with_hub(options, hub))
    }

    /// The node currently carrying this client's subscriptions.
    pub fn subscriber_node(&self) -> Option<Endpoint> {
        self.inner.subscriber.endpoint()
    }

    async fn subscription_command(&self, command: Command) -> Result<i64, ClientError> {
        self.ensure_open()?;
        let conn = self
            .inner
            .subscriber
            .connection(|hub| self.open_subscriber(hub))?;
        let frame = conn.send_raw(command).await?.into_result()?;
        Ok(parse_ack(&frame).map_or(0, |ack| ack.count))
    }

    /// Subscribes to channels. Returns the subscription count reported by the
    /// last acknowledgement.
    pub async fn subscribe<I, T>(&self, channels: I) -> Result<i64, ClientError>
    where
        I: IntoIterator<Item = T>,
        T: ToArg,
    {
        self.subscription_command(cmd("SUBSCRIBE").args(channels)).await
    }

    pub async fn psubscribe<I, T>(&self, patterns: I) -> Result<i64, ClientError>
    where
        I: IntoIterator<Item = T>,
        T: ToArg,
    {
        self.subscription_command(cmd("PSUBSCRIBE").args(patterns)).await
    }

    /// Unsubscribes from the given channels, or from all when empty.
    pub async fn unsubscribe<I, T>(&self, channels: I) -> Result<i64, ClientError>
    where
        I: IntoIterator<Item = T>,
        T: ToArg,
    {
        self.subscription_command(cmd("UNSUBSCRIBE").args(channels)).await
    }

    pub async fn punsubscribe<I, T>(&self, patterns: I) -> Result<i64, ClientError>
    where
        I: IntoIterator<Item = T>,
        T: ToArg,
    {
        self.subscription_command(cmd("PUNSUBSCRIBE").args(patterns)).await
    }

    /// Registers a listener for messages received on the subscriber connection.
    pub fn messages(&self, filter: MessageFilter) -> MessageStream {
        self.inner.subscriber.hub().listen(filter)
    }
}

/// Asks one node for the slot layout, falling back to CLUSTER NODES when
/// CLUSTER SLOTS is rejected.
async fn load_slot_table(conn: &Connection, endpoint: &Endpoint) -> Result<SlotTable, ClientError> {
    match conn.send_raw(cmd("CLUSTER").arg("SLOTS")).await? {
        RespFrame::Error(e) => {
            debug!("CLUSTER SLOTS rejected by {endpoint} ({e}); trying CLUSTER NODES");
            let reply = conn.send_raw(cmd("CLUSTER").arg("NODES")).await?.into_result()?;
            let text = reply.as_bytes().ok_or_else(|| {
                ClientError::UnexpectedReply("CLUSTER NODES did not return a string".into())
            })?;
            SlotTable::from_cluster_nodes(&String::from_utf8_lossy(text), endpoint)
        }
        frame => SlotTable::from_cluster_slots(&frame, endpoint),
    }
}

/// Errors after which a request may be sent again to a freshly picked node.
fn is_failover_error(err: &ClientError) -> bool {
    err.is_connection_error() || matches!(err, ClientError::MaxRetriesPerRequest(_))
}

/// A MOVED, ASK, TRYAGAIN or CLUSTERDOWN reply.
fn retryable_of(result: &FrameResult) -> Option<&ServerError> {
    match result {
        Ok(RespFrame::Error(e))
            if e.is_redirect()
                || matches!(e.kind, ServerErrorKind::TryAgain | ServerErrorKind::ClusterDown) =>
        {
            Some(e)
        }
        _ => None,
    }
}

fn same_outcome(a: &ServerErrorKind, b: &ServerErrorKind) -> bool {
    match (a, b) {
        (ServerErrorKind::Moved { addr: x, .. }, ServerErrorKind::Moved { addr: y, .. })
        | (ServerErrorKind::Ask { addr: x, .. }, ServerErrorKind::Ask { addr: y, .. }) => x == y,
        (ServerErrorKind::TryAgain, ServerErrorKind::TryAgain)
        | (ServerErrorKind::ClusterDown, ServerErrorKind::ClusterDown) => true,
        _ => false,
    }
}

/// The reply that sends a whole batch around again, if any. A pipeline is
/// retried only when every reply calls for the same thing. A transaction is
/// retried on the first such reply among its queued commands, since EXEC then
/// discards the block.
fn batch_retry(results: &[FrameResult], transaction: bool) -> Option<ServerError> {
    if transaction {
        return results.iter().find_map(retryable_of).cloned();
    }
    let first = retryable_of(results.first()?)?;
    results
        .iter()
        .all(|r| retryable_of(r).is_some_and(|e| same_outcome(&e.kind, &first.kind)))
        .then(|| first.clone())
}

#[async_trait]
impl BatchExecutor for ClusterClient {
    async fn execute_batch(
        &self,
        commands: Vec<Command>,
        transaction: bool,
    ) -> Result<Vec<FrameResult>, ClientError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let commands: Vec<Command> = commands.into_iter().map(|c| self.prefixed(c)).collect();
        let slot = slot_of_keys(
            commands
                .iter()
                .flat_map(|c| c.keys())
                .map(|k| k.as_ref()),
        )?;
        let read_only = !transaction && commands.iter().all(Command::is_read_only);

        let mut target: Option<Endpoint> = None;
        let mut asking = false;
        let mut retries = 0;
        loop {
            self.ensure_open()?;
            let endpoint = match target.take() {
                Some(endpoint) => endpoint,
                None => self.pick_node(slot, read_only)?,
            };
            let conn = self.connection_for(&endpoint);

            let was_asking = std::mem::take(&mut asking);
            let batch = match (was_asking, transaction) {
                (false, _) => commands.clone(),
                // One ASKING covers a whole MULTI block.
                (true, true) => std::iter::once(cmd("ASKING"))
                    .chain(commands.iter().cloned())
                    .collect(),
                (true, false) => commands
                    .iter()
                    .flat_map(|c| [cmd("ASKING"), c.clone()])
                    .collect(),
            };

            let results = match conn.send_batch(batch, transaction).await {
                Ok(results) => match (was_asking, transaction) {
                    (false, _) => results,
                    (true, true) => results.into_iter().skip(1).collect(),
                    (true, false) => results.into_iter().skip(1).step_by(2).collect(),
                },
                Err(e) if !transaction && is_failover_error(&e) => {
                    retries += 1;
                    if retries > self.inner.options.max_redirections {
                        return Err(ClientError::RoutingExhausted {
                            attempts: retries,
                            last: Box::new(e),
                        });
                    }
                    debug!("{endpoint} unreachable ({e}); retrying pipeline");
                    self.retry_sleep(self.inner.options.retry_delay_on_failover, retries)
                        .await;
                    self.schedule_refresh();
                    continue;
                }
                Err(e) => return Err(e),
            };

            let Some(retry) = batch_retry(&results, transaction) else {
                return Ok(results);
            };
            retries += 1;
            if retries > self.inner.options.max_redirections {
                return Err(ClientError::RoutingExhausted {
                    attempts: retries,
                    last: Box::new(ClientError::Server(retry)),
                });
            }
            match retry.kind {
                ServerErrorKind::Moved { slot: moved, addr } => {
                    let Some(to) = Endpoint::parse_addr(&addr) else {
                        return Ok(results);
                    };
                    debug!("Slot {moved} moved to {to}; resending batch");
                    self.apply_moved(moved, to.clone());
                    self.schedule_refresh();
                    target = Some(to);
                }
                ServerErrorKind::Ask { addr, .. } => {
                    let Some(to) = Endpoint::parse_addr(&addr) else {
                        return Ok(results);
                    };
                    target = Some(to);
                    asking = true;
                }
                ServerErrorKind::TryAgain => {
                    self.retry_sleep(self.inner.options.retry_delay_on_try_again, retries)
                        .await;
                }
                ServerErrorKind::ClusterDown => {
                    self.retry_sleep(self.inner.options.retry_delay_on_cluster_down, retries)
                        .await;
                    self.schedule_refresh();
                }
                _ => return Ok(results),
            }
        }
    }
}
