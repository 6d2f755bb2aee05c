// src/core/cluster/subscriber.rs

//! The cluster-wide subscriber connection. Pub/sub messages are broadcast to
//! every node, so one dedicated connection to any node suffices. When that
//! node leaves the cluster the connection moves to another node and replays
//! its subscriptions there.

use crate::connection::{Connection, Endpoint};
use crate::core::errors::ClientError;
use crate::core::pubsub::PubSubHub;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Default)]
pub(super) struct ClusterSubscriber {
    hub: Arc<PubSubHub>,
    current: Mutex<Option<Connection>>,
}

impl ClusterSubscriber {
    pub(super) fn hub(&self) -> &Arc<PubSubHub> {
        &self.hub
    }

    pub(super) fn endpoint(&self) -> Option<Endpoint> {
        self.current.lock().as_ref().map(|c| c.endpoint().clone())
    }

    /// The live subscriber connection, opening one with `open` if needed.
    pub(super) fn connection(
        &self,
        open: impl FnOnce(Arc<PubSubHub>) -> Result<Connection, ClientError>,
    ) -> Result<Connection, ClientError> {
        let mut current = self.current.lock();
        if let Some(conn) = current.as_ref()
            && !conn.state().is_terminal()
        {
            return Ok(conn.clone());
        }
        let conn = open(self.hub.clone())?;
        *current = Some(conn.clone());
        Ok(conn)
    }

    /// Moves off an evicted node. Subscriptions are replayed by the new
    /// connection once it is ready, since it shares the hub.
    pub(super) fn on_evicted(
        &self,
        evicted: &[Endpoint],
        open: impl FnOnce(Arc<PubSubHub>) -> Result<Connection, ClientError>,
    ) -> Result<(), ClientError> {
        let mut current = self.current.lock();
        let Some(conn) = current.as_ref() else {
            return Ok(());
        };
        if !evicted.contains(conn.endpoint()) {
            return Ok(());
        }
        info!(
            "Subscriber node {} left the cluster; moving subscriptions",
            conn.endpoint()
        );
        conn.disconnect(false);
        *current = None;
        if !self.hub.subscriptions().is_empty() {
            *current = Some(open(self.hub.clone())?);
        }
        Ok(())
    }

    pub(super) fn disconnect(&self) {
        if let Some(conn) = self.current.lock().take() {
            conn.disconnect(false);
        }
    }
}
