// src/core/cluster/mod.rs

//! Cluster mode: key → slot hashing, the slot → node routing table, the
//! redirect-following router and the cluster-wide subscriber connection.

pub mod router;
pub mod slot;
pub mod slot_table;
mod subscriber;

pub use router::{ClusterClient, ClusterOptions};
pub use slot::{NUM_SLOTS, command_slot, get_slot, hash_tag};
pub use slot_table::{NodeRole, Shard, SlotTable};

use serde::Deserialize;
use strum_macros::{Display, EnumString};

/// Where read-only commands are sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ScaleReads {
    #[default]
    Master,
    /// Replicas, falling back to the master when a shard has none.
    Slave,
    /// The master and its replicas alike.
    All,
}

/// How one node is chosen among several candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReplicaSelection {
    #[default]
    RoundRobin,
    First,
}
