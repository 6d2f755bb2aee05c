// src/core/cluster/slot_table.rs

//! The slot → shard routing table, learned from `CLUSTER SLOTS` (or
//! `CLUSTER NODES` when SLOTS is unavailable).
//!
//! A table is immutable once built. Refreshes build a new table; a MOVED reply
//! produces a copy with one slot reassigned. Readers hold an `Arc` to whichever
//! version they loaded.

use super::slot::NUM_SLOTS;
use crate::connection::Endpoint;
use crate::core::errors::ClientError;
use crate::core::protocol::RespFrame;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// A master and the replicas serving the same slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub master: Endpoint,
    pub replicas: Vec<Endpoint>,
}

/// The role a node plays in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Master,
    Replica,
    /// Matches either role when selecting nodes.
    All,
}

#[derive(Debug, Clone)]
pub struct SlotTable {
    shards: Vec<Shard>,
    /// Index into `shards` for every slot.
    slots: Vec<Option<u32>>,
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::empty()
    }
}

impl SlotTable {
    pub fn empty() -> Self {
        Self {
            shards: Vec::new(),
            slots: vec![None; NUM_SLOTS],
        }
    }

    /// Builds a table from `(start, end, shard)` ranges, inclusive. Shards with
    /// the same master are merged.
    pub fn from_ranges(ranges: impl IntoIterator<Item = (u16, u16, Shard)>) -> Self {
        let mut table = Self::empty();
        let mut by_master: HashMap<Endpoint, u32> = HashMap::new();
        for (start, end, shard) in ranges {
            let index = match by_master.get(&shard.master) {
                Some(&i) => {
                    let existing = &mut table.shards[i as usize];
                    for replica in shard.replicas {
                        if !existing.replicas.contains(&replica) {
                            existing.replicas.push(replica);
                        }
                    }
                    i
                }
                None => {
                    let i = table.shards.len() as u32;
                    by_master.insert(shard.master.clone(), i);
                    table.shards.push(shard);
                    i
                }
            };
            let end = (end as usize).min(NUM_SLOTS - 1);
            for slot in start as usize..=end {
                table.slots[slot] = Some(index);
            }
        }
        table
    }

    /// Parses a `CLUSTER SLOTS` reply. Empty hosts refer to `origin`, the node
    /// that answered.
    pub fn from_cluster_slots(frame: &RespFrame, origin: &Endpoint) -> Result<Self, ClientError> {
        let RespFrame::Array(entries) = frame else {
            return Err(ClientError::UnexpectedReply(format!(
                "CLUSTER SLOTS returned {frame:?}"
            )));
        };

        let mut ranges = Vec::with_capacity(entries.len());
        for entry in entries {
            let RespFrame::Array(parts) = entry else {
                return Err(ClientError::UnexpectedReply(
                    "CLUSTER SLOTS entry is not an array".into(),
                ));
            };
            if parts.len() < 3 {
                return Err(ClientError::UnexpectedReply(
                    "CLUSTER SLOTS entry is too short".into(),
                ));
            }
            let bound = |f: &RespFrame| {
                f.as_integer()
                    .and_then(|n| u16::try_from(n).ok())
                    .ok_or_else(|| ClientError::UnexpectedReply("invalid slot bound".into()))
            };
            let start = bound(&parts[0])?;
            let end = bound(&parts[1])?;

            let mut nodes = parts[2..].iter().filter_map(|n| node_from_slots_entry(n, origin));
            let Some(master) = nodes.next() else {
                continue;
            };
            ranges.push((
                start,
                end,
                Shard {
                    master,
                    replicas: nodes.collect(),
                },
            ));
        }
        if ranges.is_empty() {
            return Err(ClientError::ClusterInit(
                "CLUSTER SLOTS returned no slot ranges".into(),
            ));
        }
        Ok(Self::from_ranges(ranges))
    }

    /// Parses `CLUSTER NODES` output. Failed and address-less nodes are skipped.
    pub fn from_cluster_nodes(text: &str, origin: &Endpoint) -> Result<Self, ClientError> {
        struct Master {
            endpoint: Endpoint,
            ranges: Vec<(u16, u16)>,
        }
        let mut masters: HashMap<&str, Master> = HashMap::new();
        let mut replicas: Vec<(&str, Endpoint)> = Vec::new();

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return Err(ClientError::UnexpectedReply(format!(
                    "malformed CLUSTER NODES line: {line}"
                )));
            }
            let (id, addr, flags, master_id) = (fields[0], fields[1], fields[2], fields[3]);
            if flags
                .split(',')
                .any(|f| matches!(f, "fail" | "noaddr" | "handshake"))
            {
                continue;
            }
            let Some(endpoint) = endpoint_from_nodes_addr(addr, origin) else {
                continue;
            };

            if flags.split(',').any(|f| f == "master") {
                let ranges = fields[8..].iter().filter_map(|s| parse_slot_range(s)).collect();
                masters.insert(id, Master { endpoint, ranges });
            } else if flags.split(',').any(|f| f == "slave") && master_id != "-" {
                replicas.push((master_id, endpoint));
            }
        }

        let mut replicas_of: HashMap<&str, Vec<Endpoint>> = HashMap::new();
        for (master_id, endpoint) in replicas {
            replicas_of.entry(master_id).or_default().push(endpoint);
        }

        let mut ranges = Vec::new();
        for (id, master) in masters {
            let shard = Shard {
                master: master.endpoint,
                replicas: replicas_of.remove(id).unwrap_or_default(),
            };
            for (start, end) in master.ranges {
                ranges.push((start, end, shard.clone()));
            }
        }
        if ranges.is_empty() {
            return Err(ClientError::ClusterInit(
                "CLUSTER NODES lists no slot owners".into(),
            ));
        }
        Ok(Self::from_ranges(ranges))
    }

    pub fn shard_for_slot(&self, slot: u16) -> Option<&Shard> {
        let index = (*self.slots.get(slot as usize)?)?;
        self.shards.get(index as usize)
    }

    pub fn master_for_slot(&self, slot: u16) -> Option<&Endpoint> {
        self.shard_for_slot(slot).map(|s| &s.master)
    }

    /// A copy of the table with `slot` served by `master`.
    pub fn with_slot_moved(&self, slot: u16, master: Endpoint) -> Self {
        let mut table = self.clone();
        let index = match table.shards.iter().position(|s| s.master == master) {
            Some(i) => i as u32,
            None => {
                debug!("MOVED points at unknown node {master}; adding it");
                table.shards.push(Shard {
                    master,
                    replicas: Vec::new(),
                });
                (table.shards.len() - 1) as u32
            }
        };
        if let Some(entry) = table.slots.get_mut(slot as usize) {
            *entry = Some(index);
        }
        table
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Every node in the table with the given role.
    pub fn nodes(&self, role: NodeRole) -> Vec<Endpoint> {
        let mut seen = HashSet::new();
        let mut nodes = Vec::new();
        for shard in &self.shards {
            if matches!(role, NodeRole::Master | NodeRole::All) && seen.insert(&shard.master) {
                nodes.push(shard.master.clone());
            }
            if matches!(role, NodeRole::Replica | NodeRole::All) {
                for replica in &shard.replicas {
                    if seen.insert(replica) {
                        nodes.push(replica.clone());
                    }
                }
            }
        }
        nodes
    }

    pub fn contains_node(&self, endpoint: &Endpoint) -> bool {
        self.shards
            .iter()
            .any(|s| &s.master == endpoint || s.replicas.contains(endpoint))
    }

    pub fn is_replica(&self, endpoint: &Endpoint) -> bool {
        self.shards.iter().any(|s| s.replicas.contains(endpoint))
    }

    /// Number of slots with a known owner.
    pub fn covered_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// `[host, port, id?, ...]`
fn node_from_slots_entry(frame: &RespFrame, origin: &Endpoint) -> Option<Endpoint> {
    let RespFrame::Array(node) = frame else {
        return None;
    };
    let host = std::str::from_utf8(node.first()?.as_bytes()?).ok()?;
    let port = u16::try_from(node.get(1)?.as_integer()?).ok()?;
    if host == "?" {
        return None;
    }
    if host.is_empty() {
        return Some(match origin {
            Endpoint::Tcp { host, .. } => Endpoint::tcp(host.clone(), port),
            other => other.clone(),
        });
    }
    Some(Endpoint::tcp(host, port))
}

/// `ip:port@cport[,hostname]`; an empty ip refers to the answering node.
fn endpoint_from_nodes_addr(addr: &str, origin: &Endpoint) -> Option<Endpoint> {
    let addr = addr.split(',').next()?;
    if addr.starts_with(':') {
        let port = addr[1..].split('@').next()?.parse().ok()?;
        if port == 0 {
            return Some(origin.clone());
        }
        return match origin {
            Endpoint::Tcp { host, .. } => Some(Endpoint::tcp(host.clone(), port)),
            other => Some(other.clone()),
        };
    }
    Endpoint::parse_addr(addr)
}

/// `5461` or `0-5460`. Migration markers (`[5461->-id]`) are skipped.
fn parse_slot_range(s: &str) -> Option<(u16, u16)> {
    if s.starts_with('[') {
        return None;
    }
    match s.split_once('-') {
        Some((start, end)) => Some((start.parse().ok()?, end.parse().ok()?)),
        None => {
            let slot = s.parse().ok()?;
            Some((slot, slot))
        }
    }
}
