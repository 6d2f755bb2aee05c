// src/core/pubsub/subscriptions.rs

//! The set of channels and patterns a connection is subscribed to.

use bytes::Bytes;
use indexmap::IndexSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Channel,
    Pattern,
}

/// Channels and patterns in subscription order, replayed after a reconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    channels: IndexSet<Bytes>,
    patterns: IndexSet<Bytes>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Default::default()
    }

    fn set_mut(&mut self, kind: SubscriptionKind) -> &mut IndexSet<Bytes> {
        match kind {
            SubscriptionKind::Channel => &mut self.channels,
            SubscriptionKind::Pattern => &mut self.patterns,
        }
    }

    pub fn add(&mut self, kind: SubscriptionKind, name: Bytes) -> bool {
        self.set_mut(kind).insert(name)
    }

    pub fn remove(&mut self, kind: SubscriptionKind, name: &[u8]) -> bool {
        self.set_mut(kind).shift_remove(name)
    }

    pub fn clear_kind(&mut self, kind: SubscriptionKind) {
        self.set_mut(kind).clear();
    }

    pub fn clear(&mut self) {
        self.channels.clear();
        self.patterns.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty()
    }

    pub fn len(&self, kind: SubscriptionKind) -> usize {
        match kind {
            SubscriptionKind::Channel => self.channels.len(),
            SubscriptionKind::Pattern => self.patterns.len(),
        }
    }

    pub fn channels(&self) -> impl Iterator<Item = &Bytes> {
        self.channels.iter()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &Bytes> {
        self.patterns.iter()
    }

    pub fn contains(&self, kind: SubscriptionKind, name: &[u8]) -> bool {
        match kind {
            SubscriptionKind::Channel => self.channels.contains(name),
            SubscriptionKind::Pattern => self.patterns.contains(name),
        }
    }
}
