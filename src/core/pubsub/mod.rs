// src/core/pubsub/mod.rs

//! Client-side publish-subscribe support.
//!
//! Published messages arrive on the same socket as command replies but are not
//! replies. The connection actor recognizes them and hands them to the
//! `PubSubHub`, which fans them out to every registered listener whose filter
//! matches. Listeners receive messages on unbounded, order-preserving streams.

pub mod subscriptions;

pub use subscriptions::{SubscriptionKind, SubscriptionSet};

use crate::core::protocol::{RespFrame, RespValue};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// A stream of published messages for one listener.
pub type MessageStream = UnboundedReceiverStream<PubSubMessage>;

/// A message delivered out of band.
#[derive(Debug, Clone, PartialEq)]
pub enum PubSubMessage {
    /// A `message` (or sharded `smessage`) on a subscribed channel.
    Message { channel: Bytes, payload: Bytes },
    /// A `pmessage` matched by a subscribed pattern.
    PMessage {
        pattern: Bytes,
        channel: Bytes,
        payload: Bytes,
    },
    /// Any other RESP3 push, e.g. client-side caching invalidations.
    Push { kind: String, data: Vec<RespValue> },
}

impl PubSubMessage {
    pub fn channel(&self) -> Option<&Bytes> {
        match self {
            PubSubMessage::Message { channel, .. } | PubSubMessage::PMessage { channel, .. } => {
                Some(channel)
            }
            PubSubMessage::Push { .. } => None,
        }
    }

    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            PubSubMessage::Message { payload, .. } | PubSubMessage::PMessage { payload, .. } => {
                Some(payload)
            }
            PubSubMessage::Push { .. } => None,
        }
    }

    pub fn pattern(&self) -> Option<&Bytes> {
        match self {
            PubSubMessage::PMessage { pattern, .. } => Some(pattern),
            _ => None,
        }
    }

    /// Recognizes a published message in an array or push frame.
    ///
    /// Returns `None` for anything that is not a message, including
    /// subscription acknowledgements.
    pub fn from_frame(frame: &RespFrame) -> Option<Self> {
        let (items, is_push) = match frame {
            RespFrame::Array(items) => (items, false),
            RespFrame::Push(items) => (items, true),
            _ => return None,
        };
        let kind = items.first()?.as_bytes()?;
        let bulk = |i: usize| {
            items
                .get(i)
                .and_then(RespFrame::as_bytes)
                .map(Bytes::copy_from_slice)
        };

        match kind {
            b"message" | b"smessage" if items.len() == 3 => Some(PubSubMessage::Message {
                channel: bulk(1)?,
                payload: bulk(2)?,
            }),
            b"pmessage" if items.len() == 4 => Some(PubSubMessage::PMessage {
                pattern: bulk(1)?,
                channel: bulk(2)?,
                payload: bulk(3)?,
            }),
            _ if is_push && parse_ack(frame).is_none() => Some(PubSubMessage::Push {
                kind: String::from_utf8_lossy(kind).into_owned(),
                data: items[1..].iter().cloned().map(RespValue::from).collect(),
            }),
            _ => None,
        }
    }
}

/// A parsed subscription acknowledgement: `[kind, name, count]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub kind: Bytes,
    pub name: Option<Bytes>,
    pub count: i64,
}

/// Recognizes `subscribe`/`psubscribe`/`unsubscribe`/`punsubscribe` acknowledgements.
pub fn parse_ack(frame: &RespFrame) -> Option<Ack> {
    let (RespFrame::Array(items) | RespFrame::Push(items)) = frame else {
        return None;
    };
    if items.len() != 3 {
        return None;
    }
    let kind = items[0].as_bytes()?;
    if !matches!(
        kind,
        b"subscribe" | b"psubscribe" | b"unsubscribe" | b"punsubscribe"
    ) {
        return None;
    }
    let name = match &items[1] {
        RespFrame::Null => None,
        other => Some(Bytes::copy_from_slice(other.as_bytes()?)),
    };
    Some(Ack {
        kind: Bytes::copy_from_slice(kind),
        name,
        count: items[2].as_integer()?,
    })
}

/// Decides which messages a listener receives.
#[derive(Debug, Clone, Default)]
pub enum MessageFilter {
    #[default]
    All,
    /// Only `message`s on these channels.
    Channels(HashSet<Bytes>),
    /// Only `pmessage`s matched by these patterns.
    Patterns(HashSet<Bytes>),
}

impl MessageFilter {
    pub fn channels<I, T>(channels: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        MessageFilter::Channels(channels.into_iter().map(Into::into).collect())
    }

    pub fn patterns<I, T>(patterns: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        MessageFilter::Patterns(patterns.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, message: &PubSubMessage) -> bool {
        match (self, message) {
            (MessageFilter::All, _) => true,
            (MessageFilter::Channels(set), PubSubMessage::Message { channel, .. }) => {
                set.contains(channel)
            }
            (MessageFilter::Patterns(set), PubSubMessage::PMessage { pattern, .. }) => {
                set.contains(pattern)
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
struct Listener {
    filter: MessageFilter,
    tx: mpsc::UnboundedSender<PubSubMessage>,
}

/// Listener registry and subscription set of one subscriber connection.
///
/// The hub outlives any single socket, so a reconnect (or, in cluster mode, a
/// move to another node) keeps both the listeners and the set to replay.
#[derive(Debug, Default)]
pub struct PubSubHub {
    listeners: Mutex<Vec<Listener>>,
    subscriptions: Mutex<SubscriptionSet>,
}

impl PubSubHub {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers a listener and returns its message stream.
    pub fn listen(&self, filter: MessageFilter) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(Listener { filter, tx });
        UnboundedReceiverStream::new(rx)
    }

    /// Delivers a message to every matching listener, pruning dropped ones.
    pub(crate) fn dispatch(&self, message: PubSubMessage) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|listener| {
            if !listener.filter.matches(&message) {
                return !listener.tx.is_closed();
            }
            listener.tx.send(message.clone()).is_ok()
        });
        if listeners.is_empty() {
            debug!("Dropping pub/sub message with no listeners: {message:?}");
        }
    }

    /// A snapshot of the current subscriptions.
    pub fn subscriptions(&self) -> SubscriptionSet {
        self.subscriptions.lock().clone()
    }

    pub(crate) fn update_subscriptions<R>(&self, f: impl FnOnce(&mut SubscriptionSet) -> R) -> R {
        f(&mut self.subscriptions.lock())
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}
