// src/connection/queue.rs

//! The per-connection command queues.
//!
//! A `Pending` entry is a command plus the handle through which its reply is
//! delivered. Entries live in exactly one place at a time: the offline queue
//! (not yet written), the in-flight queue (written, awaiting a reply), or
//! nowhere (resolved). Each entry is resolved exactly once.

use crate::core::commands::Command;
use crate::core::errors::ClientError;
use crate::core::protocol::RespFrame;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;

pub(crate) type FrameResult = Result<RespFrame, ClientError>;

/// Collects the replies of one batch and delivers them together once the
/// last entry of the batch resolves.
pub(crate) struct BatchCollector {
    results: Vec<Option<FrameResult>>,
    remaining: usize,
    tx: Option<oneshot::Sender<Vec<FrameResult>>>,
}

impl BatchCollector {
    pub(crate) fn new(len: usize, tx: oneshot::Sender<Vec<FrameResult>>) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            results: (0..len).map(|_| None).collect(),
            remaining: len,
            tx: Some(tx),
        }))
    }

    fn set(&mut self, index: usize, result: FrameResult) {
        if let Some(slot) = self.results.get_mut(index)
            && slot.is_none()
        {
            *slot = Some(result);
            self.remaining -= 1;
        }
        if self.remaining == 0
            && let Some(tx) = self.tx.take()
        {
            let results = std::mem::take(&mut self.results)
                .into_iter()
                .map(|r| r.unwrap_or(Err(ClientError::ConnectionClosed)))
                .collect();
            let _ = tx.send(results);
        }
    }
}

/// Internal bookkeeping commands whose replies are consumed by the actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InternalKind {
    ReadyCheck,
    Resubscribe,
}

/// Where the reply to a pending command goes.
pub(crate) enum Responder {
    Caller(oneshot::Sender<FrameResult>),
    Batch {
        collector: Arc<Mutex<BatchCollector>>,
        index: usize,
    },
    Internal(InternalKind),
}

impl Responder {
    pub(crate) fn resolve(self, result: FrameResult) {
        match self {
            // The caller may have timed out and dropped its receiver.
            Responder::Caller(tx) => {
                let _ = tx.send(result);
            }
            Responder::Batch { collector, index } => collector.lock().set(index, result),
            Responder::Internal(_) => {}
        }
    }

    pub(crate) fn is_internal(&self) -> bool {
        matches!(self, Responder::Internal(_))
    }
}

/// A command waiting to be written or answered.
pub(crate) struct Pending {
    pub command: Command,
    pub responder: Responder,
    /// Disconnects survived while queued, checked against `max_retries_per_request`.
    pub retries: u32,
    /// Part of a MULTI/EXEC batch; `tx_start` marks its MULTI.
    pub in_transaction: bool,
    pub tx_start: bool,
    /// Acknowledgements still expected for a (P)(UN)SUBSCRIBE.
    pub acks_remaining: usize,
}

impl Pending {
    pub(crate) fn new(command: Command, responder: Responder) -> Self {
        Self {
            command,
            responder,
            retries: 0,
            in_transaction: false,
            tx_start: false,
            acks_remaining: 0,
        }
    }

    pub(crate) fn fail(self, error: ClientError) {
        self.responder.resolve(Err(error));
    }

    /// Whether this entry must fail rather than be replayed after a disconnect.
    pub(crate) fn fails_on_disconnect(&self) -> bool {
        self.in_transaction || self.command.is_blocking()
    }
}

/// Admission policy of the offline queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OfflineQueuePolicy {
    /// Commands issued while not writable fail immediately.
    Disabled,
    #[default]
    Unbounded,
    Bounded(usize),
}

/// FIFO of commands accepted while no connection is writable.
pub(crate) struct OfflineQueue {
    entries: VecDeque<Pending>,
    policy: OfflineQueuePolicy,
}

impl OfflineQueue {
    pub(crate) fn new(policy: OfflineQueuePolicy) -> Self {
        Self {
            entries: VecDeque::new(),
            policy,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks whether `count` more entries may be admitted.
    pub(crate) fn check_admission(&self, count: usize) -> Result<(), ClientError> {
        match self.policy {
            OfflineQueuePolicy::Disabled => Err(ClientError::NotReady),
            OfflineQueuePolicy::Unbounded => Ok(()),
            OfflineQueuePolicy::Bounded(limit) if self.entries.len() + count > limit => {
                Err(ClientError::OfflineQueueFull(limit))
            }
            OfflineQueuePolicy::Bounded(_) => Ok(()),
        }
    }

    /// Appends without consulting the policy.
    pub(crate) fn push_back(&mut self, pending: Pending) {
        self.entries.push_back(pending);
    }

    /// Puts replayed commands back at the front, keeping their relative order.
    pub(crate) fn requeue_front(&mut self, replay: Vec<Pending>) {
        for pending in replay.into_iter().rev() {
            self.entries.push_front(pending);
        }
    }

    pub(crate) fn pop_front(&mut self) -> Option<Pending> {
        self.entries.pop_front()
    }

    /// Bumps every entry's retry count and fails those above `max`.
    pub(crate) fn count_retry(&mut self, max: Option<u32>) {
        let Some(max) = max else {
            return;
        };
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for mut pending in self.entries.drain(..) {
            pending.retries += 1;
            if pending.retries > max {
                pending.fail(ClientError::MaxRetriesPerRequest(max));
            } else {
                kept.push_back(pending);
            }
        }
        self.entries = kept;
    }

    pub(crate) fn fail_all(&mut self, error: &ClientError) {
        for pending in self.entries.drain(..) {
            pending.fail(error.clone());
        }
    }
}
