// src/core/reconnect.rs

//! The reconnection policy: a pluggable backoff function deciding how long to
//! wait before each reconnect attempt (or to stop), and an optional predicate
//! that may force a reconnect after specific server errors.

use crate::core::errors::{ServerError, ServerErrorKind};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Computes the delay before reconnect attempt `attempt` (starting at 1).
/// `None` stops reconnecting and ends the connection.
pub trait Backoff: Send + Sync + 'static {
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

impl<F> Backoff for F
where
    F: Fn(u32) -> Option<Duration> + Send + Sync + 'static,
{
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        self(attempt)
    }
}

/// Exponential backoff with an optional proportional jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Stop after this many consecutive failures. `None` retries forever.
    pub max_attempts: Option<u32>,
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            max_attempts: None,
            jitter: true,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts
            && attempt > max
        {
            return None;
        }
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return Some(delay);
        }
        // Up to +20%, still capped.
        let spread = (delay.as_millis() as u64 / 5).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=spread));
        Some((delay + jitter).min(self.max_delay))
    }
}

/// What to do after a command failed with a server error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    No,
    /// Fail the command and reconnect immediately.
    Reconnect,
    /// Reconnect immediately and resend the failed command first.
    ReconnectAndResend,
}

pub type ReconnectOnError = Arc<dyn Fn(&ServerError) -> ReconnectAction + Send + Sync>;

/// A predicate reconnecting (and resending) on `READONLY`, the typical error
/// after a failover demoted the node we are talking to.
pub fn reconnect_on_readonly() -> ReconnectOnError {
    Arc::new(|err: &ServerError| match err.kind {
        ServerErrorKind::ReadOnly => ReconnectAction::ReconnectAndResend,
        _ => ReconnectAction::No,
    })
}

/// Backoff plus the reconnect-on-error predicate.
#[derive(Clone)]
pub struct ReconnectPolicy {
    backoff: Arc<dyn Backoff>,
    reconnect_on_error: Option<ReconnectOnError>,
}

impl fmt::Debug for ReconnectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectPolicy")
            .field("reconnect_on_error", &self.reconnect_on_error.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}

impl ReconnectPolicy {
    pub fn new(backoff: impl Backoff) -> Self {
        Self {
            backoff: Arc::new(backoff),
            reconnect_on_error: None,
        }
    }

    /// A policy that never reconnects.
    pub fn never() -> Self {
        Self::new(|_attempt: u32| None)
    }

    /// Keeps the error-triggered reconnects but never reopens a lost connection.
    pub fn without_retries(&self) -> Self {
        Self {
            reconnect_on_error: self.reconnect_on_error.clone(),
            ..Self::never()
        }
    }

    pub fn with_reconnect_on_error(mut self, predicate: ReconnectOnError) -> Self {
        self.reconnect_on_error = Some(predicate);
        self
    }

    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        self.backoff.next_delay(attempt)
    }

    pub fn on_server_error(&self, err: &ServerError) -> ReconnectAction {
        match &self.reconnect_on_error {
            Some(predicate) => predicate(err),
            None => ReconnectAction::No,
        }
    }
}
