// src/core/pipeline.rs

//! Pipelines and MULTI/EXEC transactions.
//!
//! Both accumulate commands on the caller's side and hand the whole group to
//! the connection in a single request, which writes it with one flush. A
//! pipeline yields one independent outcome per command; a transaction wraps
//! the group in MULTI/EXEC and reconciles EXEC's array with the queued
//! commands by position.

use crate::connection::Connection;
use crate::connection::queue::FrameResult;
use crate::core::commands::{Command, ReplyTransform, cmd};
use crate::core::errors::{ClientError, ServerError, ServerErrorKind};
use crate::core::protocol::{RespFrame, RespValue};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Something that can write a batch of commands in one flush.
#[async_trait]
pub(crate) trait BatchExecutor: Send + Sync {
    async fn execute_batch(
        &self,
        commands: Vec<Command>,
        transaction: bool,
    ) -> Result<Vec<FrameResult>, ClientError>;
}

#[async_trait]
impl BatchExecutor for Connection {
    async fn execute_batch(
        &self,
        commands: Vec<Command>,
        transaction: bool,
    ) -> Result<Vec<FrameResult>, ClientError> {
        let commands = match &self.options().key_prefix {
            Some(prefix) => commands
                .into_iter()
                .map(|c| c.with_key_prefix(prefix))
                .collect(),
            None => commands,
        };
        self.send_batch(commands, transaction).await
    }
}

/// Applies each command's transform to its reply.
fn reconcile(
    transforms: Vec<ReplyTransform>,
    results: Vec<FrameResult>,
) -> Vec<Result<RespValue, ClientError>> {
    transforms
        .into_iter()
        .zip(results)
        .map(|(transform, result)| result.and_then(|frame| transform.apply(frame)))
        .collect()
}

/// A batch of independent commands sent in one write.
pub struct Pipeline {
    executor: Arc<dyn BatchExecutor>,
    commands: Vec<Command>,
}

impl Pipeline {
    pub(crate) fn new(executor: Arc<dyn BatchExecutor>) -> Self {
        Self {
            executor,
            commands: Vec::new(),
        }
    }

    /// Appends a command.
    pub fn add(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    /// Appends a command, builder style.
    pub fn cmd(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Sends every command in one flush. The outer error is a failure of the
    /// whole batch; each inner result is that command's own outcome.
    pub async fn exec(self) -> Result<Vec<Result<RespValue, ClientError>>, ClientError> {
        let transforms = self.commands.iter().map(Command::transform).collect();
        let results = self.executor.execute_batch(self.commands, false).await?;
        Ok(reconcile(transforms, results))
    }
}

/// The result of a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    /// EXEC ran; one outcome per queued command.
    Committed(Vec<Result<RespValue, ClientError>>),
    /// A watched key changed, or the WATCH did not survive a reconnect.
    /// Nothing was applied.
    Aborted,
}

impl TransactionOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, TransactionOutcome::Aborted)
    }

    /// The committed results, or `None` if aborted.
    pub fn into_results(self) -> Option<Vec<Result<RespValue, ClientError>>> {
        match self {
            TransactionOutcome::Committed(results) => Some(results),
            TransactionOutcome::Aborted => None,
        }
    }
}

/// A MULTI/EXEC block.
pub struct Transaction {
    executor: Arc<dyn BatchExecutor>,
    commands: Vec<Command>,
}

impl Transaction {
    pub(crate) fn new(executor: Arc<dyn BatchExecutor>) -> Self {
        Self {
            executor,
            commands: Vec::new(),
        }
    }

    pub fn add(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn cmd(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Sends MULTI, the queued commands and EXEC in one flush.
    pub async fn exec(self) -> Result<TransactionOutcome, ClientError> {
        let transforms: Vec<_> = self.commands.iter().map(Command::transform).collect();
        let count = self.commands.len();

        let mut batch = Vec::with_capacity(count + 2);
        batch.push(cmd("MULTI"));
        batch.extend(self.commands);
        batch.push(cmd("EXEC"));

        let results = match self.executor.execute_batch(batch, true).await {
            Ok(results) => results,
            Err(ClientError::WatchLost) => return Ok(TransactionOutcome::Aborted),
            Err(e) => return Err(e),
        };
        interpret_exec(transforms, results)
    }
}

/// Reconciles `[MULTI, QUEUED.., EXEC]` replies.
fn interpret_exec(
    transforms: Vec<ReplyTransform>,
    mut results: Vec<FrameResult>,
) -> Result<TransactionOutcome, ClientError> {
    let exec = results
        .pop()
        .ok_or_else(|| ClientError::UnexpectedReply("empty transaction reply".into()))?;
    let mut queued = results.into_iter();

    match queued.next() {
        Some(Ok(RespFrame::Error(e))) => return Err(ClientError::Server(e)),
        Some(Ok(_)) => {}
        Some(Err(ClientError::WatchLost)) => return Ok(TransactionOutcome::Aborted),
        Some(Err(e)) => return Err(e),
        None => return Err(ClientError::UnexpectedReply("missing MULTI reply".into())),
    }

    let mut queue_errors: Vec<(usize, ServerError)> = Vec::new();
    for (index, reply) in queued.enumerate() {
        match reply {
            Ok(RespFrame::Error(e)) => queue_errors.push((index, e)),
            Ok(_) => {}
            Err(ClientError::WatchLost) => return Ok(TransactionOutcome::Aborted),
            Err(e) => return Err(e),
        }
    }

    match exec {
        Err(ClientError::WatchLost) => Ok(TransactionOutcome::Aborted),
        Err(e) => Err(e),
        Ok(RespFrame::NullArray | RespFrame::Null) => {
            debug!("EXEC returned null; a watched key was modified");
            Ok(TransactionOutcome::Aborted)
        }
        Ok(RespFrame::Error(e)) if e.kind == ServerErrorKind::ExecAbort => {
            Err(ClientError::ExecAbort {
                errors: queue_errors,
            })
        }
        Ok(RespFrame::Error(e)) => Err(ClientError::Server(e)),
        Ok(RespFrame::Array(items)) => {
            if items.len() != transforms.len() {
                return Err(ClientError::UnexpectedReply(format!(
                    "EXEC returned {} replies for {} commands",
                    items.len(),
                    transforms.len()
                )));
            }
            let results = items.into_iter().map(Ok).collect();
            Ok(TransactionOutcome::Committed(reconcile(transforms, results)))
        }
        Ok(other) => Err(ClientError::UnexpectedReply(format!(
            "unexpected EXEC reply {other:?}"
        ))),
    }
}
