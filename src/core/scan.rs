// src/core/scan.rs

//! Cursor iteration (`SCAN`, `HSCAN`, `SSCAN`, `ZSCAN`) as async streams.
//!
//! Each stream item is one page of elements as returned by the server. The
//! stream ends once the server hands back cursor `0`. Like the commands
//! themselves, iteration may yield an element more than once.

use crate::connection::Connection;
use crate::core::cluster::{ClusterClient, NodeRole};
use crate::core::commands::{Command, ToArg, cmd};
use crate::core::errors::ClientError;
use crate::core::protocol::{FromRespValue, RespValue};
use async_stream::stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;

/// A boxed page stream.
pub type ScanStream = Pin<Box<dyn Stream<Item = Result<Vec<Bytes>, ClientError>> + Send>>;

/// `MATCH`, `COUNT` and `TYPE` arguments.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub pattern: Option<Bytes>,
    pub count: Option<usize>,
    /// Only honored by `SCAN`.
    pub kind: Option<String>,
}

impl ScanOptions {
    pub fn pattern(mut self, pattern: impl ToArg) -> Self {
        self.pattern = Some(pattern.to_arg());
        self
    }

    pub fn count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    fn apply(&self, mut command: Command, with_type: bool) -> Command {
        if let Some(pattern) = &self.pattern {
            command = command.arg("MATCH").arg(pattern);
        }
        if let Some(count) = self.count {
            command = command.arg("COUNT").arg(count);
        }
        if with_type && let Some(kind) = &self.kind {
            command = command.arg("TYPE").arg(kind);
        }
        command
    }
}

/// Anything that can send a single command.
#[async_trait]
pub(crate) trait CommandSender: Clone + Send + Sync + 'static {
    async fn send_command(&self, command: Command) -> Result<RespValue, ClientError>;
}

#[async_trait]
impl CommandSender for Connection {
    async fn send_command(&self, command: Command) -> Result<RespValue, ClientError> {
        self.send(command).await
    }
}

#[async_trait]
impl CommandSender for ClusterClient {
    async fn send_command(&self, command: Command) -> Result<RespValue, ClientError> {
        self.send(command).await
    }
}

/// Runs a cursor command until the cursor wraps to `0`. `build` receives the
/// cursor and returns the full command.
pub(crate) fn cursor_stream<S, F>(sender: S, build: F) -> ScanStream
where
    S: CommandSender,
    F: Fn(Bytes) -> Command + Send + Sync + 'static,
{
    Box::pin(stream! {
        let mut cursor = Bytes::from_static(b"0");
        loop {
            let (next, page) = match fetch_page(&sender, build(cursor)).await {
                Ok(reply) => reply,
                Err(e) => {
                    yield Err(e);
                    break;
                }
            };
            if !page.is_empty() {
                yield Ok(page);
            }
            if next.as_ref() == b"0" {
                break;
            }
            cursor = next;
        }
    })
}

async fn fetch_page<S: CommandSender>(
    sender: &S,
    command: Command,
) -> Result<(Bytes, Vec<Bytes>), ClientError> {
    <(Bytes, Vec<Bytes>)>::from_resp(sender.send_command(command).await?)
}

/// `SCAN` over the keyspace of one node.
pub fn scan_stream(conn: &Connection, options: ScanOptions) -> ScanStream {
    cursor_stream(conn.clone(), move |cursor| {
        options.apply(cmd("SCAN").arg(cursor), true)
    })
}

/// `SCAN` over every master of a cluster, one node after the other.
pub fn cluster_scan_stream(cluster: &ClusterClient, options: ScanOptions) -> ScanStream {
    let masters = cluster.nodes(NodeRole::Master);
    Box::pin(
        futures::stream::iter(masters)
            .flat_map(move |conn| scan_stream(&conn, options.clone())),
    )
}

fn key_scan<S: CommandSender>(
    sender: &S,
    name: &'static str,
    key: Bytes,
    options: ScanOptions,
) -> ScanStream {
    cursor_stream(sender.clone(), move |cursor| {
        options.apply(cmd(name).arg(&key).arg(cursor), false)
    })
}

/// `HSCAN`; pages hold field/value pairs flattened.
pub(crate) fn hscan_stream<S: CommandSender>(
    sender: &S,
    key: impl ToArg,
    options: ScanOptions,
) -> ScanStream {
    key_scan(sender, "HSCAN", key.to_arg(), options)
}

pub(crate) fn sscan_stream<S: CommandSender>(
    sender: &S,
    key: impl ToArg,
    options: ScanOptions,
) -> ScanStream {
    key_scan(sender, "SSCAN", key.to_arg(), options)
}

/// `ZSCAN`; pages hold member/score pairs flattened.
pub(crate) fn zscan_stream<S: CommandSender>(
    sender: &S,
    key: impl ToArg,
    options: ScanOptions,
) -> ScanStream {
    key_scan(sender, "ZSCAN", key.to_arg(), options)
}
