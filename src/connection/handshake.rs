// src/connection/handshake.rs

//! The connection handshake: AUTH, CLIENT SETNAME, SELECT and READONLY, run
//! directly on the framed stream before the connection accepts commands, plus
//! the INFO-based readiness check.

use super::options::{ConnectionOptions, Credentials};
use super::stream::NodeStream;
use crate::core::commands::{Command, cmd};
use crate::core::errors::{ClientError, ServerErrorKind};
use crate::core::protocol::{RespFrame, RespFrameCodec};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

pub(crate) type NodeFramed = Framed<NodeStream, RespFrameCodec>;

/// Longest wait between two readiness checks while the server is loading.
const MAX_LOADING_WAIT: Duration = Duration::from_secs(1);

/// Sends one command and reads its reply, skipping any out-of-band pushes.
async fn roundtrip(framed: &mut NodeFramed, command: &Command) -> Result<RespFrame, ClientError> {
    framed.send(command).await?;
    loop {
        match framed.next().await {
            Some(Ok(RespFrame::Push(_))) => continue,
            Some(Ok(frame)) => return Ok(frame),
            Some(Err(e)) => return Err(e),
            None => return Err(ClientError::ConnectionClosed),
        }
    }
}

async fn expect_ok(framed: &mut NodeFramed, command: &Command) -> Result<(), ClientError> {
    match roundtrip(framed, command).await?.into_result()? {
        RespFrame::SimpleString(_) => Ok(()),
        other => Err(ClientError::UnexpectedReply(format!(
            "{} answered {other:?}",
            command.name()
        ))),
    }
}

/// Runs the setup steps. The readiness check is separate so that callers can
/// choose to flush the offline queue before it.
pub(crate) async fn perform_handshake(
    framed: &mut NodeFramed,
    options: &ConnectionOptions,
    credentials: Option<&Credentials>,
) -> Result<(), ClientError> {
    if let Some(creds) = credentials {
        let auth = match &creds.username {
            Some(user) => cmd("AUTH").arg(user.as_str()).arg(creds.password.as_str()),
            None => cmd("AUTH").arg(creds.password.as_str()),
        };
        match expect_ok(framed, &auth).await {
            Ok(()) => debug!("AUTH accepted by {}", options.endpoint),
            // The server has no password configured; carry on unauthenticated.
            Err(ClientError::Server(e))
                if e.kind == ServerErrorKind::Generic
                    && (e.message.contains("no password is set")
                        || e.message.contains("without any password configured")) =>
            {
                warn!("{} does not require a password: {}", options.endpoint, e.message);
            }
            Err(e) => return Err(e),
        }
    }

    if let Some(name) = &options.connection_name {
        expect_ok(framed, &cmd("CLIENT").arg("SETNAME").arg(name.as_str())).await?;
    }

    if options.db != 0 {
        expect_ok(framed, &cmd("SELECT").arg(options.db)).await?;
    }

    if options.read_only {
        expect_ok(framed, &cmd("READONLY")).await?;
    }

    debug!("Handshake with {} completed", options.endpoint);
    Ok(())
}

/// Polls INFO until the server reports it has finished loading.
pub(crate) async fn wait_until_ready(framed: &mut NodeFramed) -> Result<(), ClientError> {
    loop {
        match roundtrip(framed, &cmd("INFO")).await?.into_result() {
            Ok(frame) => {
                let info = frame
                    .as_bytes()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                match loading_wait(&info) {
                    Some(wait) => {
                        info!("Server is still loading; checking again in {wait:?}");
                        tokio::time::sleep(wait).await;
                    }
                    None => return Ok(()),
                }
            }
            Err(ClientError::Server(e)) => {
                // INFO may be renamed or forbidden by ACLs; treat the server as ready.
                warn!("Ready check failed ({e}); assuming the server is ready");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

/// Parses an INFO reply. Returns how long to wait if the server is loading.
pub fn loading_wait(info: &str) -> Option<Duration> {
    let mut loading = false;
    let mut eta = None;
    for line in info.lines() {
        let Some((key, value)) = line.trim_end_matches('\r').split_once(':') else {
            continue;
        };
        match key {
            "loading" => loading = value.trim() == "1",
            "loading_eta_seconds" => eta = value.trim().parse::<u64>().ok(),
            _ => {}
        }
    }
    if !loading {
        return None;
    }
    Some(
        eta.map(Duration::from_secs)
            .unwrap_or(MAX_LOADING_WAIT)
            .min(MAX_LOADING_WAIT),
    )
}
