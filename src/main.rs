// src/main.rs

//! `spinel-cli`: runs one command against a server or cluster and prints the
//! reply. `SUBSCRIBE`/`PSUBSCRIBE` keep printing messages until Ctrl-C.

use anyhow::{Context, Result, anyhow, bail};
use futures::StreamExt;
use spinel_client::core::commands::Command;
use spinel_client::core::pubsub::PubSubMessage;
use spinel_client::{Client, Config, MessageFilter, RespValue};
use std::env;
use tracing::{debug, error};
use tracing_subscriber::filter::EnvFilter;

const VERSION: &str = env!("SPINEL_CLIENT_BUILD_VERSION");

const USAGE: &str = "Usage: spinel-cli [--config <file.toml> | --url <redis://...>] <command> [args...]";

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.iter().any(|a| a == "--version") {
        println!("spinel-cli version {VERSION}");
        return Ok(());
    }
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        println!("{USAGE}");
        return Ok(());
    }

    let (config, command) = parse_args(&args)?;

    // RUST_LOG wins over the config's log_level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&config, command).await {
        error!("{e:#}");
        return Err(e);
    }
    Ok(())
}

fn parse_args(args: &[String]) -> Result<(Config, Command)> {
    let mut config = None;
    let mut rest = args;
    loop {
        match rest {
            [flag, path, tail @ ..] if flag == "--config" => {
                config = Some(Config::from_file(path)?);
                rest = tail;
            }
            [flag, url, tail @ ..] if flag == "--url" => {
                config = Some(Config::from_url(url)?);
                rest = tail;
            }
            _ => break,
        }
    }
    let config = match config {
        Some(config) => config,
        None => match env::var("SPINEL_URL") {
            Ok(url) => Config::from_url(&url).context("Invalid SPINEL_URL")?,
            Err(_) => Config::default(),
        },
    };
    let command = Command::from_parts(rest.iter().map(|a| a.clone().into()).collect())
        .ok_or_else(|| anyhow!("no command given\n{USAGE}"))?;
    if !command.has_valid_arity() {
        bail!(
            "wrong number of arguments for '{}'",
            command.name().to_ascii_lowercase()
        );
    }
    Ok((config, command))
}

async fn run(config: &Config, command: Command) -> Result<()> {
    let client = Client::connect(config)
        .await
        .context("Failed to connect")?;
    debug!("Connected; sending {}", command.name());

    let targets: Vec<String> = command
        .subscription_targets()
        .iter()
        .map(|t| String::from_utf8_lossy(t).into_owned())
        .collect();
    match command.name() {
        "SUBSCRIBE" => {
            let mut messages = client.messages(MessageFilter::All);
            client.subscribe(&targets).await?;
            follow(&mut messages).await;
        }
        "PSUBSCRIBE" => {
            let mut messages = client.messages(MessageFilter::All);
            client.psubscribe(&targets).await?;
            follow(&mut messages).await;
        }
        _ => {
            let reply = client.send(command).await?;
            print_value(&reply, 0);
        }
    }
    client.disconnect();
    Ok(())
}

async fn follow(messages: &mut spinel_client::core::pubsub::MessageStream) {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = messages.next() => match message {
                Some(PubSubMessage::Message { channel, payload }) => {
                    println!(
                        "{}: {}",
                        String::from_utf8_lossy(&channel),
                        String::from_utf8_lossy(&payload)
                    );
                }
                Some(PubSubMessage::PMessage { pattern, channel, payload }) => {
                    println!(
                        "{} ({}): {}",
                        String::from_utf8_lossy(&channel),
                        String::from_utf8_lossy(&pattern),
                        String::from_utf8_lossy(&payload)
                    );
                }
                Some(other) => debug!("ignoring {other:?}"),
                None => break,
            },
        }
    }
}

fn print_value(value: &RespValue, depth: usize) {
    let indent = "  ".repeat(depth);
    match value {
        RespValue::Array(items) if items.is_empty() => println!("{indent}(empty array)"),
        RespValue::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                if matches!(item, RespValue::Array(_) | RespValue::Map(_)) {
                    println!("{indent}{})", i + 1);
                    print_value(item, depth + 1);
                } else {
                    print!("{indent}{}) ", i + 1);
                    print_value(item, 0);
                }
            }
        }
        RespValue::Map(map) => {
            for (key, item) in map {
                println!("{indent}{}:", String::from_utf8_lossy(key));
                print_value(item, depth + 1);
            }
        }
        RespValue::Nil => println!("{indent}(nil)"),
        RespValue::Integer(i) => println!("{indent}(integer) {i}"),
        RespValue::Double(d) => println!("{indent}(double) {d}"),
        RespValue::Boolean(b) => println!("{indent}({b})"),
        RespValue::Status(s) => println!("{indent}{s}"),
        RespValue::Bulk(b) => println!("{indent}\"{}\"", String::from_utf8_lossy(b)),
        RespValue::Error(e) => println!("{indent}(error) {e}"),
    }
}
