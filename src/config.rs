// src/config.rs

//! Client configuration: loading from TOML or a connection URL, validation,
//! and conversion into runtime `ConnectionOptions` / `ClusterOptions`.

use crate::connection::{
    ConnectionOptions, Credentials, DefaultConnector, Endpoint, OfflineFlush, OfflineQueuePolicy,
    TlsSettings,
};
use crate::core::cluster::{ClusterOptions, ReplicaSelection, ScaleReads};
use crate::core::reconnect::{ExponentialBackoff, ReconnectPolicy};
use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use url::Url;

/// TLS settings for the default connector.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Name used for SNI and certificate verification; defaults to the host.
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Exponential reconnect backoff.
#[derive(Deserialize, Debug, Clone)]
pub struct RetryConfig {
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
    /// Give up after this many consecutive failed attempts. Unset retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            max_attempts: None,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(ExponentialBackoff {
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            max_attempts: self.max_attempts,
            jitter: self.jitter,
        })
    }
}

fn default_base_delay() -> Duration {
    Duration::from_millis(50)
}
fn default_max_delay() -> Duration {
    Duration::from_secs(2)
}
fn default_true() -> bool {
    true
}

/// Settings of a single (standalone) connection. In cluster mode they serve
/// as the template for every node connection.
#[derive(Deserialize, Debug, Clone)]
pub struct ClientConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// A Unix domain socket; overrides host and port.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: u32,
    #[serde(default)]
    pub connection_name: Option<String>,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde", default)]
    pub command_timeout: Option<Duration>,
    #[serde(default = "default_true")]
    pub enable_ready_check: bool,
    #[serde(default = "default_true")]
    pub enable_offline_queue: bool,
    /// Caps the offline queue; unset means unbounded.
    #[serde(default)]
    pub offline_queue_limit: Option<usize>,
    #[serde(default)]
    pub offline_flush: OfflineFlush,
    #[serde(default = "default_true")]
    pub auto_resubscribe: bool,
    #[serde(default = "default_true")]
    pub auto_resend_unfulfilled_commands: bool,
    #[serde(default)]
    pub lazy_connect: bool,
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_max_retries_per_request")]
    pub max_retries_per_request: Option<u32>,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    6379
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_max_retries_per_request() -> Option<u32> {
    Some(20)
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: None,
            username: None,
            password: None,
            db: 0,
            connection_name: None,
            tls: TlsConfig::default(),
            connect_timeout: default_connect_timeout(),
            command_timeout: None,
            enable_ready_check: true,
            enable_offline_queue: true,
            offline_queue_limit: None,
            offline_flush: OfflineFlush::default(),
            auto_resubscribe: true,
            auto_resend_unfulfilled_commands: true,
            lazy_connect: false,
            key_prefix: None,
            read_only: false,
            max_retries_per_request: default_max_retries_per_request(),
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parses `redis://[[user]:password@]host[:port][/db][?params]`,
    /// `rediss://` (TLS) or `unix:///path/to/socket[?db=N]`.
    ///
    /// Recognized query parameters: `db`, `name`, `key_prefix`,
    /// `lazy_connect`, `read_only`.
    pub fn from_url(input: &str) -> Result<Self> {
        let url = Url::parse(input).with_context(|| format!("Invalid connection URL '{input}'"))?;
        let mut config = ClientConfig::default();

        match url.scheme() {
            "redis" => {}
            "rediss" => config.tls.enabled = true,
            "unix" | "redis+unix" => {
                if url.path().is_empty() {
                    bail!("unix URL '{input}' has no socket path");
                }
                config.path = Some(PathBuf::from(url.path()));
            }
            other => bail!("unsupported URL scheme '{other}'"),
        }

        if config.path.is_none() {
            if let Some(host) = url.host_str() {
                config.host = host.trim_start_matches('[').trim_end_matches(']').to_string();
            }
            if let Some(port) = url.port() {
                config.port = port;
            }
            let db = url.path().trim_start_matches('/');
            if !db.is_empty() {
                config.db = db
                    .parse()
                    .with_context(|| format!("Invalid database index '{db}' in URL"))?;
            }
        }

        if let Some(password) = url.password() {
            config.password = Some(decode(password)?);
        }
        if !url.username().is_empty() {
            let username = decode(url.username())?;
            // A lone user part (`redis://secret@host`) is the password.
            if config.password.is_none() {
                config.password = Some(username);
            } else {
                config.username = Some(username);
            }
        }

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "db" => {
                    config.db = value
                        .parse()
                        .with_context(|| format!("Invalid database index '{value}' in URL"))?
                }
                "name" => config.connection_name = Some(value.into_owned()),
                "key_prefix" => config.key_prefix = Some(value.into_owned()),
                "lazy_connect" => config.lazy_connect = parse_flag(&value)?,
                "read_only" => config.read_only = parse_flag(&value)?,
                other => warn!("Ignoring unknown URL parameter '{other}'"),
            }
        }
        Ok(config)
    }

    pub fn endpoint(&self) -> Endpoint {
        match &self.path {
            Some(path) => Endpoint::Unix(path.clone()),
            None => Endpoint::tcp(self.host.clone(), self.port),
        }
    }

    /// Builds the runtime options for this config.
    pub fn connection_options(&self) -> ConnectionOptions {
        let mut options = ConnectionOptions::new(self.endpoint());
        options.credentials = self.password.as_ref().map(|password| Credentials {
            username: self.username.clone(),
            password: password.clone(),
        });
        options.db = self.db;
        options.connection_name = self.connection_name.clone();
        options.read_only = self.read_only;
        options.enable_ready_check = self.enable_ready_check;
        options.offline_queue = match (self.enable_offline_queue, self.offline_queue_limit) {
            (false, _) => OfflineQueuePolicy::Disabled,
            (true, Some(limit)) => OfflineQueuePolicy::Bounded(limit),
            (true, None) => OfflineQueuePolicy::Unbounded,
        };
        options.offline_flush = self.offline_flush;
        options.auto_resubscribe = self.auto_resubscribe;
        options.auto_resend_unfulfilled_commands = self.auto_resend_unfulfilled_commands;
        options.lazy_connect = self.lazy_connect;
        options.connect_timeout = self.connect_timeout;
        options.command_timeout = self.command_timeout;
        options.key_prefix = self.key_prefix.clone().map(Bytes::from);
        options.max_retries_per_request = self.max_retries_per_request;
        options.reconnect = self.retry.policy();
        if self.tls.enabled {
            options = options.with_connector(DefaultConnector::tls(TlsSettings {
                server_name: self.tls.server_name.clone(),
            }));
        }
        options
    }

    /// Checks the settings for logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.path.is_none() {
            if self.host.trim().is_empty() {
                return Err(anyhow!("host cannot be empty"));
            }
            if self.port == 0 {
                return Err(anyhow!("port cannot be 0"));
            }
        } else if self.tls.enabled {
            return Err(anyhow!("tls cannot be used with a unix socket path"));
        }
        if self.username.is_some() && self.password.is_none() {
            return Err(anyhow!("username requires a password"));
        }
        if self.connect_timeout.is_zero() {
            return Err(anyhow!("connect_timeout cannot be 0"));
        }
        if self.command_timeout.is_some_and(|t| t.is_zero()) {
            return Err(anyhow!("command_timeout cannot be 0; leave it unset instead"));
        }
        if self.offline_queue_limit == Some(0) {
            return Err(anyhow!(
                "offline_queue_limit cannot be 0; set enable_offline_queue = false instead"
            ));
        }
        if !self.enable_offline_queue && self.offline_queue_limit.is_some() {
            warn!("offline_queue_limit is ignored because the offline queue is disabled");
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(anyhow!("retry.base_delay cannot exceed retry.max_delay"));
        }
        if self.key_prefix.as_deref() == Some("") {
            return Err(anyhow!("key_prefix cannot be empty; leave it unset instead"));
        }
        Ok(())
    }
}

fn decode(component: &str) -> Result<String> {
    Ok(urlencoding::decode(component)
        .with_context(|| format!("Invalid percent-encoding in '{component}'"))?
        .into_owned())
}

fn parse_flag(value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(anyhow!("invalid boolean '{other}' in URL")),
    }
}

/// Cluster discovery and routing settings.
#[derive(Deserialize, Debug, Clone)]
pub struct ClusterConfig {
    /// `host:port` addresses used to discover the cluster.
    pub seeds: Vec<String>,
    #[serde(default)]
    pub scale_reads: ScaleReads,
    #[serde(default)]
    pub replica_selection: ReplicaSelection,
    #[serde(default = "default_max_redirections")]
    pub max_redirections: usize,
    #[serde(with = "humantime_serde", default = "default_cluster_retry_delay")]
    pub retry_delay_on_failover: Duration,
    #[serde(with = "humantime_serde", default = "default_cluster_retry_delay")]
    pub retry_delay_on_cluster_down: Duration,
    #[serde(with = "humantime_serde", default = "default_cluster_retry_delay")]
    pub retry_delay_on_try_again: Duration,
    #[serde(with = "humantime_serde", default = "default_slots_refresh_timeout")]
    pub slots_refresh_timeout: Duration,
    #[serde(with = "humantime_serde", default)]
    pub slots_refresh_interval: Option<Duration>,
    /// Retries of the initial discovery. Unset fails on the first round.
    #[serde(default)]
    pub init_retry: Option<RetryConfig>,
}

fn default_max_redirections() -> usize {
    16
}
fn default_cluster_retry_delay() -> Duration {
    Duration::from_millis(100)
}
fn default_slots_refresh_timeout() -> Duration {
    Duration::from_secs(1)
}

/// The top-level configuration file.
///
/// ```toml
/// log_level = "debug"
///
/// [client]
/// host = "10.0.0.5"
/// connect_timeout = "5s"
///
/// [cluster]
/// seeds = ["10.0.0.5:7000", "10.0.0.6:7000"]
/// ```
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub client: ClientConfig,
    /// Present for cluster mode; `client` then templates the node connections.
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            client: ClientConfig::default(),
            cluster: None,
        }
    }
}

impl Config {
    /// Reads, parses and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{}'", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Invalid config file '{}'", path.display()))
    }

    /// Parses and validates TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// A standalone config from a connection URL.
    pub fn from_url(url: &str) -> Result<Self> {
        let config = Config {
            client: ClientConfig::from_url(url)?,
            ..Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn is_cluster(&self) -> bool {
        self.cluster.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        self.client.validate().context("invalid [client] section")?;

        if let Some(cluster) = &self.cluster {
            if cluster.seeds.is_empty() {
                return Err(anyhow!("cluster.seeds cannot be empty"));
            }
            for seed in &cluster.seeds {
                if Endpoint::parse_addr(seed).is_none() {
                    return Err(anyhow!("cluster seed '{seed}' is not a host:port address"));
                }
            }
            if cluster.max_redirections == 0 {
                return Err(anyhow!("cluster.max_redirections cannot be 0"));
            }
            if cluster.slots_refresh_timeout.is_zero() {
                return Err(anyhow!("cluster.slots_refresh_timeout cannot be 0"));
            }
            if cluster.slots_refresh_interval.is_some_and(|i| i.is_zero()) {
                return Err(anyhow!("cluster.slots_refresh_interval cannot be 0"));
            }
            if self.client.path.is_some() {
                return Err(anyhow!("a unix socket path cannot be used in cluster mode"));
            }
            if self.client.db != 0 {
                return Err(anyhow!("cluster mode only supports db 0"));
            }
        }
        Ok(())
    }

    /// Runtime options for a standalone connection.
    pub fn connection_options(&self) -> ConnectionOptions {
        self.client.connection_options()
    }

    /// Runtime options for a cluster client, or `None` in standalone mode.
    pub fn cluster_options(&self) -> Result<Option<ClusterOptions>> {
        let Some(cluster) = &self.cluster else {
            return Ok(None);
        };
        let seeds = cluster
            .seeds
            .iter()
            .map(|s| Endpoint::parse_addr(s).ok_or_else(|| anyhow!("invalid seed '{s}'")))
            .collect::<Result<Vec<_>>>()?;

        let mut node = self.client.connection_options();
        let key_prefix = node.key_prefix.take();
        let mut options = ClusterOptions::new(seeds).with_node_options(node);
        options.scale_reads = cluster.scale_reads;
        options.replica_selection = cluster.replica_selection;
        options.max_redirections = cluster.max_redirections;
        options.retry_delay_on_failover = cluster.retry_delay_on_failover;
        options.retry_delay_on_cluster_down = cluster.retry_delay_on_cluster_down;
        options.retry_delay_on_try_again = cluster.retry_delay_on_try_again;
        options.slots_refresh_timeout = cluster.slots_refresh_timeout;
        options.slots_refresh_interval = cluster.slots_refresh_interval;
        options.key_prefix = key_prefix;
        options.init_retry = cluster
            .init_retry
            .as_ref()
            .map_or_else(ReconnectPolicy::never, RetryConfig::policy);
        Ok(Some(options))
    }
}
