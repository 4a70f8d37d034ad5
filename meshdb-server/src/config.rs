//! Node configuration.
//!
//! The resolved [`NodeConfig`] value is an ordinary struct threaded into
//! [`crate::core::Core::create`]; there is no process-wide configuration
//! singleton. The binary builds it from CLI flags (with env fallbacks)
//! layered over an optional TOML file.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::conman::KeepaliveConfig;
use crate::error::{Error, Result};
use crate::proto::PROTOCOL_VERSION;

fn default_listen() -> String {
    "127.0.0.1:7040".to_string()
}

fn default_storage() -> PathBuf {
    PathBuf::from(".meshdb")
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

fn default_io_workers() -> usize {
    4
}

fn default_job_workers() -> usize {
    4
}

fn default_job_queues() -> usize {
    4
}

fn default_keepalive_idle_secs() -> u64 {
    30
}

fn default_keepalive_interval_secs() -> u64 {
    5
}

fn default_keepalive_count() -> u32 {
    3
}

fn default_batch_size() -> usize {
    64
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

fn default_sync_interval_ms() -> u64 {
    1_000
}

/// Complete node configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Listen address, host:port. Port 0 binds an ephemeral port.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Seed peer addresses to dial on `connect`.
    #[serde(default)]
    pub peers: Vec<String>,
    /// Storage root directory.
    #[serde(default = "default_storage")]
    pub storage: PathBuf,
    /// I/O worker threads of the runtime.
    #[serde(default = "default_io_workers")]
    pub io_workers: usize,
    /// Job scheduler worker count.
    #[serde(default = "default_job_workers")]
    pub job_workers: usize,
    /// Job scheduler queue count.
    #[serde(default = "default_job_queues")]
    pub job_queues: usize,
    #[serde(default = "default_keepalive_idle_secs")]
    pub keepalive_idle_secs: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_keepalive_count")]
    pub keepalive_count: u32,
    /// Batch size for log reads, sync pulls and commit rounds.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Request/response timeout.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Periodic re-sync interval of the data synchronizer.
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// Protocol version to announce. Overridable for testing only.
    #[serde(default = "default_version")]
    pub version: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            peers: Vec::new(),
            storage: default_storage(),
            io_workers: default_io_workers(),
            job_workers: default_job_workers(),
            job_queues: default_job_queues(),
            keepalive_idle_secs: default_keepalive_idle_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            keepalive_count: default_keepalive_count(),
            batch_size: default_batch_size(),
            send_timeout_ms: default_send_timeout_ms(),
            sync_interval_ms: default_sync_interval_ms(),
            version: default_version(),
        }
    }
}

impl NodeConfig {
    pub fn keepalive(&self) -> KeepaliveConfig {
        KeepaliveConfig {
            idle: Duration::from_secs(self.keepalive_idle_secs),
            interval: Duration::from_secs(self.keepalive_interval_secs),
            count: self.keepalive_count,
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

/// Command-line surface of the node binary.
#[derive(Debug, Parser)]
#[command(name = "meshdb-server", about = "Peer-to-peer replicated table store node")]
pub struct Cli {
    /// TOML configuration file; flags below override it.
    #[arg(long, env = "MESHDB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address (host:port).
    #[arg(long, env = "MESHDB_LISTEN")]
    pub listen: Option<String>,

    /// Seed peer address to dial; repeatable.
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// Storage root directory.
    #[arg(long, env = "MESHDB_STORAGE")]
    pub storage: Option<PathBuf>,

    /// I/O worker threads.
    #[arg(long)]
    pub io_workers: Option<usize>,
}

impl Cli {
    /// Resolve the final configuration: file first, then flags on top.
    pub fn into_config(self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)
                    .map_err(|e| Error::failed(format!("config file {}: {e}", path.display())))?
            }
            None => NodeConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if !self.peers.is_empty() {
            config.peers = self.peers;
        }
        if let Some(storage) = self.storage {
            config.storage = storage;
        }
        if let Some(io_workers) = self.io_workers {
            config.io_workers = io_workers;
        }

        Ok(config)
    }
}
