//! Replication configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use zonesync_protocol::AuthSchema;

/// Default replication port
pub const DEFAULT_REPLICATION_PORT: u16 = 15353;

/// Default number of journal entries per `actions` message
pub const DEFAULT_MAX_BATCH_SIZE: usize = 50;

/// A remote node this node pulls from and serves
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer node name, as it introduces itself
    pub name: String,
    /// Host name or address
    pub host: String,
    /// Replication port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Authentication schema used in both directions
    #[serde(default = "default_auth_schema")]
    pub auth_schema: AuthSchema,
    /// Key shared with the peer
    pub shared_key: String,
}

fn default_port() -> u16 {
    DEFAULT_REPLICATION_PORT
}

fn default_auth_schema() -> AuthSchema {
    AuthSchema::Chap
}

impl PeerConfig {
    /// Create a peer entry using CHAP
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16, shared_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            auth_schema: AuthSchema::Chap,
            shared_key: shared_key.into(),
        }
    }

    /// Use a different authentication schema
    pub fn with_auth_schema(mut self, auth_schema: AuthSchema) -> Self {
        self.auth_schema = auth_schema;
        self
    }

    /// `host:port` for connecting
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Certificate and key for encrypted peer links
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain presented by the listener
    pub cert_path: PathBuf,
    /// PEM private key of the certificate
    pub key_path: PathBuf,
    /// PEM certificates trusted when connecting to peers (defaults to `cert_path`)
    #[serde(default)]
    pub ca_path: Option<PathBuf>,
}

/// Replication configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// This node's name; stamped as origin on locally committed actions
    pub node_name: String,

    /// Address to bind for peer connections
    pub listen_addr: String,

    /// Optional transport encryption
    pub tls: Option<TlsConfig>,

    /// Remote nodes
    pub peers: Vec<PeerConfig>,

    /// Interval between periodic pulls
    #[serde(rename = "pull_interval_ms", with = "serde_millis")]
    pub pull_interval: Duration,

    /// How long a client parks in `wait` before pulling again
    #[serde(rename = "wait_timeout_ms", with = "serde_millis")]
    pub wait_timeout: Duration,

    /// Read timeout outside of `wait`
    #[serde(rename = "read_timeout_ms", with = "serde_millis")]
    pub read_timeout: Duration,

    /// Connect timeout
    #[serde(rename = "connect_timeout_ms", with = "serde_millis")]
    pub connect_timeout: Duration,

    /// Maximum entries per `actions` message
    pub max_batch_size: usize,

    /// Drop journal entries every peer has acknowledged
    pub prune_journal: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            node_name: "zonesync".to_string(),
            listen_addr: format!("0.0.0.0:{}", DEFAULT_REPLICATION_PORT),
            tls: None,
            peers: Vec::new(),
            pull_interval: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(360),
            read_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            prune_journal: false,
        }
    }
}

impl ReplicationConfig {
    /// Configuration for node `node_name` listening on `listen_addr`
    pub fn new(node_name: impl Into<String>, listen_addr: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            listen_addr: listen_addr.into(),
            ..Default::default()
        }
    }

    /// Add a peer
    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }

    /// Set the periodic pull interval
    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = interval;
        self
    }

    /// Enable or disable journal pruning
    pub fn with_pruning(mut self, enabled: bool) -> Self {
        self.prune_journal = enabled;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(Error::config("node_name must not be empty"));
        }
        if self.max_batch_size == 0 {
            return Err(Error::config("max_batch_size must be greater than 0"));
        }
        for (name, value) in [
            ("pull_interval_ms", self.pull_interval),
            ("wait_timeout_ms", self.wait_timeout),
            ("read_timeout_ms", self.read_timeout),
            ("connect_timeout_ms", self.connect_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::config(format!("{} must be greater than 0", name)));
            }
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.name.trim().is_empty() {
                return Err(Error::config("peer name must not be empty"));
            }
            if peer.name == self.node_name {
                return Err(Error::config(format!(
                    "peer {} has the same name as this node",
                    peer.name
                )));
            }
            if !seen.insert(peer.name.as_str()) {
                return Err(Error::config(format!("peer {} configured twice", peer.name)));
            }
        }

        Ok(())
    }
}
