//! A zonesync node: every component wired from one configuration
//!
//! [`Node::open`] builds the registry, store, journal, lock table, session
//! manager, operations layer and replication service, and hands each one its
//! collaborators explicitly. [`Node::start`] recovers interrupted sessions
//! and starts the peer listener and pull scheduler; [`Node::shutdown`] stops
//! them.

use crate::action::ActionRegistry;
use crate::journal::{Journal, JournalEntry};
use crate::lock::LockManager;
use crate::ops::ZoneOperations;
use crate::replication::{PeerStatus, ReplicationConfig, ReplicationService, Transport, scheduler};
use crate::session::{SessionConfig, SessionManager};
use crate::state_hash::StateHashSink;
use crate::store::{DEFAULT_MAP_SIZE, Store};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory holding the LMDB environment
    pub data_dir: PathBuf,
    /// LMDB map size in bytes
    pub map_size: usize,
    /// Peer replication settings
    pub replication: ReplicationConfig,
    /// Session settings
    pub session: SessionConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            map_size: DEFAULT_MAP_SIZE,
            replication: ReplicationConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.map_size == 0 {
            return Err(Error::config("map_size must be greater than 0"));
        }
        if self.session.idle_timeout.is_zero() {
            return Err(Error::config("idle_timeout_ms must be greater than 0"));
        }
        self.replication.validate()
    }
}

/// A running zonesync node
pub struct Node {
    config: NodeConfig,
    store: Store,
    sessions: SessionManager,
    operations: ZoneOperations,
    replication: Arc<ReplicationService>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.config.replication.node_name)
            .field("data_dir", &self.config.data_dir)
            .finish()
    }
}

impl Node {
    /// Open the store and build every component
    pub fn open(config: NodeConfig, state_hash: Arc<dyn StateHashSink>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(ActionRegistry::standard());
        let store = Store::with_map_size(&config.data_dir, config.map_size)?;
        let journal = Journal::new(store.clone(), config.replication.node_name.clone());
        let sessions = SessionManager::new(
            store.clone(),
            journal,
            registry,
            LockManager::new(),
            config.session.clone(),
            state_hash,
        )?;
        let operations = ZoneOperations::new(sessions.clone());

        let transport = Transport::from_config(config.replication.tls.as_ref())?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let replication = Arc::new(ReplicationService::new(
            config.replication.clone(),
            sessions.clone(),
            transport,
            shutdown_rx,
        )?);

        tracing::info!(
            "Opened node {} at {} ({} peer(s))",
            config.replication.node_name,
            config.data_dir.display(),
            config.replication.peers.len()
        );

        Ok(Self {
            config,
            store,
            sessions,
            operations,
            replication,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Roll back leftover sessions, then start the listener and scheduler.
    ///
    /// Returns the bound listener address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let recovered = self.sessions.recover().await?;
        if recovered > 0 {
            tracing::warn!("Rolled back {} interrupted session(s)", recovered);
        }

        let listener = self.replication.bind().await?;
        let addr = listener.local_addr()?;

        let service = self.replication.clone();
        let listener_task = tokio::spawn(async move {
            if let Err(e) = service.serve(listener).await {
                tracing::error!("Peer listener failed: {}", e);
            }
        });
        let scheduler_task = tokio::spawn(scheduler::run(
            self.replication.clone(),
            self.shutdown_tx.subscribe(),
        ));

        self.tasks.lock().extend([listener_task, scheduler_task]);
        tracing::info!("Node {} started on {}", self.name(), addr);
        Ok(addr)
    }

    /// Signal every task to stop and wait for the listener and scheduler
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Node task ended abnormally: {}", e);
            }
        }
        tracing::info!("Node {} stopped", self.name());
    }

    /// Node name
    pub fn name(&self) -> &str {
        &self.config.replication.node_name
    }

    /// Configuration the node was opened with
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Store handle for read queries
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Session manager
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Zone operations
    pub fn operations(&self) -> &ZoneOperations {
        &self.operations
    }

    /// Replication service
    pub fn replication(&self) -> &Arc<ReplicationService> {
        &self.replication
    }

    /// Current journal tail
    pub async fn journal_tail(&self) -> Result<u64> {
        let journal = self.sessions.journal().clone();
        tokio::task::spawn_blocking(move || journal.tail()).await?
    }

    /// Journal entries after `after`
    pub async fn journal_entries_after(&self, after: u64, limit: usize) -> Result<Vec<JournalEntry>> {
        let journal = self.sessions.journal().clone();
        tokio::task::spawn_blocking(move || journal.entries_after(after, limit)).await?
    }

    /// Status of every configured peer
    pub fn peer_status(&self) -> Vec<PeerStatus> {
        self.replication.status()
    }
}
