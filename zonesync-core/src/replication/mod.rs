//! Pull-based peer replication
//!
//! Every node is both a client and a server. As a client it periodically
//! connects to each configured peer and drains that peer's journal from the
//! last applied position; as a server it answers the same requests for its
//! own journal.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  ident / pull_request / position  ┌──────────────┐
//! │    ns1       │ ────────────────────────────────► │     ns2      │
//! │  (client)    │                                   │   (server)   │
//! │              │ ◄──────────────────────────────── │              │
//! └──────────────┘   challenge / actions / wait      └──────────────┘
//! ```
//!
//! A `wait` answer parks the client; the server keeps the connection as an
//! active waiter and pushes the next batch as soon as its journal advances.
//! Pulled batches are applied and journaled locally in one transaction
//! together with the peer cursor, so a batch is applied exactly once and
//! re-replicated downstream with its origin preserved.

pub mod auth;
pub mod client;
pub mod config;
pub mod peer;
pub(crate) mod scheduler;
pub mod server;
pub mod transport;

pub use client::{ClientEffect, ClientMachine, ClientState};
pub use config::{PeerConfig, ReplicationConfig, TlsConfig};
pub use peer::{ConnectionHandle, ConnectionRole, Peer, PeerStatus};
pub use server::{ServerEffect, ServerMachine, ServerState};
pub use transport::Transport;

use crate::journal::PullResult;
use crate::session::SessionManager;
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Resolves once shutdown is signalled or the signal is gone
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Both replication roles for the local node
pub struct ReplicationService {
    config: ReplicationConfig,
    sessions: SessionManager,
    transport: Transport,
    peers: Vec<Arc<Peer>>,
    known: Arc<HashMap<String, PeerConfig>>,
    waiters: Mutex<HashMap<u64, String>>,
    next_conn: AtomicU64,
    shutdown: watch::Receiver<bool>,
}

impl std::fmt::Debug for ReplicationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationService")
            .field("node_name", &self.config.node_name)
            .field("peers", &self.known.len())
            .field("transport", &self.transport)
            .finish()
    }
}

impl ReplicationService {
    /// Service for `config`; stops once `shutdown` turns true
    pub fn new(
        config: ReplicationConfig,
        sessions: SessionManager,
        transport: Transport,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        config.validate()?;
        let peers = config
            .peers
            .iter()
            .cloned()
            .map(|peer| Arc::new(Peer::new(peer)))
            .collect();
        let known = config
            .peers
            .iter()
            .map(|peer| (peer.name.clone(), peer.clone()))
            .collect();

        Ok(Self {
            config,
            sessions,
            transport,
            peers,
            known: Arc::new(known),
            waiters: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            shutdown,
        })
    }

    /// Replication configuration
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Session manager batches are applied through
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Connection factory
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Configured peers
    pub fn peers(&self) -> &[Arc<Peer>] {
        &self.peers
    }

    /// Peer by name
    pub fn peer(&self, name: &str) -> Option<Arc<Peer>> {
        self.peers.iter().find(|p| p.name() == name).cloned()
    }

    pub(crate) fn known_peers(&self) -> Arc<HashMap<String, PeerConfig>> {
        self.known.clone()
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    /// Bind the peer listener
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        tracing::info!(
            "Node {} listening for peers on {}",
            self.config.node_name,
            listener.local_addr()?
        );
        Ok(listener)
    }

    /// Accept peer connections until shutdown
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let mut shutdown = self.shutdown_signal();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_connection(stream, addr),
                    Err(e) => tracing::error!("Accept error: {}", e),
                },
                _ = stopped(&mut shutdown) => {
                    tracing::info!("Peer listener shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    fn spawn_connection(self: &Arc<Self>, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let service = self.clone();
        tokio::spawn(async move {
            tracing::info!("Peer connection from {}", addr);
            let stream = match service.transport.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("Failed to accept connection from {}: {}", addr, e);
                    return;
                }
            };
            let shutdown = service.shutdown_signal();
            if let Err(e) = server::run(&service, stream, addr, shutdown).await {
                tracing::warn!("Connection from {} closed: {}", addr, e);
            } else {
                tracing::info!("Connection from {} closed", addr);
            }
        });
    }

    /// Journal entries after `after`, capped at the batch size
    pub async fn pull(&self, after: u64) -> Result<PullResult> {
        let journal = self.sessions.journal().clone();
        let limit = self.config.max_batch_size;
        tokio::task::spawn_blocking(move || journal.pull(after, limit)).await?
    }

    /// Persist a cursor acknowledged by `peer`
    pub async fn record_ack(&self, peer: &str, position: u64) -> Result<()> {
        let store = self.sessions.store().clone();
        let peer_name = peer.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut wtxn = store.write_txn()?;
            store.set_peer_ack(&mut wtxn, &peer_name, position)?;
            wtxn.commit()?;
            Ok(())
        })
        .await??;
        tracing::debug!("Peer {} acknowledged position {}", peer, position);
        Ok(())
    }

    /// Last position applied from `peer`
    pub async fn cursor(&self, peer: &str) -> Result<u64> {
        let store = self.sessions.store().clone();
        let peer_name = peer.to_string();
        tokio::task::spawn_blocking(move || store.get_peer_position(&peer_name)).await?
    }

    /// Wake active waiters after an out-of-band journal change
    pub async fn notify_database_updated(&self) -> Result<u64> {
        self.sessions.refresh_tail().await
    }

    pub(crate) fn set_waiting(&self, conn_id: u64, peer: Option<&str>, waiting: bool) {
        let mut waiters = self.waiters.lock();
        match peer {
            Some(peer) if waiting => {
                waiters.insert(conn_id, peer.to_string());
            }
            _ => {
                waiters.remove(&conn_id);
            }
        }
    }

    /// Names of peers parked on a `wait`
    pub fn waiting_peers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.waiters.lock().values().cloned().collect();
        names.sort();
        names.dedup();
        names
    }

    /// Status of every configured peer
    pub fn status(&self) -> Vec<PeerStatus> {
        self.peers.iter().map(|peer| peer.status()).collect()
    }
}
