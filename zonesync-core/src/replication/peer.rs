//! Configured remote nodes and their live connection state
//!
//! A [`Peer`] lives for the whole process. Connections come and go; the peer
//! only keeps a small handle per direction, and connection tasks refer back
//! to their peer by name.

use crate::replication::config::PeerConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Which side of the protocol this node plays on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// We pull from the peer
    Client,
    /// The peer pulls from us
    Server,
}

/// Lightweight description of a live connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    /// Process-unique connection id
    pub id: u64,
    /// Our role on the connection
    pub role: ConnectionRole,
    /// When the connection was established
    pub connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    /// Handle for a connection opened now
    pub fn new(id: u64, role: ConnectionRole) -> Self {
        Self {
            id,
            role,
            connected_at: Utc::now(),
        }
    }
}

/// Snapshot of a peer for status reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    /// Peer name
    pub name: String,
    /// Whether our pull connection is up
    pub connected: bool,
    /// Whether a pull task is running
    pub pull_in_progress: bool,
    /// Our pull connection
    pub outbound: Option<ConnectionHandle>,
    /// The peer's pull connection to us
    pub inbound: Option<ConnectionHandle>,
    /// Last error seen on the pull connection
    pub last_error: Option<String>,
}

/// A configured remote node
#[derive(Debug)]
pub struct Peer {
    config: PeerConfig,
    pull_in_progress: AtomicBool,
    outbound: Mutex<Option<ConnectionHandle>>,
    inbound: Mutex<Option<ConnectionHandle>>,
    last_error: Mutex<Option<String>>,
}

impl Peer {
    /// Create a peer from configuration
    pub fn new(config: PeerConfig) -> Self {
        Self {
            config,
            pull_in_progress: AtomicBool::new(false),
            outbound: Mutex::new(None),
            inbound: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    /// Peer name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Peer configuration
    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Claim the pull slot; false if a pull is already running
    pub fn try_start_pull(&self) -> bool {
        self.pull_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the pull slot
    pub fn finish_pull(&self) {
        self.pull_in_progress.store(false, Ordering::Release);
    }

    /// Whether a pull task is running
    pub fn is_pulling(&self) -> bool {
        self.pull_in_progress.load(Ordering::Acquire)
    }

    /// Whether our pull connection is up
    pub fn is_connected(&self) -> bool {
        self.outbound.lock().is_some()
    }

    /// Record a newly established connection
    pub fn attach(&self, handle: ConnectionHandle) {
        let slot = match handle.role {
            ConnectionRole::Client => &self.outbound,
            ConnectionRole::Server => &self.inbound,
        };
        *slot.lock() = Some(handle);
    }

    /// Forget connection `id` if it is still the current one
    pub fn detach(&self, id: u64) {
        for slot in [&self.outbound, &self.inbound] {
            let mut slot = slot.lock();
            if slot.as_ref().map(|h| h.id) == Some(id) {
                *slot = None;
            }
        }
    }

    /// Remember the last pull failure, or clear it
    pub fn set_error(&self, error: Option<String>) {
        *self.last_error.lock() = error;
    }

    /// Last pull failure
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Status snapshot
    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            name: self.config.name.clone(),
            connected: self.is_connected(),
            pull_in_progress: self.is_pulling(),
            outbound: self.outbound.lock().clone(),
            inbound: self.inbound.lock().clone(),
            last_error: self.last_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer::new(PeerConfig::new("ns2", "127.0.0.1", 15353, "k"))
    }

    #[test]
    fn test_pull_slot_is_exclusive() {
        let peer = peer();
        assert!(peer.try_start_pull());
        assert!(!peer.try_start_pull());
        peer.finish_pull();
        assert!(peer.try_start_pull());
    }

    #[test]
    fn test_detach_only_current_connection() {
        let peer = peer();
        peer.attach(ConnectionHandle::new(1, ConnectionRole::Client));
        peer.attach(ConnectionHandle::new(2, ConnectionRole::Client));
        peer.detach(1);
        assert!(peer.is_connected());
        peer.detach(2);
        assert!(!peer.is_connected());
    }

    #[test]
    fn test_status_reports_both_directions() {
        let peer = peer();
        peer.attach(ConnectionHandle::new(7, ConnectionRole::Server));
        peer.set_error(Some("connection refused".into()));

        let status = peer.status();
        assert!(!status.connected);
        assert_eq!(status.inbound.map(|h| h.id), Some(7));
        assert_eq!(status.last_error.as_deref(), Some("connection refused"));
    }
}
