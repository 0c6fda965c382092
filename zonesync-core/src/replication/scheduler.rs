//! Periodic pulls and journal retention

use super::{client, stopped, Peer, ReplicationService};
use crate::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

impl ReplicationService {
    /// Start a pull task for `peer` unless one is already running.
    ///
    /// The task keeps its connection open across `wait`s; when it ends the
    /// pull slot is released so the next tick reconnects from the persisted
    /// cursor.
    pub fn spawn_pull(self: &Arc<Self>, peer: Arc<Peer>) -> bool {
        if !peer.try_start_pull() {
            return false;
        }

        let service = self.clone();
        tokio::spawn(async move {
            let shutdown = service.shutdown_signal();
            match client::run(&service, &peer, shutdown).await {
                Ok(()) => peer.set_error(None),
                Err(e) => {
                    tracing::warn!("Pull from {} failed: {}", peer.name(), e);
                    peer.set_error(Some(e.to_string()));
                }
            }
            peer.finish_pull();
        });
        true
    }

    /// Start pulls for every idle peer; returns how many were started
    pub fn pull_all(self: &Arc<Self>) -> usize {
        self.peers
            .iter()
            .filter(|peer| self.spawn_pull((*peer).clone()))
            .count()
    }

    /// Drop journal entries every configured peer has acknowledged
    pub async fn prune_acknowledged(&self) -> Result<usize> {
        if self.peers.is_empty() {
            return Ok(0);
        }
        let store = self.sessions.store().clone();
        let journal = self.sessions.journal().clone();
        let names: Vec<String> = self.peers.iter().map(|p| p.name().to_string()).collect();

        let removed = tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut wtxn = store.write_txn()?;
            let mut floor = u64::MAX;
            for name in &names {
                floor = floor.min(store.peer_ack(&wtxn, name)?);
            }
            if floor == 0 {
                return Ok(0);
            }
            let removed = journal.prune_through(&mut wtxn, floor)?;
            wtxn.commit()?;
            Ok(removed)
        })
        .await??;

        if removed > 0 {
            tracing::info!("Pruned {} acknowledged journal entries", removed);
        }
        Ok(removed)
    }
}

/// Tick until shutdown, pulling from idle peers each time
pub(crate) async fn run(service: Arc<ReplicationService>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(service.config().pull_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stopped(&mut shutdown) => {
                tracing::info!("Replication scheduler shutting down");
                break;
            }
        }

        let started = service.pull_all();
        if started > 0 {
            tracing::debug!("Started {} pull(s)", started);
        }

        if service.config().prune_journal {
            if let Err(e) = service.prune_acknowledged().await {
                tracing::warn!("Journal pruning failed: {}", e);
            }
        }
    }
}
