//! Applying batches pulled from a peer
//!
//! A batch, the resulting local journal entries and the peer cursor commit in
//! one write transaction. If any action fails, nothing of the batch sticks
//! and the cursor stays where it was, so the next pull retries it.
//!
//! Every resource a batch touches is locked first, under the peer's
//! replication owner, so pulled actions never build on the uncommitted state
//! of a local session.

use super::{Finished, Inner, SessionManager};
use crate::Result;
use std::collections::BTreeSet;
use zonesync_protocol::WireEntry;

/// Lock owner name used while applying a batch from `peer`
pub fn replication_owner(peer: &str) -> String {
    format!("replication:{}", peer)
}

/// Result of applying one pulled batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchOutcome {
    /// Cursor persisted for the peer after the batch
    pub cursor: u64,
    /// Entries applied and journaled locally
    pub applied: usize,
    /// Entries skipped as already seen or locally originated
    pub skipped: usize,
}

impl Inner {
    fn resource_paths(&self, entries: &[WireEntry]) -> Result<BTreeSet<String>> {
        entries
            .iter()
            .map(|entry| Ok(self.registry.load(&entry.action)?.resource_path()))
            .collect()
    }

    fn apply_remote(&self, peer: &str, mut entries: Vec<WireEntry>) -> Result<(BatchOutcome, Finished)> {
        entries.sort_by_key(|e| e.position);

        let mut wtxn = self.store.write_txn()?;
        let cursor = self.store.peer_position(&wtxn, peer)?;
        let mut outcome = BatchOutcome {
            cursor,
            ..Default::default()
        };
        let mut finished = Finished {
            positions: Vec::new(),
            paths: Vec::new(),
        };

        for entry in &entries {
            if entry.position <= cursor {
                outcome.skipped += 1;
                continue;
            }
            outcome.cursor = outcome.cursor.max(entry.position);

            if entry.origin == self.journal.node_name() {
                outcome.skipped += 1;
                continue;
            }
            let mark = self.store.origin_mark(&wtxn, &entry.origin)?;
            if entry.origin_position <= mark {
                outcome.skipped += 1;
                continue;
            }

            let action = self.registry.load(&entry.action)?;
            if let Err(e) = action.apply(&self.store, &mut wtxn) {
                tracing::error!(
                    "Batch from {} aborted at position {} ({}): {}",
                    peer,
                    entry.position,
                    action,
                    e
                );
                return Err(e);
            }
            let position = self.journal.append_replicated(
                &mut wtxn,
                &entry.origin,
                entry.origin_position,
                &entry.action,
            )?;
            self.store
                .set_origin_mark(&mut wtxn, &entry.origin, entry.origin_position)?;

            outcome.applied += 1;
            finished.positions.push(position);
            finished.paths.push(action.resource_path());
        }

        if outcome.cursor > cursor {
            self.store.set_peer_position(&mut wtxn, peer, outcome.cursor)?;
        }
        wtxn.commit()?;

        Ok((outcome, finished))
    }
}

impl SessionManager {
    /// Apply entries pulled from `peer` and advance its cursor atomically.
    ///
    /// Entries at or below the current cursor are ignored, so replaying a
    /// batch is a no-op. If a touched resource stays locked by a session
    /// past the configured retries, the batch fails with a lock error and
    /// nothing is applied.
    pub async fn apply_remote_batch(&self, peer: &str, entries: Vec<WireEntry>) -> Result<BatchOutcome> {
        let owner = replication_owner(peer);
        let paths = self.inner.resource_paths(&entries)?;
        let config = &self.inner.config;

        for path in &paths {
            if let Err(e) = self
                .inner
                .locks
                .acquire(path, &owner, config.lock_retries, config.lock_retry_delay)
                .await
            {
                self.inner.locks.release_all(&owner);
                tracing::warn!("Batch from {} deferred: {}", peer, e);
                return Err(e);
            }
        }

        let peer_name = peer.to_string();
        let result = self
            .blocking(move |inner| inner.apply_remote(&peer_name, entries))
            .await;
        self.inner.locks.release_all(&owner);
        let (outcome, finished) = result?;

        if outcome.applied > 0 {
            tracing::info!(
                "Applied {} action(s) from {}, cursor now {}",
                outcome.applied,
                peer,
                outcome.cursor
            );
        }
        self.inner.publish(&finished);
        Ok(outcome)
    }
}
