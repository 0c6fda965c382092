//! Durable, gapless log of committed actions
//!
//! Positions come from the `journal` sequence rather than the last key, so
//! pruning never causes a position to be handed out twice. Position 0 is
//! never used: it is the cursor of a peer that has pulled nothing yet.

use crate::store::{StoredEntry, Store};
use crate::{Error, Result};
use heed::{RoTxn, RwTxn};
use zonesync_protocol::WireEntry;

const JOURNAL_SEQUENCE: &str = "journal";

/// One committed action with its journal position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// Position in this node's journal
    pub position: u64,
    /// Node where the action was first committed
    pub origin: String,
    /// Position of the action in its origin's journal
    pub origin_position: u64,
    /// Action dump
    pub action: String,
}

impl From<JournalEntry> for WireEntry {
    fn from(entry: JournalEntry) -> Self {
        WireEntry {
            position: entry.position,
            origin: entry.origin,
            origin_position: entry.origin_position,
            action: entry.action,
        }
    }
}

/// Answer to "what comes after position p"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullResult {
    /// `p` is the current tail
    Wait,
    /// `p` is ahead of the tail or older than the retained history
    NoPosition,
    /// Entries after `p`, ascending, batch-capped
    Entries(Vec<JournalEntry>),
}

/// Journal view over the store, stamped with the local node name
#[derive(Debug, Clone)]
pub struct Journal {
    store: Store,
    node_name: String,
}

impl Journal {
    /// Create a journal for the local node `node_name`
    pub fn new(store: Store, node_name: impl Into<String>) -> Self {
        Self {
            store,
            node_name: node_name.into(),
        }
    }

    /// Local node name used as origin of locally committed actions
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Append a locally committed action
    pub fn append(&self, wtxn: &mut RwTxn, action: &str) -> Result<u64> {
        let position = self.store.next_sequence(wtxn, JOURNAL_SEQUENCE)?;
        let entry = StoredEntry {
            origin: self.node_name.clone(),
            origin_position: position,
            action: action.to_string(),
        };
        self.store.journal.put(wtxn, &position, &entry)?;
        Ok(position)
    }

    /// Append an action replicated from another node, keeping its origin
    pub fn append_replicated(
        &self,
        wtxn: &mut RwTxn,
        origin: &str,
        origin_position: u64,
        action: &str,
    ) -> Result<u64> {
        let position = self.store.next_sequence(wtxn, JOURNAL_SEQUENCE)?;
        let entry = StoredEntry {
            origin: origin.to_string(),
            origin_position,
            action: action.to_string(),
        };
        self.store.journal.put(wtxn, &position, &entry)?;
        Ok(position)
    }

    /// Position of the last appended entry (0 for an empty journal)
    pub fn tail_in(&self, txn: &RoTxn) -> Result<u64> {
        self.store.sequence(txn, JOURNAL_SEQUENCE)
    }

    /// Oldest retained position; `tail + 1` when everything was pruned
    pub fn first_retained_in(&self, txn: &RoTxn) -> Result<u64> {
        match self.store.journal.first(txn)? {
            Some((position, _)) => Ok(position),
            None => Ok(self.tail_in(txn)? + 1),
        }
    }

    /// Entries strictly after `after`, at most `limit`
    pub fn entries_after_in(&self, txn: &RoTxn, after: u64, limit: usize) -> Result<Vec<JournalEntry>> {
        let start = after.saturating_add(1);
        let mut out = Vec::new();
        for item in self.store.journal.range(txn, &(start..))? {
            if out.len() >= limit {
                break;
            }
            let (position, stored) = item?;
            out.push(JournalEntry {
                position,
                origin: stored.origin,
                origin_position: stored.origin_position,
                action: stored.action,
            });
        }
        Ok(out)
    }

    /// Decide what a peer asking for entries after `after` receives
    pub fn pull_in(&self, txn: &RoTxn, after: u64, limit: usize) -> Result<PullResult> {
        let tail = self.tail_in(txn)?;
        if after == tail {
            return Ok(PullResult::Wait);
        }
        if after > tail || after + 1 < self.first_retained_in(txn)? {
            return Ok(PullResult::NoPosition);
        }
        let entries = self.entries_after_in(txn, after, limit)?;
        if entries.first().map(|e| e.position) != Some(after + 1) {
            return Err(Error::storage(format!(
                "journal gap after position {}",
                after
            )));
        }
        Ok(PullResult::Entries(entries))
    }

    /// Drop every entry at or below `position`; returns the number removed
    pub fn prune_through(&self, wtxn: &mut RwTxn, position: u64) -> Result<usize> {
        let removed = self.store.journal.delete_range(wtxn, &(..=position))?;
        Ok(removed)
    }

    /// Current tail
    pub fn tail(&self) -> Result<u64> {
        self.store.read(|txn| self.tail_in(txn))
    }

    /// Entries after `after`
    pub fn entries_after(&self, after: u64, limit: usize) -> Result<Vec<JournalEntry>> {
        self.store.read(|txn| self.entries_after_in(txn, after, limit))
    }

    /// Pull decision in its own read transaction
    pub fn pull(&self, after: u64, limit: usize) -> Result<PullResult> {
        self.store.read(|txn| self.pull_in(txn, after, limit))
    }
}
