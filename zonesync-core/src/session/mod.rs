//! Session management for grouped, reversible writes
//!
//! A session collects `(do, undo)` action pairs. Each pair is recorded in the
//! same LMDB transaction that applies the do-action, so the store never holds
//! a mutation without its undo. Commit moves the do-dumps into the journal in
//! application order; rollback replays the undo-dumps newest first. A session
//! left idle past its timeout is rolled back by a watchdog task, which also
//! frees the locks it held.
//!
//! All storage work runs on the blocking pool; the async methods only wait
//! for it.

mod remote;

pub use remote::{BatchOutcome, replication_owner};

use crate::action::{Action, ActionRegistry};
use crate::journal::Journal;
use crate::lock::LockManager;
use crate::state_hash::StateHashSink;
use crate::store::{PendingEntry, Store};
use crate::{Error, Result};
use heed::{RoTxn, RwTxn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Session ID type
pub type SessionId = u64;

const SESSION_SEQUENCE: &str = "session";
const ENTRY_SEQUENCE: &str = "session_entry";

/// Session tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which an open session is rolled back
    #[serde(rename = "idle_timeout_ms", with = "serde_millis")]
    pub idle_timeout: Duration,
    /// Extra lock attempts before an operation gives up
    pub lock_retries: u32,
    /// Pause between lock attempts
    #[serde(rename = "lock_retry_delay_ms", with = "serde_millis")]
    pub lock_retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(20),
            lock_retries: 10,
            lock_retry_delay: Duration::from_millis(100),
        }
    }
}

/// Terminal session states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Pending actions reached the journal
    Committed,
    /// Pending actions were undone
    RolledBack,
}

impl SessionOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "committed" => Some(Self::Committed),
            "rolled back" => Some(Self::RolledBack),
            _ => None,
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock owner name used for everything a session holds
pub fn session_owner(id: SessionId) -> String {
    format!("session:{}", id)
}

fn entry_key(session: SessionId, entry: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&session.to_be_bytes());
    key[8..].copy_from_slice(&entry.to_be_bytes());
    key
}

struct Watchdog {
    generation: u64,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Store,
    journal: Journal,
    registry: Arc<ActionRegistry>,
    locks: LockManager,
    config: SessionConfig,
    state_hash: Arc<dyn StateHashSink>,
    watchdogs: Mutex<HashMap<SessionId, Watchdog>>,
    generation: AtomicU64,
    tail_tx: watch::Sender<u64>,
}

/// What a commit or rollback changed
struct Finished {
    positions: Vec<u64>,
    paths: Vec<String>,
}

impl Inner {
    fn recorded_outcome(&self, txn: &RoTxn, id: SessionId) -> Result<Option<SessionOutcome>> {
        Ok(self
            .store
            .session_outcomes
            .get(txn, &id)?
            .and_then(SessionOutcome::parse))
    }

    fn ensure_live(&self, txn: &RoTxn, id: SessionId) -> Result<()> {
        match self.recorded_outcome(txn, id)? {
            Some(outcome) => Err(Error::session(format!("session {} already {}", id, outcome))),
            None => Ok(()),
        }
    }

    fn finish(&self, wtxn: &mut RwTxn, id: SessionId, outcome: SessionOutcome) -> Result<()> {
        self.store.session_outcomes.put(wtxn, &id, outcome.as_str())?;
        Ok(())
    }

    fn not_found(id: SessionId) -> Error {
        Error::session(format!("session {} not found", id))
    }

    fn pending(&self, txn: &RoTxn, id: SessionId, newest_first: bool) -> Result<Vec<(Vec<u8>, PendingEntry)>> {
        let prefix = id.to_be_bytes();
        let mut out = Vec::new();
        if newest_first {
            for item in self.store.session_entries.rev_prefix_iter(txn, &prefix[..])? {
                let (key, entry) = item?;
                out.push((key.to_vec(), entry));
            }
        } else {
            for item in self.store.session_entries.prefix_iter(txn, &prefix[..])? {
                let (key, entry) = item?;
                out.push((key.to_vec(), entry));
            }
        }
        Ok(out)
    }

    fn begin(&self, owner: &str) -> Result<SessionId> {
        let mut wtxn = self.store.write_txn()?;
        let id = self.store.next_sequence(&mut wtxn, SESSION_SEQUENCE)?;
        self.store.sessions.put(&mut wtxn, &id, owner)?;
        wtxn.commit()?;
        tracing::debug!("Session {} opened for arena {}", id, owner);
        Ok(id)
    }

    fn apply(&self, id: SessionId, do_action: &Action, undo_action: &Action) -> Result<()> {
        let pending = PendingEntry {
            do_dump: do_action.dump()?,
            undo_dump: undo_action.dump()?,
        };

        let mut wtxn = self.store.write_txn()?;
        self.ensure_live(&wtxn, id)?;
        if self.store.sessions.get(&wtxn, &id)?.is_none() {
            return Err(Self::not_found(id));
        }
        do_action.apply(&self.store, &mut wtxn)?;
        let entry = self.store.next_sequence(&mut wtxn, ENTRY_SEQUENCE)?;
        self.store
            .session_entries
            .put(&mut wtxn, &entry_key(id, entry)[..], &pending)?;
        wtxn.commit()?;

        tracing::debug!("Session {}: applied {}", id, do_action);
        Ok(())
    }

    fn commit(&self, id: SessionId) -> Result<Finished> {
        let mut wtxn = self.store.write_txn()?;
        self.ensure_live(&wtxn, id)?;
        if !self.store.sessions.delete(&mut wtxn, &id)? {
            return Err(Self::not_found(id));
        }

        let entries = self.pending(&wtxn, id, false)?;
        let mut finished = Finished {
            positions: Vec::with_capacity(entries.len()),
            paths: Vec::with_capacity(entries.len()),
        };
        for (key, entry) in entries {
            let position = self.journal.append(&mut wtxn, &entry.do_dump)?;
            self.store.session_entries.delete(&mut wtxn, &key[..])?;
            finished.positions.push(position);
            finished
                .paths
                .push(self.registry.load(&entry.do_dump)?.resource_path());
        }
        self.finish(&mut wtxn, id, SessionOutcome::Committed)?;
        wtxn.commit()?;

        tracing::info!(
            "Session {} committed {} action(s)",
            id,
            finished.positions.len()
        );
        Ok(finished)
    }

    /// Undo pending entries newest first.
    ///
    /// With `force`, an undo whose precondition no longer holds is skipped
    /// and its do-action stays in effect; the session still terminates.
    /// Without it, such an undo aborts the rollback and the session stays
    /// open.
    fn rollback(&self, id: SessionId, force: bool) -> Result<Finished> {
        let mut wtxn = self.store.write_txn()?;
        self.ensure_live(&wtxn, id)?;
        if !self.store.sessions.delete(&mut wtxn, &id)? {
            return Err(Self::not_found(id));
        }

        let entries = self.pending(&wtxn, id, true)?;
        let mut paths = Vec::with_capacity(entries.len());
        for (key, entry) in entries {
            let undo = self.registry.load(&entry.undo_dump)?;
            match undo.apply(&self.store, &mut wtxn) {
                Ok(()) => paths.push(undo.resource_path()),
                Err(e) if force && e.is_action() => {
                    tracing::error!(
                        "Session {}: undo {} no longer applies, keeping {}: {}",
                        id,
                        undo,
                        entry.do_dump,
                        e
                    );
                }
                Err(e) => {
                    tracing::error!("Session {}: undo {} failed: {}", id, undo, e);
                    return Err(e);
                }
            }
            self.store.session_entries.delete(&mut wtxn, &key[..])?;
        }
        self.finish(&mut wtxn, id, SessionOutcome::RolledBack)?;
        wtxn.commit()?;

        tracing::info!("Session {} rolled back {} action(s)", id, paths.len());
        Ok(Finished {
            positions: Vec::new(),
            paths,
        })
    }

    fn ensure_open(&self, id: SessionId) -> Result<()> {
        self.store.read(|txn| {
            self.ensure_live(txn, id)?;
            match self.store.sessions.get(txn, &id)? {
                Some(_) => Ok(()),
                None => Err(Self::not_found(id)),
            }
        })
    }

    fn open_ids(&self) -> Result<Vec<SessionId>> {
        self.store.read(|txn| {
            let mut ids = Vec::new();
            for item in self.store.sessions.iter(txn)? {
                let (id, _) = item?;
                ids.push(id);
            }
            Ok(ids)
        })
    }

    fn publish(&self, finished: &Finished) {
        if let Some(&last) = finished.positions.last() {
            self.tail_tx.send_replace(last);
        }
        if !finished.paths.is_empty() {
            self.state_hash.invalidate(&finished.paths);
        }
    }
}

/// Owns session lifecycles, watchdogs and journal notifications
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a manager; the journal tail is read once to seed subscribers
    pub fn new(
        store: Store,
        journal: Journal,
        registry: Arc<ActionRegistry>,
        locks: LockManager,
        config: SessionConfig,
        state_hash: Arc<dyn StateHashSink>,
    ) -> Result<Self> {
        let tail = journal.tail()?;
        let (tail_tx, _) = watch::channel(tail);
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                journal,
                registry,
                locks,
                config,
                state_hash,
                watchdogs: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                tail_tx,
            }),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner)).await?
    }

    /// Store handle
    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Journal handle
    pub fn journal(&self) -> &Journal {
        &self.inner.journal
    }

    /// Action registry
    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.inner.registry
    }

    /// Lock table
    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    /// Session tuning
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Receiver updated with the journal tail after every commit
    pub fn subscribe_tail(&self) -> watch::Receiver<u64> {
        self.inner.tail_tx.subscribe()
    }

    /// Re-read the journal tail and wake subscribers if it moved
    pub async fn refresh_tail(&self) -> Result<u64> {
        let tail = self.blocking(|inner| inner.journal.tail()).await?;
        self.inner.tail_tx.send_if_modified(|current| {
            if *current == tail {
                return false;
            }
            *current = tail;
            true
        });
        Ok(tail)
    }

    /// Open a session for `owner` and arm its watchdog
    pub async fn begin_session(&self, owner: &str) -> Result<SessionId> {
        let owner = owner.to_string();
        let id = self.blocking(move |inner| inner.begin(&owner)).await?;
        self.arm_watchdog(id);
        Ok(id)
    }

    /// Apply `do_action` now and remember `undo_action` for rollback
    pub async fn apply_action(&self, id: SessionId, do_action: Action, undo_action: Action) -> Result<()> {
        self.blocking(move |inner| inner.apply(id, &do_action, &undo_action))
            .await?;
        self.rearm_if_watched(id);
        Ok(())
    }

    /// Move pending actions into the journal; returns their positions
    pub async fn commit(&self, id: SessionId) -> Result<Vec<u64>> {
        let finished = self.blocking(move |inner| inner.commit(id)).await?;
        self.disarm(id);
        self.inner.publish(&finished);
        Ok(finished.positions)
    }

    /// Undo pending actions newest first; returns how many were undone
    pub async fn rollback(&self, id: SessionId) -> Result<usize> {
        let finished = self.blocking(move |inner| inner.rollback(id, false)).await?;
        self.disarm(id);
        self.inner.publish(&finished);
        Ok(finished.paths.len())
    }

    /// Postpone the idle watchdog of an open session
    pub async fn keepalive(&self, id: SessionId) -> Result<()> {
        self.blocking(move |inner| inner.ensure_open(id)).await?;
        self.arm_watchdog(id);
        Ok(())
    }

    /// Terminal state of a finished session, `None` while open or unknown
    pub fn outcome(&self, id: SessionId) -> Result<Option<SessionOutcome>> {
        self.inner
            .store
            .read(|txn| self.inner.recorded_outcome(txn, id))
    }

    /// Roll back sessions left open by a previous process.
    ///
    /// A session that cannot be rolled back is logged and left for the next
    /// start; the others are still recovered.
    pub async fn recover(&self) -> Result<usize> {
        let ids = self.blocking(|inner| inner.open_ids()).await?;
        let mut recovered = 0;
        for id in ids {
            tracing::warn!("Rolling back session {} left open by a previous run", id);
            match self.blocking(move |inner| inner.rollback(id, true)).await {
                Ok(finished) => {
                    self.inner.publish(&finished);
                    recovered += 1;
                }
                Err(e) => tracing::error!("Recovery of session {} failed: {}", id, e),
            }
        }
        Ok(recovered)
    }

    fn arm_watchdog(&self, id: SessionId) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let timeout = self.inner.config.idle_timeout;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                SessionManager { inner }.expire(id, generation).await;
            }
        });

        let previous = self
            .inner
            .watchdogs
            .lock()
            .insert(id, Watchdog { generation, handle });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    fn rearm_if_watched(&self, id: SessionId) {
        let watched = self.inner.watchdogs.lock().contains_key(&id);
        if watched {
            self.arm_watchdog(id);
        }
    }

    fn disarm(&self, id: SessionId) {
        if let Some(watchdog) = self.inner.watchdogs.lock().remove(&id) {
            watchdog.handle.abort();
        }
    }

    async fn expire(&self, id: SessionId, generation: u64) {
        {
            let mut watchdogs = self.inner.watchdogs.lock();
            // A keepalive or commit since this timer was armed supersedes it
            if watchdogs.get(&id).map(|w| w.generation) != Some(generation) {
                return;
            }
            watchdogs.remove(&id);
        }

        tracing::warn!(
            "Session {} idle for {:?}, rolling back",
            id,
            self.inner.config.idle_timeout
        );
        match self.blocking(move |inner| inner.rollback(id, true)).await {
            Ok(finished) => self.inner.publish(&finished),
            Err(e) => tracing::error!("Rollback of expired session {} failed: {}", id, e),
        }

        let released = self.inner.locks.release_all(&session_owner(id));
        if released > 0 {
            tracing::debug!("Released {} lock(s) of expired session {}", released, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestContext;

    fn create_arena(arena: &str) -> (Action, Action) {
        let action = Action::CreateArena {
            arena: arena.to_string(),
        };
        let undo = action.invert();
        (action, undo)
    }

    #[tokio::test]
    async fn test_begin_allocates_fresh_ids() {
        let ctx = TestContext::new();
        let sessions = ctx.session_manager().unwrap();
        let a = sessions.begin_session("acme").await.unwrap();
        let b = sessions.begin_session("acme").await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_commit_appends_in_order() {
        let ctx = TestContext::new();
        let sessions = ctx.session_manager().unwrap();
        let mut tail = sessions.subscribe_tail();

        let id = sessions.begin_session("acme").await.unwrap();
        for arena in ["a1", "a2", "a3"] {
            let (d, u) = create_arena(arena);
            sessions.apply_action(id, d, u).await.unwrap();
        }
        let positions = sessions.commit(id).await.unwrap();
        assert_eq!(positions, vec![1, 2, 3]);

        let entries = sessions.journal().entries_after(0, 10).unwrap();
        let names: Vec<_> = entries
            .iter()
            .map(|e| sessions.registry().load(&e.action).unwrap().arena().to_string())
            .collect();
        assert_eq!(names, vec!["a1", "a2", "a3"]);

        assert!(tail.has_changed().unwrap());
        assert_eq!(*tail.borrow_and_update(), 3);
    }

    #[tokio::test]
    async fn test_rollback_reverts_and_skips_journal() {
        let ctx = TestContext::new();
        let sessions = ctx.session_manager().unwrap();
        let store = sessions.store().clone();

        let id = sessions.begin_session("acme").await.unwrap();
        let (d, u) = create_arena("acme");
        sessions.apply_action(id, d, u).await.unwrap();
        let seg = Action::CreateSegment {
            arena: "acme".into(),
            segment: "s1".into(),
        };
        sessions.apply_action(id, seg.clone(), seg.invert()).await.unwrap();
        assert_eq!(store.get_arenas().unwrap(), vec!["acme"]);

        assert_eq!(sessions.rollback(id).await.unwrap(), 2);
        assert!(store.get_arenas().unwrap().is_empty());
        assert_eq!(sessions.journal().tail().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_apply_records_nothing() {
        let ctx = TestContext::new();
        let sessions = ctx.session_manager().unwrap();

        let id = sessions.begin_session("acme").await.unwrap();
        let orphan = Action::CreateSegment {
            arena: "acme".into(),
            segment: "s1".into(),
        };
        let err = sessions
            .apply_action(id, orphan.clone(), orphan.invert())
            .await
            .unwrap_err();
        assert!(err.is_action());

        // Nothing pending, so rollback has nothing to undo
        assert_eq!(sessions.rollback(id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sessions_are_use_once() {
        let ctx = TestContext::new();
        let sessions = ctx.session_manager().unwrap();

        let id = sessions.begin_session("acme").await.unwrap();
        sessions.commit(id).await.unwrap();
        assert_eq!(sessions.outcome(id).unwrap(), Some(SessionOutcome::Committed));

        let err = sessions.rollback(id).await.unwrap_err();
        assert_eq!(err.to_string(), format!("Session error: session {} already committed", id));
        let (d, u) = create_arena("acme");
        assert!(sessions.apply_action(id, d, u).await.is_err());
        assert!(sessions.keepalive(id).await.is_err());

        let err = sessions.keepalive(9999).await.unwrap_err();
        assert_eq!(err.to_string(), "Session error: session 9999 not found");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_is_rolled_back_and_unlocked() {
        let ctx = TestContext::new();
        let sessions = ctx.session_manager().unwrap();
        let store = sessions.store().clone();

        let id = sessions.begin_session("acme").await.unwrap();
        assert!(sessions.locks().try_acquire("/acme", &session_owner(id)));
        let (d, u) = create_arena("acme");
        sessions.apply_action(id, d, u).await.unwrap();

        tokio::time::sleep(Duration::from_secs(15)).await;
        sessions.keepalive(id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(sessions.outcome(id).unwrap(), None);

        tokio::time::sleep(Duration::from_secs(10)).await;
        for _ in 0..50 {
            if sessions.outcome(id).unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sessions.outcome(id).unwrap(), Some(SessionOutcome::RolledBack));
        assert!(store.get_arenas().unwrap().is_empty());
        assert!(sessions.locks().holder("/acme").is_none());
    }

    #[tokio::test]
    async fn test_recover_rolls_back_open_markers() {
        let ctx = TestContext::new();
        let sessions = ctx.session_manager().unwrap();
        let id = sessions.begin_session("acme").await.unwrap();
        let (d, u) = create_arena("acme");
        sessions.apply_action(id, d, u).await.unwrap();

        // A second manager over the same store stands in for a restarted process
        let restarted = ctx.session_manager().unwrap();
        assert_eq!(restarted.recover().await.unwrap(), 1);
        assert!(restarted.store().get_arenas().unwrap().is_empty());
        assert_eq!(restarted.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_outcome_survives_restart() {
        let ctx = TestContext::new();
        let sessions = ctx.session_manager().unwrap();
        let committed = sessions.begin_session("acme").await.unwrap();
        sessions.commit(committed).await.unwrap();
        let rolled_back = sessions.begin_session("acme").await.unwrap();
        sessions.rollback(rolled_back).await.unwrap();

        let restarted = ctx.session_manager().unwrap();
        assert_eq!(
            restarted.outcome(committed).unwrap(),
            Some(SessionOutcome::Committed)
        );
        let err = restarted.commit(rolled_back).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Session error: session {} already rolled back", rolled_back)
        );
        assert_eq!(restarted.outcome(9999).unwrap(), None);
    }

    #[tokio::test]
    async fn test_recover_keeps_effects_that_others_built_on() {
        let ctx = TestContext::new();
        let sessions = ctx.session_manager().unwrap();
        let store = sessions.store().clone();

        let stuck = sessions.begin_session("acme").await.unwrap();
        let (d, u) = create_arena("acme");
        sessions.apply_action(stuck, d, u).await.unwrap();
        let other = sessions.begin_session("beta").await.unwrap();
        let (d, u) = create_arena("beta");
        sessions.apply_action(other, d, u).await.unwrap();

        // A segment committed on top of the open arena makes its undo fail
        let seg = Action::CreateSegment {
            arena: "acme".into(),
            segment: "s1".into(),
        };
        let id = sessions.begin_session("acme").await.unwrap();
        sessions.apply_action(id, seg.clone(), seg.invert()).await.unwrap();
        sessions.commit(id).await.unwrap();

        assert!(sessions.rollback(stuck).await.is_err());
        assert_eq!(sessions.outcome(stuck).unwrap(), None);

        let restarted = ctx.session_manager().unwrap();
        assert_eq!(restarted.recover().await.unwrap(), 2);
        assert_eq!(store.get_arenas().unwrap(), vec!["acme"]);
        assert_eq!(store.get_segments("acme").unwrap(), vec!["s1"]);
        assert_eq!(
            restarted.outcome(stuck).unwrap(),
            Some(SessionOutcome::RolledBack)
        );
        assert_eq!(restarted.recover().await.unwrap(), 0);
    }
}
