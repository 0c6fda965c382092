//! LMDB-backed storage for zone data, the journal and replication state
//!
//! One environment holds every database so that a data mutation, its journal
//! entry and any cursor update commit in the same write transaction.
//!
//! | database         | key                     | value                          |
//! |------------------|-------------------------|--------------------------------|
//! | `arenas`         | arena                   | `()`                           |
//! | `segments`       | arena                   | segment (dup-sorted)           |
//! | `zones`          | zone                    | [`ZoneLocation`]               |
//! | `segment_zones`  | `arena/segment`         | zone (dup-sorted)              |
//! | `records`        | zone                    | sorted `Vec<Record>`           |
//! | `journal`        | position (BE)           | [`StoredEntry`]                |
//! | `sessions`       | session id (BE)         | owner arena                    |
//! | `session_entries`| session id + entry id   | [`PendingEntry`]               |
//! | `session_outcomes`| session id (BE)        | terminal outcome               |
//! | `sequences`      | sequence name           | last issued value              |
//! | `peer_positions` | peer name               | last applied remote position   |
//! | `peer_acks`      | peer name               | position acknowledged by peer  |
//! | `origin_marks`   | origin node name        | highest applied origin position|

mod dns;

pub use dns::ZoneLocation;

use crate::Result;
use crate::record::Record;
use heed::byteorder::BigEndian;
use heed::types::{Bytes, SerdeBincode, Str, U64, Unit};
use heed::{Database, DatabaseFlags, Env, EnvOpenOptions, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default LMDB map size (1 GiB)
pub const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;

const MAX_DBS: u32 = 16;

/// Big-endian u64 key codec
pub(crate) type BeU64 = U64<BigEndian>;

/// Journal record as persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    /// Node that first committed the action
    pub origin: String,
    /// Position of the action in the origin's journal
    pub origin_position: u64,
    /// Serialized action
    pub action: String,
}

/// A `(do, undo)` pair recorded under an open session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    /// Dump of the action that was applied
    pub do_dump: String,
    /// Dump of the action reverting it
    pub undo_dump: String,
}

/// Handle on the node's LMDB environment and its databases
#[derive(Clone)]
pub struct Store {
    env: Env,
    path: PathBuf,
    pub(crate) arenas: Database<Str, Unit>,
    pub(crate) segments: Database<Str, Str>,
    pub(crate) zones: Database<Str, SerdeBincode<ZoneLocation>>,
    pub(crate) segment_zones: Database<Str, Str>,
    pub(crate) records: Database<Str, SerdeBincode<Vec<Record>>>,
    pub(crate) journal: Database<BeU64, SerdeBincode<StoredEntry>>,
    pub(crate) sessions: Database<BeU64, Str>,
    pub(crate) session_entries: Database<Bytes, SerdeBincode<PendingEntry>>,
    pub(crate) session_outcomes: Database<BeU64, Str>,
    pub(crate) sequences: Database<Str, BeU64>,
    pub(crate) peer_positions: Database<Str, BeU64>,
    pub(crate) peer_acks: Database<Str, BeU64>,
    pub(crate) origin_marks: Database<Str, BeU64>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    /// Open (or create) the store at `path` with the default map size
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_map_size(path, DEFAULT_MAP_SIZE)
    }

    /// Open (or create) the store with an explicit LMDB map size
    pub fn with_map_size<P: AsRef<Path>>(path: P, map_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per path by this process
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(MAX_DBS)
                .open(&path)?
        };

        let mut wtxn = env.write_txn()?;

        let arenas = env.create_database(&mut wtxn, Some("arenas"))?;
        let segments = env
            .database_options()
            .types::<Str, Str>()
            .name("segments")
            .flags(DatabaseFlags::DUP_SORT)
            .create(&mut wtxn)?;
        let zones = env.create_database(&mut wtxn, Some("zones"))?;
        let segment_zones = env
            .database_options()
            .types::<Str, Str>()
            .name("segment_zones")
            .flags(DatabaseFlags::DUP_SORT)
            .create(&mut wtxn)?;
        let records = env.create_database(&mut wtxn, Some("records"))?;
        let journal = env.create_database(&mut wtxn, Some("journal"))?;
        let sessions = env.create_database(&mut wtxn, Some("sessions"))?;
        let session_entries = env.create_database(&mut wtxn, Some("session_entries"))?;
        let session_outcomes = env.create_database(&mut wtxn, Some("session_outcomes"))?;
        let sequences = env.create_database(&mut wtxn, Some("sequences"))?;
        let peer_positions = env.create_database(&mut wtxn, Some("peer_positions"))?;
        let peer_acks = env.create_database(&mut wtxn, Some("peer_acks"))?;
        let origin_marks = env.create_database(&mut wtxn, Some("origin_marks"))?;

        wtxn.commit()?;

        tracing::debug!("Opened store at {:?}", path);

        Ok(Self {
            env,
            path,
            arenas,
            segments,
            zones,
            segment_zones,
            records,
            journal,
            sessions,
            session_entries,
            session_outcomes,
            sequences,
            peer_positions,
            peer_acks,
            origin_marks,
        })
    }

    /// Directory holding the LMDB files
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begin a read transaction
    pub fn read_txn(&self) -> Result<RoTxn<'_>> {
        Ok(self.env.read_txn()?)
    }

    /// Begin a write transaction
    pub fn write_txn(&self) -> Result<RwTxn<'_>> {
        Ok(self.env.write_txn()?)
    }

    /// Current value of a named sequence (0 if never incremented)
    pub fn sequence(&self, txn: &RoTxn, name: &str) -> Result<u64> {
        Ok(self.sequences.get(txn, name)?.unwrap_or(0))
    }

    /// Increment a named sequence and return the new value
    pub fn next_sequence(&self, wtxn: &mut RwTxn, name: &str) -> Result<u64> {
        let next = self.sequences.get(wtxn, name)?.unwrap_or(0) + 1;
        self.sequences.put(wtxn, name, &next)?;
        Ok(next)
    }

    /// Last remote position applied from `peer` (0 if never pulled)
    pub fn peer_position(&self, txn: &RoTxn, peer: &str) -> Result<u64> {
        Ok(self.peer_positions.get(txn, peer)?.unwrap_or(0))
    }

    /// Persist the cursor for `peer`
    pub fn set_peer_position(&self, wtxn: &mut RwTxn, peer: &str, position: u64) -> Result<()> {
        self.peer_positions.put(wtxn, peer, &position)?;
        Ok(())
    }

    /// Position `peer` last acknowledged having applied from this node
    pub fn peer_ack(&self, txn: &RoTxn, peer: &str) -> Result<u64> {
        Ok(self.peer_acks.get(txn, peer)?.unwrap_or(0))
    }

    /// Record an acknowledgement; acknowledgements never move backwards
    pub fn set_peer_ack(&self, wtxn: &mut RwTxn, peer: &str, position: u64) -> Result<()> {
        let current = self.peer_acks.get(wtxn, peer)?.unwrap_or(0);
        if position > current {
            self.peer_acks.put(wtxn, peer, &position)?;
        }
        Ok(())
    }

    /// Highest position already applied for actions first committed on `origin`
    pub fn origin_mark(&self, txn: &RoTxn, origin: &str) -> Result<u64> {
        Ok(self.origin_marks.get(txn, origin)?.unwrap_or(0))
    }

    /// Raise the origin mark
    pub fn set_origin_mark(&self, wtxn: &mut RwTxn, origin: &str, position: u64) -> Result<()> {
        self.origin_marks.put(wtxn, origin, &position)?;
        Ok(())
    }

    /// Run `f` inside a read transaction
    pub fn read<T>(&self, f: impl FnOnce(&RoTxn) -> Result<T>) -> Result<T> {
        let rtxn = self.read_txn()?;
        f(&rtxn)
    }

    /// Cursor for `peer`, in its own read transaction
    pub fn get_peer_position(&self, peer: &str) -> Result<u64> {
        self.read(|txn| self.peer_position(txn, peer))
    }
}
