//! zonesync core - clustered DNS zone store
//!
//! Each node keeps DNS data (arenas, segments, zones, records) in a local
//! LMDB store and converges with its peers by pulling their action journals.
//!
//! - Reversible, serializable actions with a closed registry
//! - A gapless journal of committed actions, tagged with their origin node
//! - Sessions grouping actions into atomic commit/rollback units, with idle
//!   watchdogs and lock release
//! - Pull-based peer replication with PAP/CHAP authentication and
//!   event-driven `wait` pushes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │          Zone Operations                     │
//! │     (lock → session → apply → commit)       │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │   Session Manager          Replication       │
//! │ (watchdogs, rollback)  (client/server roles) │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │        Actions + Journal                     │
//! │   (do/undo pairs, origin-tagged positions)  │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │           Storage Layer                      │
//! │      (LMDB: zone data, journal, cursors)    │
//! └─────────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod action;
pub mod error;
pub mod journal;
pub mod lock;
pub mod node;
pub mod ops;
pub mod record;
pub mod replication;
pub mod session;
pub mod state_hash;
pub mod store;
pub mod testing;

pub use error::{Error, Result};
pub use node::{Node, NodeConfig};
