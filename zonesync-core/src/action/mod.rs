//! Reversible, serializable store mutations
//!
//! Every change to zone data is expressed as an [`Action`]. Each variant has
//! a paired opposite ([`Action::invert`]) so that applying an action and then
//! its inverse leaves the store exactly as it was. Deletes only succeed on
//! empty entities, which is what keeps the pairs exact inverses; cascades are
//! assembled by the operations layer as several pairs.
//!
//! Dumps are JSON objects `{"name": "...", "fields": {...}}` with string
//! values, e.g.
//!
//! ```text
//! {"name":"add_zone","fields":{"arena":"acme","segment":"s1","zone":"example.com"}}
//! ```

mod registry;

pub use registry::{ActionKind, ActionRegistry};

use crate::record::Record;
use crate::store::{Store, ZoneLocation};
use crate::{Error, Result};
use heed::RwTxn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A store mutation with a known inverse
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Create an arena
    CreateArena {
        /// Arena name
        arena: String,
    },
    /// Delete an empty arena
    DeleteArena {
        /// Arena name
        arena: String,
    },
    /// Create a segment in an existing arena
    CreateSegment {
        /// Arena name
        arena: String,
        /// Segment name
        segment: String,
    },
    /// Delete an empty segment
    DeleteSegment {
        /// Arena name
        arena: String,
        /// Segment name
        segment: String,
    },
    /// Create a zone in an existing segment
    AddZone {
        /// Arena name
        arena: String,
        /// Segment name
        segment: String,
        /// Zone name
        zone: String,
    },
    /// Delete a zone without records
    DelZone {
        /// Arena name
        arena: String,
        /// Segment name
        segment: String,
        /// Zone name
        zone: String,
    },
    /// Add a record to a zone
    AddRecord {
        /// Arena name
        arena: String,
        /// Segment name
        segment: String,
        /// Zone name
        zone: String,
        /// Record to add
        record: Record,
    },
    /// Remove a record from a zone
    DelRecord {
        /// Arena name
        arena: String,
        /// Segment name
        segment: String,
        /// Zone name
        zone: String,
        /// Record to remove
        record: Record,
    },
}

/// Serialized form of an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ActionDump {
    pub name: String,
    pub fields: BTreeMap<String, String>,
}

impl Action {
    /// Registered action name
    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Kind of this action
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::CreateArena { .. } => ActionKind::CreateArena,
            Self::DeleteArena { .. } => ActionKind::DeleteArena,
            Self::CreateSegment { .. } => ActionKind::CreateSegment,
            Self::DeleteSegment { .. } => ActionKind::DeleteSegment,
            Self::AddZone { .. } => ActionKind::AddZone,
            Self::DelZone { .. } => ActionKind::DelZone,
            Self::AddRecord { record, .. } => ActionKind::AddRecord(record.rtype),
            Self::DelRecord { record, .. } => ActionKind::DelRecord(record.rtype),
        }
    }

    /// Arena the action belongs to
    pub fn arena(&self) -> &str {
        match self {
            Self::CreateArena { arena }
            | Self::DeleteArena { arena }
            | Self::CreateSegment { arena, .. }
            | Self::DeleteSegment { arena, .. }
            | Self::AddZone { arena, .. }
            | Self::DelZone { arena, .. }
            | Self::AddRecord { arena, .. }
            | Self::DelRecord { arena, .. } => arena,
        }
    }

    /// Hierarchical resource path touched by the action
    pub fn resource_path(&self) -> String {
        match self {
            Self::CreateArena { arena } | Self::DeleteArena { arena } => format!("/{}", arena),
            Self::CreateSegment { arena, segment } | Self::DeleteSegment { arena, segment } => {
                format!("/{}/{}", arena, segment)
            }
            Self::AddZone {
                arena,
                segment,
                zone,
            }
            | Self::DelZone {
                arena,
                segment,
                zone,
            }
            | Self::AddRecord {
                arena,
                segment,
                zone,
                ..
            }
            | Self::DelRecord {
                arena,
                segment,
                zone,
                ..
            } => format!("/{}/{}/{}", arena, segment, zone),
        }
    }

    /// The opposite action over the same fields
    pub fn invert(&self) -> Action {
        match self.clone() {
            Self::CreateArena { arena } => Self::DeleteArena { arena },
            Self::DeleteArena { arena } => Self::CreateArena { arena },
            Self::CreateSegment { arena, segment } => Self::DeleteSegment { arena, segment },
            Self::DeleteSegment { arena, segment } => Self::CreateSegment { arena, segment },
            Self::AddZone {
                arena,
                segment,
                zone,
            } => Self::DelZone {
                arena,
                segment,
                zone,
            },
            Self::DelZone {
                arena,
                segment,
                zone,
            } => Self::AddZone {
                arena,
                segment,
                zone,
            },
            Self::AddRecord {
                arena,
                segment,
                zone,
                record,
            } => Self::DelRecord {
                arena,
                segment,
                zone,
                record,
            },
            Self::DelRecord {
                arena,
                segment,
                zone,
                record,
            } => Self::AddRecord {
                arena,
                segment,
                zone,
                record,
            },
        }
    }

    /// Apply the mutation inside `wtxn`.
    ///
    /// On `Err` the transaction holds a partial state and must be aborted.
    pub fn apply(&self, store: &Store, wtxn: &mut RwTxn) -> Result<()> {
        match self {
            Self::CreateArena { arena } => {
                if store.arena_exists(wtxn, arena)? {
                    return Err(Error::action(format!("arena {} already exists", arena)));
                }
                store.put_arena(wtxn, arena)
            }
            Self::DeleteArena { arena } => {
                require_arena(store, wtxn, arena)?;
                if !store.segments_of(wtxn, arena)?.is_empty() {
                    return Err(Error::action(format!("arena {} still has segments", arena)));
                }
                store.remove_arena(wtxn, arena)
            }
            Self::CreateSegment { arena, segment } => {
                require_arena(store, wtxn, arena)?;
                if store.segment_exists(wtxn, arena, segment)? {
                    return Err(Error::action(format!(
                        "segment {}/{} already exists",
                        arena, segment
                    )));
                }
                store.put_segment(wtxn, arena, segment)
            }
            Self::DeleteSegment { arena, segment } => {
                require_segment(store, wtxn, arena, segment)?;
                if !store.zones_of_segment(wtxn, arena, segment)?.is_empty() {
                    return Err(Error::action(format!(
                        "segment {}/{} still has zones",
                        arena, segment
                    )));
                }
                store.remove_segment(wtxn, arena, segment)
            }
            Self::AddZone {
                arena,
                segment,
                zone,
            } => {
                require_segment(store, wtxn, arena, segment)?;
                if store.location_of(wtxn, zone)?.is_some() {
                    return Err(Error::action(format!("zone {} already exists", zone)));
                }
                store.put_zone(wtxn, zone, &ZoneLocation::new(arena.as_str(), segment.as_str()))
            }
            Self::DelZone {
                arena,
                segment,
                zone,
            } => {
                let location = require_zone(store, wtxn, arena, segment, zone)?;
                if !store.records_of(wtxn, zone)?.is_empty() {
                    return Err(Error::action(format!("zone {} still has records", zone)));
                }
                store.remove_zone(wtxn, zone, &location)
            }
            Self::AddRecord {
                arena,
                segment,
                zone,
                record,
            } => {
                require_zone(store, wtxn, arena, segment, zone)?;
                let mut records = store.records_of(wtxn, zone)?;
                match records.binary_search(record) {
                    Ok(_) => Err(Error::action(format!(
                        "record {} already exists in zone {}",
                        record.describe(),
                        zone
                    ))),
                    Err(idx) => {
                        records.insert(idx, record.clone());
                        store.put_records(wtxn, zone, &records)
                    }
                }
            }
            Self::DelRecord {
                arena,
                segment,
                zone,
                record,
            } => {
                require_zone(store, wtxn, arena, segment, zone)?;
                let mut records = store.records_of(wtxn, zone)?;
                match records.binary_search(record) {
                    Ok(idx) => {
                        records.remove(idx);
                        store.put_records(wtxn, zone, &records)
                    }
                    Err(_) => Err(Error::action(format!(
                        "record {} doesn't exist in zone {}",
                        record.describe(),
                        zone
                    ))),
                }
            }
        }
    }

    /// Flat field map of the action
    pub fn fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        let mut set = |k: &str, v: &str| {
            fields.insert(k.to_string(), v.to_string());
        };
        match self {
            Self::CreateArena { arena } | Self::DeleteArena { arena } => set("arena", arena),
            Self::CreateSegment { arena, segment } | Self::DeleteSegment { arena, segment } => {
                set("arena", arena);
                set("segment", segment);
            }
            Self::AddZone {
                arena,
                segment,
                zone,
            }
            | Self::DelZone {
                arena,
                segment,
                zone,
            } => {
                set("arena", arena);
                set("segment", segment);
                set("zone", zone);
            }
            Self::AddRecord {
                arena,
                segment,
                zone,
                record,
            }
            | Self::DelRecord {
                arena,
                segment,
                zone,
                record,
            } => {
                set("arena", arena);
                set("segment", segment);
                set("zone", zone);
                set("name", &record.name);
                set("ttl", &record.ttl.to_string());
                set("data", &record.data);
            }
        }
        fields
    }

    /// Serialize to the dump format
    pub fn dump(&self) -> Result<String> {
        let dump = ActionDump {
            name: self.name().to_string(),
            fields: self.fields(),
        };
        serde_json::to_string(&dump).map_err(|e| Error::serialization(e.to_string()))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name(), self.resource_path())
    }
}

fn require_arena(store: &Store, wtxn: &RwTxn, arena: &str) -> Result<()> {
    if !store.arena_exists(wtxn, arena)? {
        return Err(Error::action(format!("arena {} doesn't exist", arena)));
    }
    Ok(())
}

fn require_segment(store: &Store, wtxn: &RwTxn, arena: &str, segment: &str) -> Result<()> {
    require_arena(store, wtxn, arena)?;
    if !store.segment_exists(wtxn, arena, segment)? {
        return Err(Error::action(format!(
            "segment {}/{} doesn't exist",
            arena, segment
        )));
    }
    Ok(())
}

fn require_zone(
    store: &Store,
    wtxn: &RwTxn,
    arena: &str,
    segment: &str,
    zone: &str,
) -> Result<ZoneLocation> {
    match store.location_of(wtxn, zone)? {
        Some(loc) if loc.arena == arena && loc.segment == segment => Ok(loc),
        Some(loc) => Err(Error::action(format!(
            "zone {} belongs to {}/{}, not {}/{}",
            zone, loc.arena, loc.segment, arena, segment
        ))),
        None => Err(Error::action(format!("zone {} doesn't exist", zone))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordType;
    use crate::testing::TestContext;

    fn apply_all(store: &Store, actions: &[Action]) -> Result<()> {
        let mut wtxn = store.write_txn()?;
        for action in actions {
            action.apply(store, &mut wtxn)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    fn skeleton() -> Vec<Action> {
        vec![
            Action::CreateArena {
                arena: "acme".into(),
            },
            Action::CreateSegment {
                arena: "acme".into(),
                segment: "s1".into(),
            },
            Action::AddZone {
                arena: "acme".into(),
                segment: "s1".into(),
                zone: "example.com".into(),
            },
        ]
    }

    #[test]
    fn test_duplicate_create_fails() {
        let ctx = TestContext::new();
        let store = ctx.open_store().unwrap();
        apply_all(&store, &skeleton()).unwrap();

        let err = apply_all(&store, &skeleton()[..1]).unwrap_err();
        assert!(err.is_action());
        assert_eq!(err.to_string(), "Action error: arena acme already exists");
    }

    #[test]
    fn test_missing_parent_fails() {
        let ctx = TestContext::new();
        let store = ctx.open_store().unwrap();

        let err = apply_all(&store, &skeleton()[2..]).unwrap_err();
        assert_eq!(err.to_string(), "Action error: arena acme doesn't exist");
    }

    #[test]
    fn test_non_empty_delete_fails() {
        let ctx = TestContext::new();
        let store = ctx.open_store().unwrap();
        apply_all(&store, &skeleton()).unwrap();

        let err = apply_all(&store, &[skeleton()[1].invert()]).unwrap_err();
        assert!(err.is_action());
        assert_eq!(store.get_segments("acme").unwrap(), vec!["s1"]);
    }

    #[test]
    fn test_record_do_then_undo() {
        let ctx = TestContext::new();
        let store = ctx.open_store().unwrap();
        apply_all(&store, &skeleton()).unwrap();

        let add = Action::AddRecord {
            arena: "acme".into(),
            segment: "s1".into(),
            zone: "example.com".into(),
            record: Record::new("@", RecordType::Mx, 3600, "10 mail.example.com."),
        };
        apply_all(&store, &[add.clone()]).unwrap();
        assert_eq!(store.get_records("example.com").unwrap().len(), 1);

        apply_all(&store, &[add.invert()]).unwrap();
        assert!(store.get_records("example.com").unwrap().is_empty());

        let err = apply_all(&store, &[add.invert()]).unwrap_err();
        assert!(err.to_string().contains("doesn't exist"));
    }

    #[test]
    fn test_zone_must_match_location() {
        let ctx = TestContext::new();
        let store = ctx.open_store().unwrap();
        apply_all(&store, &skeleton()).unwrap();

        let wrong = Action::DelZone {
            arena: "acme".into(),
            segment: "s2".into(),
            zone: "example.com".into(),
        };
        assert!(apply_all(&store, &[wrong]).unwrap_err().is_action());
    }

    #[test]
    fn test_invert_is_involution() {
        for action in skeleton() {
            assert_ne!(action.invert(), action);
            assert_eq!(action.invert().invert(), action);
        }
    }

    #[test]
    fn test_dump_layout() {
        let dump = skeleton()[2].dump().unwrap();
        assert_eq!(
            dump,
            r#"{"name":"add_zone","fields":{"arena":"acme","segment":"s1","zone":"example.com"}}"#
        );
    }

    #[test]
    fn test_resource_paths() {
        let actions = skeleton();
        assert_eq!(actions[0].resource_path(), "/acme");
        assert_eq!(actions[1].resource_path(), "/acme/s1");
        assert_eq!(actions[2].resource_path(), "/acme/s1/example.com");
    }
}
