//! Name → action kind lookup used to load dumps

use super::{Action, ActionDump};
use crate::record::{RECORD_TYPES, Record, RecordType};
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap};

/// Every constructible kind of action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// `create_arena`
    CreateArena,
    /// `delete_arena`
    DeleteArena,
    /// `create_segment`
    CreateSegment,
    /// `delete_segment`
    DeleteSegment,
    /// `add_zone`
    AddZone,
    /// `del_zone`
    DelZone,
    /// `add_record_<type>`
    AddRecord(RecordType),
    /// `del_record_<type>`
    DelRecord(RecordType),
}

impl ActionKind {
    /// Registered name
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateArena => "create_arena",
            Self::DeleteArena => "delete_arena",
            Self::CreateSegment => "create_segment",
            Self::DeleteSegment => "delete_segment",
            Self::AddZone => "add_zone",
            Self::DelZone => "del_zone",
            Self::AddRecord(rtype) => rtype.ops().add_action,
            Self::DelRecord(rtype) => rtype.ops().del_action,
        }
    }

    /// The built-in catalog: hierarchy actions plus one add/del pair per record type
    pub fn catalog() -> Vec<ActionKind> {
        let mut kinds = vec![
            Self::CreateArena,
            Self::DeleteArena,
            Self::CreateSegment,
            Self::DeleteSegment,
            Self::AddZone,
            Self::DelZone,
        ];
        for ops in RECORD_TYPES.iter() {
            kinds.push(Self::AddRecord(ops.rtype));
            kinds.push(Self::DelRecord(ops.rtype));
        }
        kinds
    }

    fn build(&self, fields: &BTreeMap<String, String>) -> Result<Action> {
        let field = |key: &str| -> Result<String> {
            fields.get(key).cloned().ok_or_else(|| {
                Error::serialization(format!("{}: missing field '{}'", self.name(), key))
            })
        };

        let action = match self {
            Self::CreateArena => Action::CreateArena {
                arena: field("arena")?,
            },
            Self::DeleteArena => Action::DeleteArena {
                arena: field("arena")?,
            },
            Self::CreateSegment => Action::CreateSegment {
                arena: field("arena")?,
                segment: field("segment")?,
            },
            Self::DeleteSegment => Action::DeleteSegment {
                arena: field("arena")?,
                segment: field("segment")?,
            },
            Self::AddZone => Action::AddZone {
                arena: field("arena")?,
                segment: field("segment")?,
                zone: field("zone")?,
            },
            Self::DelZone => Action::DelZone {
                arena: field("arena")?,
                segment: field("segment")?,
                zone: field("zone")?,
            },
            Self::AddRecord(rtype) | Self::DelRecord(rtype) => {
                let ttl = field("ttl")?.parse::<u32>().map_err(|e| {
                    Error::serialization(format!("{}: invalid ttl: {}", self.name(), e))
                })?;
                let record = Record::new(field("name")?, *rtype, ttl, field("data")?);
                let (arena, segment, zone) = (field("arena")?, field("segment")?, field("zone")?);
                if matches!(self, Self::AddRecord(_)) {
                    Action::AddRecord {
                        arena,
                        segment,
                        zone,
                        record,
                    }
                } else {
                    Action::DelRecord {
                        arena,
                        segment,
                        zone,
                        record,
                    }
                }
            }
        };

        Ok(action)
    }
}

/// Immutable name → kind map, built once at startup and shared by reference
#[derive(Debug, Clone)]
pub struct ActionRegistry {
    kinds: HashMap<&'static str, ActionKind>,
}

impl ActionRegistry {
    /// Build a registry from an explicit list; duplicate names are rejected
    pub fn new(kinds: impl IntoIterator<Item = ActionKind>) -> Result<Self> {
        let mut map = HashMap::new();
        for kind in kinds {
            if map.insert(kind.name(), kind).is_some() {
                return Err(Error::config(format!(
                    "action '{}' registered twice",
                    kind.name()
                )));
            }
        }
        Ok(Self { kinds: map })
    }

    /// Registry holding the built-in catalog
    pub fn standard() -> Self {
        let kinds = ActionKind::catalog();
        let map = kinds.into_iter().map(|kind| (kind.name(), kind)).collect();
        Self { kinds: map }
    }

    /// Look up a kind by name
    pub fn get(&self, name: &str) -> Option<ActionKind> {
        self.kinds.get(name).copied()
    }

    /// Number of registered kinds
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Reconstruct an action from its dump
    pub fn load(&self, dump: &str) -> Result<Action> {
        let parsed: ActionDump =
            serde_json::from_str(dump).map_err(|e| Error::serialization(e.to_string()))?;
        let kind = self
            .get(&parsed.name)
            .ok_or_else(|| Error::serialization(format!("unknown action '{}'", parsed.name)))?;
        kind.build(&parsed.fields)
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
