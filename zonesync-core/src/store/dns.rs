//! Arena / segment / zone / record queries and primitive mutations
//!
//! Mutations here perform no precondition checks; actions check first and
//! then call them, so every helper assumes the caller validated the state.

use super::Store;
use crate::Result;
use crate::record::Record;
use heed::{RoTxn, RwTxn};
use serde::{Deserialize, Serialize};

/// Where a zone lives in the arena/segment hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZoneLocation {
    /// Owning arena
    pub arena: String,
    /// Owning segment
    pub segment: String,
}

impl ZoneLocation {
    /// Create a location
    pub fn new(arena: impl Into<String>, segment: impl Into<String>) -> Self {
        Self {
            arena: arena.into(),
            segment: segment.into(),
        }
    }
}

fn segment_key(arena: &str, segment: &str) -> String {
    format!("{}/{}", arena, segment)
}

impl Store {
    // --- reads within a caller-provided transaction ---

    /// Whether `arena` exists
    pub fn arena_exists(&self, txn: &RoTxn, arena: &str) -> Result<bool> {
        Ok(self.arenas.get(txn, arena)?.is_some())
    }

    /// Segment names of `arena`, sorted
    pub fn segments_of(&self, txn: &RoTxn, arena: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        if let Some(iter) = self.segments.get_duplicates(txn, arena)? {
            for item in iter {
                let (_, segment) = item?;
                out.push(segment.to_string());
            }
        }
        Ok(out)
    }

    /// Whether `segment` exists under `arena`
    pub fn segment_exists(&self, txn: &RoTxn, arena: &str, segment: &str) -> Result<bool> {
        Ok(self.segments_of(txn, arena)?.iter().any(|s| s == segment))
    }

    /// Zone names held by one segment, sorted
    pub fn zones_of_segment(&self, txn: &RoTxn, arena: &str, segment: &str) -> Result<Vec<String>> {
        let key = segment_key(arena, segment);
        let mut out = Vec::new();
        if let Some(iter) = self.segment_zones.get_duplicates(txn, &key)? {
            for item in iter {
                let (_, zone) = item?;
                out.push(zone.to_string());
            }
        }
        Ok(out)
    }

    /// Location of `zone`, if it exists
    pub fn location_of(&self, txn: &RoTxn, zone: &str) -> Result<Option<ZoneLocation>> {
        Ok(self.zones.get(txn, zone)?)
    }

    /// Records of `zone`, sorted
    pub fn records_of(&self, txn: &RoTxn, zone: &str) -> Result<Vec<Record>> {
        Ok(self.records.get(txn, zone)?.unwrap_or_default())
    }

    // --- primitive mutations ---

    pub(crate) fn put_arena(&self, wtxn: &mut RwTxn, arena: &str) -> Result<()> {
        self.arenas.put(wtxn, arena, &())?;
        Ok(())
    }

    pub(crate) fn remove_arena(&self, wtxn: &mut RwTxn, arena: &str) -> Result<()> {
        self.arenas.delete(wtxn, arena)?;
        Ok(())
    }

    pub(crate) fn put_segment(&self, wtxn: &mut RwTxn, arena: &str, segment: &str) -> Result<()> {
        self.segments.put(wtxn, arena, segment)?;
        Ok(())
    }

    pub(crate) fn remove_segment(&self, wtxn: &mut RwTxn, arena: &str, segment: &str) -> Result<()> {
        self.segments.delete_one_duplicate(wtxn, arena, segment)?;
        Ok(())
    }

    pub(crate) fn put_zone(&self, wtxn: &mut RwTxn, zone: &str, location: &ZoneLocation) -> Result<()> {
        self.zones.put(wtxn, zone, location)?;
        let key = segment_key(&location.arena, &location.segment);
        self.segment_zones.put(wtxn, &key, zone)?;
        Ok(())
    }

    pub(crate) fn remove_zone(&self, wtxn: &mut RwTxn, zone: &str, location: &ZoneLocation) -> Result<()> {
        self.zones.delete(wtxn, zone)?;
        let key = segment_key(&location.arena, &location.segment);
        self.segment_zones.delete_one_duplicate(wtxn, &key, zone)?;
        self.records.delete(wtxn, zone)?;
        Ok(())
    }

    pub(crate) fn put_records(&self, wtxn: &mut RwTxn, zone: &str, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            self.records.delete(wtxn, zone)?;
        } else {
            self.records.put(wtxn, zone, &records.to_vec())?;
        }
        Ok(())
    }

    // --- convenience queries, each in its own read transaction ---

    /// All arena names, sorted
    pub fn get_arenas(&self) -> Result<Vec<String>> {
        self.read(|txn| {
            let mut out = Vec::new();
            for item in self.arenas.iter(txn)? {
                let (arena, _) = item?;
                out.push(arena.to_string());
            }
            Ok(out)
        })
    }

    /// Segment names of `arena`
    pub fn get_segments(&self, arena: &str) -> Result<Vec<String>> {
        self.read(|txn| self.segments_of(txn, arena))
    }

    /// All zones of `arena`, across its segments, sorted
    pub fn get_zones(&self, arena: &str) -> Result<Vec<String>> {
        self.read(|txn| {
            let mut out = Vec::new();
            for segment in self.segments_of(txn, arena)? {
                out.extend(self.zones_of_segment(txn, arena, &segment)?);
            }
            out.sort();
            Ok(out)
        })
    }

    /// Zones of one segment
    pub fn get_segment_zones(&self, arena: &str, segment: &str) -> Result<Vec<String>> {
        self.read(|txn| self.zones_of_segment(txn, arena, segment))
    }

    /// Location of a zone
    pub fn zone_location(&self, zone: &str) -> Result<Option<ZoneLocation>> {
        self.read(|txn| self.location_of(txn, zone))
    }

    /// Records of a zone
    pub fn get_records(&self, zone: &str) -> Result<Vec<Record>> {
        self.read(|txn| self.records_of(txn, zone))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordType;
    use crate::testing::TestContext;

    #[test]
    fn test_segments_are_a_sorted_multimap() {
        let ctx = TestContext::new();
        let store = ctx.open_store().unwrap();

        let mut wtxn = store.write_txn().unwrap();
        store.put_arena(&mut wtxn, "acme").unwrap();
        store.put_segment(&mut wtxn, "acme", "s2").unwrap();
        store.put_segment(&mut wtxn, "acme", "s1").unwrap();
        store.put_segment(&mut wtxn, "other", "s9").unwrap();
        wtxn.commit().unwrap();

        assert_eq!(store.get_segments("acme").unwrap(), vec!["s1", "s2"]);
        assert_eq!(store.get_segments("nobody").unwrap(), Vec::<String>::new());

        let mut wtxn = store.write_txn().unwrap();
        store.remove_segment(&mut wtxn, "acme", "s1").unwrap();
        wtxn.commit().unwrap();
        assert_eq!(store.get_segments("acme").unwrap(), vec!["s2"]);
    }

    #[test]
    fn test_zone_placement() {
        let ctx = TestContext::new();
        let store = ctx.open_store().unwrap();
        let loc = ZoneLocation::new("acme", "s1");

        let mut wtxn = store.write_txn().unwrap();
        store.put_arena(&mut wtxn, "acme").unwrap();
        store.put_segment(&mut wtxn, "acme", "s1").unwrap();
        store.put_zone(&mut wtxn, "example.com", &loc).unwrap();
        store.put_zone(&mut wtxn, "example.org", &loc).unwrap();
        store
            .put_records(
                &mut wtxn,
                "example.com",
                &[Record::new("www", RecordType::A, 300, "192.0.2.1")],
            )
            .unwrap();
        wtxn.commit().unwrap();

        assert_eq!(store.get_zones("acme").unwrap(), vec!["example.com", "example.org"]);
        assert_eq!(store.zone_location("example.com").unwrap(), Some(loc.clone()));
        assert_eq!(store.get_records("example.com").unwrap().len(), 1);

        let mut wtxn = store.write_txn().unwrap();
        store.remove_zone(&mut wtxn, "example.com", &loc).unwrap();
        wtxn.commit().unwrap();

        assert_eq!(store.get_segment_zones("acme", "s1").unwrap(), vec!["example.org"]);
        assert!(store.get_records("example.com").unwrap().is_empty());
    }
}
