//! DNS records and the record-type dispatch table
//!
//! Record payloads are opaque strings here; what `data` looks like for a
//! given type (an address, `"10 mail.example.com."`, an SOA tuple, ...) is
//! the concern of whoever builds the record. This module only knows which
//! types exist and how each maps onto the action catalog.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported record types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordType {
    /// IPv4 address
    A,
    /// IPv6 address
    Aaaa,
    /// Canonical name
    Cname,
    /// Mail exchanger
    Mx,
    /// Name server
    Ns,
    /// Pointer
    Ptr,
    /// Start of authority
    Soa,
    /// Service locator
    Srv,
    /// Free text
    Txt,
}

/// Per-type entry of the dispatch table
pub struct RecordTypeOps {
    /// Record type
    pub rtype: RecordType,
    /// Lowercase tag used in action names and on the wire
    pub tag: &'static str,
    /// Name of the action adding a record of this type
    pub add_action: &'static str,
    /// Name of the action deleting a record of this type
    pub del_action: &'static str,
    /// Human readable one-line rendering
    pub describe: fn(&Record) -> String,
}

fn describe_plain(record: &Record) -> String {
    format!(
        "{} {} IN {} {}",
        record.name,
        record.ttl,
        record.rtype.mnemonic(),
        record.data
    )
}

fn describe_quoted(record: &Record) -> String {
    format!(
        "{} {} IN {} \"{}\"",
        record.name,
        record.ttl,
        record.rtype.mnemonic(),
        record.data.replace('"', "\\\"")
    )
}

/// Dispatch table, one row per record type
pub static RECORD_TYPES: [RecordTypeOps; 9] = [
    RecordTypeOps {
        rtype: RecordType::A,
        tag: "a",
        add_action: "add_record_a",
        del_action: "del_record_a",
        describe: describe_plain,
    },
    RecordTypeOps {
        rtype: RecordType::Aaaa,
        tag: "aaaa",
        add_action: "add_record_aaaa",
        del_action: "del_record_aaaa",
        describe: describe_plain,
    },
    RecordTypeOps {
        rtype: RecordType::Cname,
        tag: "cname",
        add_action: "add_record_cname",
        del_action: "del_record_cname",
        describe: describe_plain,
    },
    RecordTypeOps {
        rtype: RecordType::Mx,
        tag: "mx",
        add_action: "add_record_mx",
        del_action: "del_record_mx",
        describe: describe_plain,
    },
    RecordTypeOps {
        rtype: RecordType::Ns,
        tag: "ns",
        add_action: "add_record_ns",
        del_action: "del_record_ns",
        describe: describe_plain,
    },
    RecordTypeOps {
        rtype: RecordType::Ptr,
        tag: "ptr",
        add_action: "add_record_ptr",
        del_action: "del_record_ptr",
        describe: describe_plain,
    },
    RecordTypeOps {
        rtype: RecordType::Soa,
        tag: "soa",
        add_action: "add_record_soa",
        del_action: "del_record_soa",
        describe: describe_plain,
    },
    RecordTypeOps {
        rtype: RecordType::Srv,
        tag: "srv",
        add_action: "add_record_srv",
        del_action: "del_record_srv",
        describe: describe_plain,
    },
    RecordTypeOps {
        rtype: RecordType::Txt,
        tag: "txt",
        add_action: "add_record_txt",
        del_action: "del_record_txt",
        describe: describe_quoted,
    },
];

impl RecordType {
    /// All record types, in dispatch-table order
    pub fn all() -> impl Iterator<Item = RecordType> {
        RECORD_TYPES.iter().map(|ops| ops.rtype)
    }

    /// Dispatch-table row for this type
    pub fn ops(&self) -> &'static RecordTypeOps {
        // The table lists the variants in declaration order
        &RECORD_TYPES[*self as usize]
    }

    /// Lowercase tag
    pub fn tag(&self) -> &'static str {
        self.ops().tag
    }

    /// Uppercase mnemonic as used in zone files
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::Aaaa => "AAAA",
            Self::Cname => "CNAME",
            Self::Mx => "MX",
            Self::Ns => "NS",
            Self::Ptr => "PTR",
            Self::Soa => "SOA",
            Self::Srv => "SRV",
            Self::Txt => "TXT",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

impl FromStr for RecordType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        RECORD_TYPES
            .iter()
            .find(|ops| ops.tag == lower)
            .map(|ops| ops.rtype)
            .ok_or_else(|| Error::action(format!("unknown record type '{}'", s)))
    }
}

/// One resource record inside a zone
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Record {
    /// Owner name, relative to the zone (`@` for the apex)
    pub name: String,
    /// Record type
    pub rtype: RecordType,
    /// Time to live in seconds
    pub ttl: u32,
    /// Type-specific payload
    pub data: String,
}

impl Record {
    /// Create a record
    pub fn new(name: impl Into<String>, rtype: RecordType, ttl: u32, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rtype,
            ttl,
            data: data.into(),
        }
    }

    /// One-line rendering through the dispatch table
    pub fn describe(&self) -> String {
        (self.rtype.ops().describe)(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_matches_variants() {
        for (idx, ops) in RECORD_TYPES.iter().enumerate() {
            assert_eq!(ops.rtype as usize, idx);
            assert_eq!(ops.add_action, format!("add_record_{}", ops.tag));
            assert_eq!(ops.del_action, format!("del_record_{}", ops.tag));
        }
    }

    #[test]
    fn test_parse_record_type() {
        assert_eq!("MX".parse::<RecordType>().unwrap(), RecordType::Mx);
        assert_eq!("aaaa".parse::<RecordType>().unwrap(), RecordType::Aaaa);
        assert!("HINFO".parse::<RecordType>().is_err());
    }

    #[test]
    fn test_describe() {
        let mx = Record::new("@", RecordType::Mx, 3600, "10 mail.example.com.");
        assert_eq!(mx.describe(), "@ 3600 IN MX 10 mail.example.com.");

        let txt = Record::new("@", RecordType::Txt, 300, "v=spf1 -all");
        assert_eq!(txt.describe(), "@ 300 IN TXT \"v=spf1 -all\"");
    }
}
