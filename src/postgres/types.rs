use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use super::lsn::Lsn;
use super::relation::RelationName;

/// One column of a replicated tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    Null,
    /// Unchanged TOASTed value the server did not resend.
    Unchanged,
    /// Text-format value.
    Text(String),
    /// Binary-format value.
    Binary(Bytes),
}

impl ColumnValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Column values paired with their names, in table order.
///
/// Serializes as a JSON object. Unchanged columns are left out of the object
/// entirely, which keeps them distinguishable from `null`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row(Vec<(String, ColumnValue)>);

impl Row {
    pub fn new(columns: Vec<(String, ColumnValue)>) -> Self {
        Self(columns)
    }

    pub fn get(&self, name: &str) -> Option<&ColumnValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnValue)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let present = self
            .0
            .iter()
            .filter(|(_, v)| *v != ColumnValue::Unchanged);
        let mut map = serializer.serialize_map(None)?;
        for (name, value) in present {
            match value {
                ColumnValue::Null => map.serialize_entry(name, &())?,
                ColumnValue::Text(s) => map.serialize_entry(name, s)?,
                ColumnValue::Binary(b) => map.serialize_entry(
                    name,
                    &base64::engine::general_purpose::STANDARD.encode(b),
                )?,
                ColumnValue::Unchanged => {}
            }
        }
        map.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OldRowKind {
    /// Replica identity key columns only.
    Key,
    /// The whole old row (replica identity full).
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OldRow {
    pub kind: OldRowKind,
    pub values: Row,
}

/// A self-describing change, ready for a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
pub enum ChangeEvent {
    Begin {
        final_lsn: Lsn,
        commit_time: DateTime<Utc>,
        xid: u32,
    },
    Commit {
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_time: DateTime<Utc>,
    },
    Insert {
        relation: RelationName,
        new: Row,
    },
    Update {
        relation: RelationName,
        #[serde(skip_serializing_if = "Option::is_none")]
        old: Option<OldRow>,
        new: Row,
    },
    Delete {
        relation: RelationName,
        old: OldRow,
    },
    /// One event per truncate message, naming every relation it covered.
    Truncate {
        relations: Vec<RelationName>,
        cascade: bool,
        restart_identity: bool,
    },
}

impl ChangeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Begin { .. } => "BEGIN",
            ChangeEvent::Commit { .. } => "COMMIT",
            ChangeEvent::Insert { .. } => "INSERT",
            ChangeEvent::Update { .. } => "UPDATE",
            ChangeEvent::Delete { .. } => "DELETE",
            ChangeEvent::Truncate { .. } => "TRUNCATE",
        }
    }
}

/// A change event plus where it came from in the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRecord {
    #[serde(flatten)]
    pub event: ChangeEvent,
    pub source: SourceMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceMetadata {
    pub connector: String,
    pub version: String,
    pub slot: String,
    /// End of the WAL data that carried the event.
    pub lsn: Lsn,
    /// Transaction of the enclosing BEGIN, if one has been seen.
    pub xid: Option<u32>,
    pub server_time: DateTime<Utc>,
}

impl SourceMetadata {
    pub fn new(slot: String, lsn: Lsn, xid: Option<u32>, server_time: DateTime<Utc>) -> Self {
        Self {
            connector: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            slot,
            lsn,
            xid,
            server_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gizmos() -> RelationName {
        RelationName {
            schema: "public".to_string(),
            table: "gizmos".to_string(),
        }
    }

    #[test]
    fn test_row_json_distinguishes_null_and_unchanged() {
        let row = Row::new(vec![
            ("id".to_string(), ColumnValue::Text("1".to_string())),
            ("note".to_string(), ColumnValue::Null),
            ("blob".to_string(), ColumnValue::Unchanged),
            ("raw".to_string(), ColumnValue::Binary(Bytes::from_static(b"\x01\x02"))),
        ]);

        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["id"], "1");
        assert!(json["note"].is_null());
        assert!(json.as_object().unwrap().contains_key("note"));
        assert!(!json.as_object().unwrap().contains_key("blob"));
        assert_eq!(json["raw"], "AQI=");
    }

    #[test]
    fn test_event_json_shape() {
        let event = ChangeEvent::Insert {
            relation: gizmos(),
            new: Row::new(vec![("id".to_string(), ColumnValue::Text("7".to_string()))]),
        };
        let record = ChangeRecord {
            event,
            source: SourceMetadata::new("slot_a".to_string(), Lsn(0x10), Some(9), Utc::now()),
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["op"], "INSERT");
        assert_eq!(json["relation"]["table"], "gizmos");
        assert_eq!(json["new"]["id"], "7");
        assert_eq!(json["source"]["lsn"], "0/10");
        assert_eq!(json["source"]["xid"], 9);
    }

    #[test]
    fn test_update_without_old_row_omits_field() {
        let event = ChangeEvent::Update {
            relation: gizmos(),
            old: None,
            new: Row::default(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["op"], "UPDATE");
        assert!(json.get("old").is_none());
    }
}
