//! pgoutput (protocol version 1) logical message decoder.
//!
//! Decoding is a pure function of the payload bytes: it never consults the
//! relation registry, so tuples come out positional and are only given
//! column names by the translator.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::buffer::ByteReader;
use super::lsn::Lsn;
use super::protocol::from_pg_timestamp;
use super::relation::{ColumnDescriptor, RelationDescriptor, RelationName, ReplicaIdentity};
use super::types::ColumnValue;
use crate::{Error, Result};

const TRUNCATE_CASCADE: u8 = 1;
const TRUNCATE_RESTART_IDENTITY: u8 = 2;
const MESSAGE_TRANSACTIONAL: u8 = 1;

/// Positional column values of one tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleData(pub Vec<ColumnValue>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OldTupleKind {
    /// `K`: replica identity key columns, others null.
    Key,
    /// `O`: full old row.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OldTuple {
    pub kind: OldTupleKind,
    pub tuple: TupleData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalMessage {
    Begin {
        final_lsn: Lsn,
        commit_time: DateTime<Utc>,
        xid: u32,
    },
    Commit {
        flags: u8,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_time: DateTime<Utc>,
    },
    Relation(RelationDescriptor),
    Insert {
        relation_id: u32,
        new_tuple: TupleData,
    },
    Update {
        relation_id: u32,
        old_tuple: Option<OldTuple>,
        new_tuple: TupleData,
    },
    Delete {
        relation_id: u32,
        old_tuple: OldTuple,
    },
    Truncate {
        cascade: bool,
        restart_identity: bool,
        relation_ids: Vec<u32>,
    },
    Origin {
        commit_lsn: Lsn,
        name: String,
    },
    Type {
        type_id: u32,
        namespace: String,
        name: String,
    },
    /// Generic message written with `pg_logical_emit_message`.
    Message {
        transactional: bool,
        lsn: Lsn,
        prefix: String,
        content: Bytes,
    },
    /// A tag this decoder does not know; the payload is skipped whole.
    Unknown { tag: u8 },
}

impl LogicalMessage {
    /// Decodes the payload of one WAL data frame.
    pub fn parse(payload: Bytes) -> Result<Self> {
        let mut reader = ByteReader::new(payload, "logical message");
        if reader.is_empty() {
            return Err(Error::invalid_message("empty logical message"));
        }

        let message = match reader.read_u8()? {
            b'B' => decode_begin(ByteReader::new(reader.rest(), "BEGIN"))?,
            b'C' => decode_commit(ByteReader::new(reader.rest(), "COMMIT"))?,
            b'R' => decode_relation(ByteReader::new(reader.rest(), "RELATION"))?,
            b'I' => decode_insert(ByteReader::new(reader.rest(), "INSERT"))?,
            b'U' => decode_update(ByteReader::new(reader.rest(), "UPDATE"))?,
            b'D' => decode_delete(ByteReader::new(reader.rest(), "DELETE"))?,
            b'T' => decode_truncate(ByteReader::new(reader.rest(), "TRUNCATE"))?,
            b'O' => decode_origin(ByteReader::new(reader.rest(), "ORIGIN"))?,
            b'Y' => decode_type(ByteReader::new(reader.rest(), "TYPE"))?,
            b'M' => decode_message(ByteReader::new(reader.rest(), "MESSAGE"))?,
            tag => LogicalMessage::Unknown { tag },
        };
        Ok(message)
    }
}

fn decode_begin(mut cursor: ByteReader) -> Result<LogicalMessage> {
    let final_lsn = Lsn(cursor.read_u64()?);
    let commit_time = from_pg_timestamp(cursor.read_i64()?);
    let xid = cursor.read_u32()?;
    Ok(LogicalMessage::Begin {
        final_lsn,
        commit_time,
        xid,
    })
}

fn decode_commit(mut cursor: ByteReader) -> Result<LogicalMessage> {
    let flags = cursor.read_u8()?;
    let commit_lsn = Lsn(cursor.read_u64()?);
    let end_lsn = Lsn(cursor.read_u64()?);
    let commit_time = from_pg_timestamp(cursor.read_i64()?);
    Ok(LogicalMessage::Commit {
        flags,
        commit_lsn,
        end_lsn,
        commit_time,
    })
}

fn decode_relation(mut cursor: ByteReader) -> Result<LogicalMessage> {
    let id = cursor.read_u32()?;
    let schema = cursor.read_cstring()?;
    let table = cursor.read_cstring()?;
    let identity = cursor.read_u8()?;
    let replica_identity = ReplicaIdentity::from_byte(identity).ok_or_else(|| {
        Error::invalid_message(format!("Unknown replica identity: {}", identity as char))
    })?;

    let num_columns = cursor.read_u16()?;
    let mut columns = Vec::with_capacity(num_columns as usize);
    for _ in 0..num_columns {
        let flags = cursor.read_u8()?;
        let name = cursor.read_cstring()?;
        let type_id = cursor.read_u32()?;
        let type_modifier = cursor.read_i32()?;
        columns.push(ColumnDescriptor {
            name,
            type_id,
            type_modifier,
            is_key: flags & 1 != 0,
        });
    }

    Ok(LogicalMessage::Relation(RelationDescriptor {
        id,
        name: RelationName { schema, table },
        replica_identity,
        columns,
    }))
}

fn decode_insert(mut cursor: ByteReader) -> Result<LogicalMessage> {
    let relation_id = cursor.read_u32()?;
    let tuple_type = cursor.read_u8()?;
    if tuple_type != b'N' {
        return Err(Error::invalid_message(format!(
            "Unexpected tuple type in INSERT: {}",
            tuple_type as char
        )));
    }
    let new_tuple = decode_tuple_data(&mut cursor)?;
    Ok(LogicalMessage::Insert {
        relation_id,
        new_tuple,
    })
}

fn decode_update(mut cursor: ByteReader) -> Result<LogicalMessage> {
    let relation_id = cursor.read_u32()?;

    let mut old_tuple = None;
    let mut tuple_type = cursor.read_u8()?;
    if let Some(kind) = old_tuple_kind(tuple_type) {
        old_tuple = Some(OldTuple {
            kind,
            tuple: decode_tuple_data(&mut cursor)?,
        });
        tuple_type = cursor.read_u8()?;
    }

    if tuple_type != b'N' {
        return Err(Error::invalid_message(format!(
            "Unexpected tuple type in UPDATE: {}",
            tuple_type as char
        )));
    }
    let new_tuple = decode_tuple_data(&mut cursor)?;

    Ok(LogicalMessage::Update {
        relation_id,
        old_tuple,
        new_tuple,
    })
}

fn decode_delete(mut cursor: ByteReader) -> Result<LogicalMessage> {
    let relation_id = cursor.read_u32()?;
    let tuple_type = cursor.read_u8()?;
    let kind = old_tuple_kind(tuple_type).ok_or_else(|| {
        Error::invalid_message(format!(
            "Unexpected tuple type in DELETE: {}",
            tuple_type as char
        ))
    })?;
    let tuple = decode_tuple_data(&mut cursor)?;
    Ok(LogicalMessage::Delete {
        relation_id,
        old_tuple: OldTuple { kind, tuple },
    })
}

fn decode_truncate(mut cursor: ByteReader) -> Result<LogicalMessage> {
    let count = cursor.read_u32()?;
    let options = cursor.read_u8()?;
    // Each id takes four bytes; reject impossible counts before allocating.
    if cursor.remaining() < count as usize * 4 {
        return Err(Error::invalid_message(format!(
            "TRUNCATE lists {} relations but carries {} bytes",
            count,
            cursor.remaining()
        )));
    }
    let relation_ids = (0..count)
        .map(|_| cursor.read_u32())
        .collect::<Result<Vec<_>>>()?;
    Ok(LogicalMessage::Truncate {
        cascade: options & TRUNCATE_CASCADE != 0,
        restart_identity: options & TRUNCATE_RESTART_IDENTITY != 0,
        relation_ids,
    })
}

fn decode_origin(mut cursor: ByteReader) -> Result<LogicalMessage> {
    let commit_lsn = Lsn(cursor.read_u64()?);
    let name = cursor.read_cstring()?;
    Ok(LogicalMessage::Origin { commit_lsn, name })
}

fn decode_type(mut cursor: ByteReader) -> Result<LogicalMessage> {
    let type_id = cursor.read_u32()?;
    let namespace = cursor.read_cstring()?;
    let name = cursor.read_cstring()?;
    Ok(LogicalMessage::Type {
        type_id,
        namespace,
        name,
    })
}

fn decode_message(mut cursor: ByteReader) -> Result<LogicalMessage> {
    let flags = cursor.read_u8()?;
    let lsn = Lsn(cursor.read_u64()?);
    let prefix = cursor.read_cstring()?;
    let len = read_length(&mut cursor)?;
    let content = cursor.read_bytes(len)?;
    Ok(LogicalMessage::Message {
        transactional: flags & MESSAGE_TRANSACTIONAL != 0,
        lsn,
        prefix,
        content,
    })
}

fn old_tuple_kind(tuple_type: u8) -> Option<OldTupleKind> {
    match tuple_type {
        b'K' => Some(OldTupleKind::Key),
        b'O' => Some(OldTupleKind::Full),
        _ => None,
    }
}

fn read_length(cursor: &mut ByteReader) -> Result<usize> {
    let len = cursor.read_i32()?;
    usize::try_from(len).map_err(|_| Error::invalid_message(format!("Negative length: {}", len)))
}

fn decode_tuple_data(cursor: &mut ByteReader) -> Result<TupleData> {
    let num_columns = cursor.read_u16()?;
    let mut values = Vec::with_capacity(num_columns as usize);

    for _ in 0..num_columns {
        let value = match cursor.read_u8()? {
            b'n' => ColumnValue::Null,
            b'u' => ColumnValue::Unchanged,
            b't' => {
                let len = read_length(cursor)?;
                let raw = cursor.read_bytes(len)?;
                let text = String::from_utf8(raw.to_vec()).map_err(|e| {
                    Error::invalid_message(format!("Text column is not valid UTF-8: {}", e))
                })?;
                ColumnValue::Text(text)
            }
            b'b' => {
                let len = read_length(cursor)?;
                ColumnValue::Binary(cursor.read_bytes(len)?)
            }
            other => {
                return Err(Error::invalid_message(format!(
                    "Unknown column type: {}",
                    other as char
                )));
            }
        };
        values.push(value);
    }

    Ok(TupleData(values))
}
