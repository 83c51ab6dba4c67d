//! Streaming replication framing carried inside `CopyData` messages.
//!
//! The server sends primary keepalives (`'k'`) and WAL data (`'w'`); the
//! client answers with standby status updates (`'r'`). Timestamps on the wire
//! are microseconds since 2000-01-01 00:00:00 UTC.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use super::buffer::ByteReader;
use super::lsn::Lsn;
use crate::{Error, Result};

pub const KEEPALIVE_TAG: u8 = b'k';
pub const XLOG_DATA_TAG: u8 = b'w';
pub const STANDBY_STATUS_TAG: u8 = b'r';

/// Seconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// Converts a server timestamp to UTC.
pub fn from_pg_timestamp(micros: i64) -> DateTime<Utc> {
    let secs = micros.div_euclid(1_000_000) + PG_EPOCH_OFFSET_SECS;
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos).unwrap_or_default()
}

/// Converts a UTC time to a server timestamp.
pub fn to_pg_timestamp(time: DateTime<Utc>) -> i64 {
    (time.timestamp() - PG_EPOCH_OFFSET_SECS) * 1_000_000 + i64::from(time.timestamp_subsec_micros())
}

/// A decoded copy-mode frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationFrame {
    Keepalive(PrimaryKeepalive),
    WalData(XLogData),
    /// A frame whose tag this client does not know. Safe to skip since the
    /// transport already delimited it.
    Unknown { tag: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeepalive {
    pub server_wal_end: Lsn,
    pub server_time: DateTime<Utc>,
    pub reply_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLogData {
    pub wal_start: Lsn,
    pub server_wal_end: Lsn,
    pub server_time: DateTime<Utc>,
    /// The nested pgoutput message.
    pub payload: Bytes,
}

impl XLogData {
    /// Position just past the bytes carried by this frame.
    pub fn end_position(&self) -> Lsn {
        self.wal_start + self.payload.len() as u64
    }
}

impl ReplicationFrame {
    /// Parses one `CopyData` body.
    pub fn parse(frame: Bytes) -> Result<Self> {
        let mut reader = ByteReader::new(frame, "replication frame");
        if reader.is_empty() {
            return Err(Error::invalid_message("empty replication frame"));
        }

        match reader.read_u8()? {
            KEEPALIVE_TAG => {
                let server_wal_end = Lsn(reader.read_u64()?);
                let server_time = from_pg_timestamp(reader.read_i64()?);
                let reply_requested = reader.read_u8()? != 0;
                Ok(ReplicationFrame::Keepalive(PrimaryKeepalive {
                    server_wal_end,
                    server_time,
                    reply_requested,
                }))
            }
            XLOG_DATA_TAG => {
                let wal_start = Lsn(reader.read_u64()?);
                let server_wal_end = Lsn(reader.read_u64()?);
                let server_time = from_pg_timestamp(reader.read_i64()?);
                Ok(ReplicationFrame::WalData(XLogData {
                    wal_start,
                    server_wal_end,
                    server_time,
                    payload: reader.rest(),
                }))
            }
            tag => Ok(ReplicationFrame::Unknown { tag }),
        }
    }
}

/// Progress report sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandbyStatus {
    pub written: Lsn,
    pub flushed: Lsn,
    pub applied: Lsn,
    pub client_time: DateTime<Utc>,
    pub reply_requested: bool,
}

impl StandbyStatus {
    /// A report that claims `position` for all three positions.
    pub fn at(position: Lsn, client_time: DateTime<Utc>) -> Self {
        Self {
            written: position,
            flushed: position,
            applied: position,
            client_time,
            reply_requested: false,
        }
    }

    /// Encodes the `CopyData` body.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(34);
        buf.put_u8(STANDBY_STATUS_TAG);
        buf.put_u64(self.written.as_u64());
        buf.put_u64(self.flushed.as_u64());
        buf.put_u64(self.applied.as_u64());
        buf.put_i64(to_pg_timestamp(self.client_time));
        buf.put_u8(u8::from(self.reply_requested));
        buf.freeze()
    }
}
