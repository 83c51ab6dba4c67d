use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::lsn::Lsn;
use super::transport::{CopyRead, QueryRow, ReplicationTransport};
use crate::{Error, Result};

/// Mock frame builder for exercising the decoder and the standby loop.
///
/// Every `*_message` method returns a complete `'w'` frame. Frames are laid
/// out back to back: each starts where the previous payload ended, so
/// [`MockMessageBuilder::position`] after building a frame is that frame's
/// end offset.
pub struct MockMessageBuilder {
    lsn: u64,
    timestamp: i64,
    relations: HashMap<u32, MockRelation>,
}

#[derive(Debug, Clone)]
pub struct MockRelation {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub columns: Vec<MockColumn>,
}

#[derive(Debug, Clone)]
pub struct MockColumn {
    pub name: String,
    pub type_id: u32,
    pub is_key: bool,
}

/// Column value for tuple builders.
#[derive(Debug, Clone, Copy)]
pub enum MockValue<'a> {
    Null,
    Unchanged,
    Text(&'a str),
    Binary(&'a [u8]),
}

impl<'a> From<Option<&'a str>> for MockValue<'a> {
    fn from(value: Option<&'a str>) -> Self {
        match value {
            Some(v) => MockValue::Text(v),
            None => MockValue::Null,
        }
    }
}

impl MockMessageBuilder {
    pub fn new() -> Self {
        Self {
            lsn: 1000,
            timestamp: 750_681_000_000_000, // 2023-10-15 10:30:00 UTC
            relations: HashMap::new(),
        }
    }

    pub fn with_lsn(mut self, lsn: u64) -> Self {
        self.lsn = lsn;
        self
    }

    pub fn add_relation(
        mut self,
        id: u32,
        schema: &str,
        table: &str,
        columns: Vec<(&str, u32, bool)>,
    ) -> Self {
        let mock_columns = columns
            .into_iter()
            .map(|(name, type_id, is_key)| MockColumn {
                name: name.to_string(),
                type_id,
                is_key,
            })
            .collect();

        self.relations.insert(
            id,
            MockRelation {
                id,
                schema: schema.to_string(),
                table: table.to_string(),
                columns: mock_columns,
            },
        );
        self
    }

    /// The position the next frame will start at.
    pub fn position(&self) -> Lsn {
        Lsn(self.lsn)
    }

    /// Wraps `payload` in an XLogData header and advances the position.
    pub fn wal_frame(&mut self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(self.lsn); // wal start
        buf.put_u64(self.lsn + payload.len() as u64 + 4096); // server wal end
        buf.put_i64(self.timestamp);
        buf.put_slice(payload);
        self.lsn += payload.len() as u64;
        buf.freeze()
    }

    pub fn keepalive(&self, reply_requested: bool) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(self.lsn + 4096);
        buf.put_i64(self.timestamp);
        buf.put_u8(u8::from(reply_requested));
        buf.freeze()
    }

    pub fn begin_message(&mut self, xid: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(self.lsn + 512); // final LSN of the transaction
        buf.put_i64(self.timestamp);
        buf.put_u32(xid);
        self.wal_frame(&buf)
    }

    pub fn commit_message(&mut self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0); // flags
        buf.put_u64(self.lsn);
        buf.put_u64(self.lsn + 26);
        buf.put_i64(self.timestamp);
        self.wal_frame(&buf)
    }

    pub fn relation_message(&mut self, rel_id: u32) -> Bytes {
        let relation = self
            .relations
            .get(&rel_id)
            .expect("Relation not found. Use add_relation() first.")
            .clone();

        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(rel_id);
        put_cstring(&mut buf, &relation.schema);
        put_cstring(&mut buf, &relation.table);
        buf.put_u8(b'd'); // replica identity default
        buf.put_u16(relation.columns.len() as u16);

        for column in &relation.columns {
            buf.put_u8(u8::from(column.is_key));
            put_cstring(&mut buf, &column.name);
            buf.put_u32(column.type_id);
            buf.put_i32(-1); // type modifier
        }

        self.wal_frame(&buf)
    }

    pub fn insert_message(&mut self, rel_id: u32, values: Vec<(&str, Option<&str>)>) -> Bytes {
        let values: Vec<MockValue> = values.into_iter().map(|(_, v)| v.into()).collect();
        self.insert_values(rel_id, &values)
    }

    pub fn insert_values(&mut self, rel_id: u32, values: &[MockValue]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(rel_id);
        buf.put_u8(b'N');
        put_tuple(&mut buf, values);
        self.wal_frame(&buf)
    }

    /// `old` is `(b'K' | b'O', values)` when the server would send an old row.
    pub fn update_values(
        &mut self,
        rel_id: u32,
        old: Option<(u8, &[MockValue])>,
        new: &[MockValue],
    ) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(rel_id);
        if let Some((kind, values)) = old {
            buf.put_u8(kind);
            put_tuple(&mut buf, values);
        }
        buf.put_u8(b'N');
        put_tuple(&mut buf, new);
        self.wal_frame(&buf)
    }

    pub fn delete_values(&mut self, rel_id: u32, kind: u8, values: &[MockValue]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(rel_id);
        buf.put_u8(kind);
        put_tuple(&mut buf, values);
        self.wal_frame(&buf)
    }

    pub fn truncate_message(&mut self, rel_ids: Vec<u32>, options: u8) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'T');
        buf.put_u32(rel_ids.len() as u32);
        buf.put_u8(options);
        for rel_id in rel_ids {
            buf.put_u32(rel_id);
        }
        self.wal_frame(&buf)
    }

    /// BEGIN -> RELATION -> INSERT -> COMMIT for a relation added earlier.
    pub fn simple_transaction(
        &mut self,
        xid: u32,
        rel_id: u32,
        values: Vec<(&str, Option<&str>)>,
    ) -> Vec<Bytes> {
        vec![
            self.begin_message(xid),
            self.relation_message(rel_id),
            self.insert_message(rel_id, values),
            self.commit_message(),
        ]
    }
}

/// Strips the 25-byte XLogData header, leaving the pgoutput payload.
pub fn payload_of(frame: &Bytes) -> Bytes {
    frame.slice(25..)
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_tuple(buf: &mut BytesMut, values: &[MockValue]) {
    buf.put_u16(values.len() as u16);
    for value in values {
        match value {
            MockValue::Null => buf.put_u8(b'n'),
            MockValue::Unchanged => buf.put_u8(b'u'),
            MockValue::Text(text) => {
                buf.put_u8(b't');
                buf.put_i32(text.len() as i32);
                buf.put_slice(text.as_bytes());
            }
            MockValue::Binary(data) => {
                buf.put_u8(b'b');
                buf.put_i32(data.len() as i32);
                buf.put_slice(data);
            }
        }
    }
}

/// Common PostgreSQL type OIDs for testing
pub mod type_oids {
    pub const BOOL: u32 = 16;
    pub const INT4: u32 = 23;
    pub const INT8: u32 = 20;
    pub const TEXT: u32 = 25;
    pub const BYTEA: u32 = 17;
    pub const TIMESTAMPTZ: u32 = 1184;
}

/// One scripted read for [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub enum Step {
    Frame(Bytes),
    /// Nothing arrives before the deadline.
    Idle,
    /// The server ends the copy stream.
    Done,
    Fail(&'static str),
}

/// What the client did, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Query(String),
    StartCopy(String),
    Recv,
    /// A standby status update reporting this position.
    Status(Lsn),
    Close,
}

/// In-memory transport that replays a script of reads and records every
/// query and status update the client produces.
///
/// Once the script runs out, the transport cancels `cancel_when_drained` (if
/// set) and blocks forever, otherwise it reports the end of the stream.
#[derive(Default)]
pub struct ScriptedTransport {
    pub steps: VecDeque<Step>,
    pub journal: Vec<Action>,
    pub responses: HashMap<String, Vec<Vec<(&'static str, Option<String>)>>>,
    pub failing_command: Option<String>,
    pub cancel_when_drained: Option<CancellationToken>,
    pub closed: bool,
}

impl ScriptedTransport {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn frames(frames: impl IntoIterator<Item = Bytes>) -> Self {
        Self::new(frames.into_iter().map(Step::Frame))
    }

    pub fn cancel_when_drained(mut self, cancel: CancellationToken) -> Self {
        self.cancel_when_drained = Some(cancel);
        self
    }

    /// Rows returned for commands starting with `command`.
    pub fn respond(
        mut self,
        command: &str,
        rows: Vec<Vec<(&'static str, Option<String>)>>,
    ) -> Self {
        self.responses.insert(command.to_string(), rows);
        self
    }

    /// Commands starting with `command` fail with a server error.
    pub fn fail_command(mut self, command: &str) -> Self {
        self.failing_command = Some(command.to_string());
        self
    }

    pub fn statuses(&self) -> Vec<Lsn> {
        self.journal
            .iter()
            .filter_map(|a| match a {
                Action::Status(lsn) => Some(*lsn),
                _ => None,
            })
            .collect()
    }

    pub fn commands(&self) -> Vec<&str> {
        self.journal
            .iter()
            .filter_map(|a| match a {
                Action::Query(q) | Action::StartCopy(q) => Some(q.as_str()),
                _ => None,
            })
            .collect()
    }

    fn check_failure(&self, command: &str) -> Result<()> {
        match &self.failing_command {
            Some(prefix) if command.starts_with(prefix.as_str()) => Err(Error::Server {
                severity: "ERROR".to_string(),
                code: "42000".to_string(),
                message: format!("scripted failure for {}", prefix),
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ReplicationTransport for ScriptedTransport {
    async fn simple_query(&mut self, query: &str) -> Result<Vec<QueryRow>> {
        self.journal.push(Action::Query(query.to_string()));
        self.check_failure(query)?;

        let rows = self
            .responses
            .iter()
            .find(|(command, _)| query.starts_with(command.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default();

        Ok(rows
            .into_iter()
            .map(|row| {
                let columns: Arc<[String]> =
                    row.iter().map(|(name, _)| name.to_string()).collect();
                QueryRow::new(columns, row.into_iter().map(|(_, v)| v).collect())
            })
            .collect())
    }

    async fn start_copy_both(&mut self, query: &str) -> Result<()> {
        self.journal.push(Action::StartCopy(query.to_string()));
        self.check_failure(query)
    }

    async fn recv_copy_data(&mut self, deadline: Instant) -> Result<CopyRead> {
        self.journal.push(Action::Recv);
        match self.steps.pop_front() {
            Some(Step::Frame(frame)) => Ok(CopyRead::Data(frame)),
            Some(Step::Idle) => {
                tokio::time::sleep_until(deadline).await;
                Ok(CopyRead::Timeout)
            }
            Some(Step::Done) => Ok(CopyRead::Done),
            Some(Step::Fail(reason)) => Err(Error::Connection(reason.to_string())),
            None => match &self.cancel_when_drained {
                Some(cancel) => {
                    cancel.cancel();
                    std::future::pending().await
                }
                None => Ok(CopyRead::Done),
            },
        }
    }

    async fn send_copy_data(&mut self, data: Bytes) -> Result<()> {
        let mut body = data;
        assert_eq!(body.get_u8(), b'r', "only standby status updates are sent");
        self.journal.push(Action::Status(Lsn(body.get_u64())));
        Ok(())
    }

    async fn close(&mut self) {
        self.journal.push(Action::Close);
        self.closed = true;
    }
}
