//! The seam between the replication core and the wire.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::time::Instant;

use crate::Result;

/// One row returned by a simple query, all values in text format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRow {
    columns: Arc<[String]>,
    values: Vec<Option<String>>,
}

impl QueryRow {
    pub fn new(columns: Arc<[String]>, values: Vec<Option<String>>) -> Self {
        Self { columns, values }
    }

    /// Value of the named column; `None` if absent or SQL null.
    pub fn get(&self, column: &str) -> Option<&str> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.values.get(index)?.as_deref()
    }
}

/// Outcome of a deadline-bounded copy-mode read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyRead {
    /// A `CopyData` body.
    Data(Bytes),
    /// The deadline passed with no complete message.
    Timeout,
    /// The server ended the copy stream.
    Done,
}

/// A replication-mode connection to the server.
///
/// Implementations must make `recv_copy_data` cancel-safe: if the future is
/// dropped before completing, no part of a message may be lost.
#[async_trait]
pub trait ReplicationTransport: Send {
    /// Runs a command with the simple query protocol and returns its rows.
    async fn simple_query(&mut self, query: &str) -> Result<Vec<QueryRow>>;

    /// Runs a command that switches the connection into copy-both mode.
    async fn start_copy_both(&mut self, query: &str) -> Result<()>;

    /// Waits for the next `CopyData` body until `deadline`.
    async fn recv_copy_data(&mut self, deadline: Instant) -> Result<CopyRead>;

    async fn send_copy_data(&mut self, data: Bytes) -> Result<()>;

    /// Releases the connection. Errors are logged rather than returned so
    /// that teardown always completes.
    async fn close(&mut self);
}
