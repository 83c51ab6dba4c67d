use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::EventSink;
use crate::postgres::ChangeRecord;

/// Writes each record as one line of JSON.
pub struct JsonLinesSink<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonLinesSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> EventSink for JsonLinesSink<W> {
    async fn emit(&mut self, record: ChangeRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        // The position is acknowledged once emit returns, so the line must
        // have left the process by then.
        self.writer.flush().await?;
        Ok(())
    }
}
