use async_trait::async_trait;
use tokio::sync::mpsc;

use super::EventSink;
use crate::postgres::ChangeRecord;

/// Hands records to another task over a bounded channel.
///
/// A full channel makes `emit` wait, which stalls the standby loop and with
/// it the acknowledged position.
pub struct ChannelSink {
    sender: mpsc::Sender<ChangeRecord>,
}

impl ChannelSink {
    /// Creates the sink together with the receiving end.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ChangeRecord>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&mut self, record: ChangeRecord) -> anyhow::Result<()> {
        self.sender
            .send(record)
            .await
            .map_err(|_| anyhow::anyhow!("change record receiver was dropped"))
    }
}
