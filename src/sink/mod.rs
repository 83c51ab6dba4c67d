//! Downstream consumers of change records.

pub mod channel;
pub mod json;
pub mod log;

use async_trait::async_trait;

use crate::postgres::ChangeRecord;

pub use channel::ChannelSink;
pub use json::JsonLinesSink;
pub use log::LogSink;

/// Receives change records in stream order.
///
/// `emit` may wait (for example on a full queue) to apply backpressure. The
/// standby loop acknowledges a record's position only after `emit` returns
/// `Ok`, so a record whose emission failed is delivered again by the next
/// session.
#[async_trait]
pub trait EventSink: Send {
    async fn emit(&mut self, record: ChangeRecord) -> anyhow::Result<()>;
}

#[async_trait]
impl<S: EventSink + ?Sized> EventSink for Box<S> {
    async fn emit(&mut self, record: ChangeRecord) -> anyhow::Result<()> {
        (**self).emit(record).await
    }
}
