//! The streaming half of a replication session.
//!
//! [`StandbyLoop`] reads copy-mode frames, decodes and translates them, hands
//! the resulting records to a sink and periodically tells the server how far
//! it has got. The reported position only ever covers records the sink has
//! accepted, so the server may discard WAL up to it.

use bytes::Bytes;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::decoder::LogicalMessage;
use super::lsn::Lsn;
use super::protocol::{PrimaryKeepalive, ReplicationFrame, StandbyStatus, XLogData};
use super::relation::RelationRegistry;
use super::translator::translate;
use super::transport::{CopyRead, ReplicationTransport};
use super::types::{ChangeRecord, SourceMetadata};
use crate::sink::EventSink;
use crate::{Error, Result};

pub struct StandbyLoop {
    slot_name: String,
    interval: Duration,
    registry: RelationRegistry,
    /// End of the last WAL data fully handed to the sink.
    cursor: Lsn,
    /// Last position sent to the server.
    acknowledged: Lsn,
    server_wal_end: Lsn,
    next_report: Instant,
    report_now: bool,
    current_xid: Option<u32>,
    events_emitted: u64,
    position: watch::Sender<Lsn>,
}

impl StandbyLoop {
    pub fn new(slot_name: impl Into<String>, start: Lsn, interval: Duration) -> Self {
        let (position, _) = watch::channel(start);
        Self {
            slot_name: slot_name.into(),
            interval,
            registry: RelationRegistry::new(),
            cursor: start,
            acknowledged: start,
            server_wal_end: start,
            next_report: Instant::now() + interval,
            report_now: false,
            current_xid: None,
            events_emitted: 0,
            position,
        }
    }

    pub fn cursor(&self) -> Lsn {
        self.cursor
    }

    pub fn acknowledged(&self) -> Lsn {
        self.acknowledged
    }

    pub fn events_emitted(&self) -> u64 {
        self.events_emitted
    }

    pub fn registry(&self) -> &RelationRegistry {
        &self.registry
    }

    /// Observes every position acknowledged to the server.
    pub fn subscribe(&self) -> watch::Receiver<Lsn> {
        self.position.subscribe()
    }

    /// Streams until `cancel` fires or something fails.
    ///
    /// On cancellation a final status update is sent and `Ok` is returned.
    /// Every other exit is an error; the caller owns the connection and is
    /// responsible for closing it either way.
    pub async fn run<T, S>(
        &mut self,
        transport: &mut T,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        T: ReplicationTransport + ?Sized,
        S: EventSink + ?Sized,
    {
        info!(
            slot = %self.slot_name,
            position = %self.cursor,
            interval_secs = self.interval.as_secs(),
            "Streaming changes"
        );
        self.next_report = Instant::now() + self.interval;

        loop {
            if self.report_now || Instant::now() >= self.next_report {
                self.send_status(transport).await?;
            }

            if cancel.is_cancelled() {
                break;
            }

            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                read = transport.recv_copy_data(self.next_report) => read?,
            };

            match read {
                CopyRead::Data(frame) => self.handle_frame(frame, sink).await?,
                CopyRead::Timeout => continue,
                CopyRead::Done => {
                    return Err(Error::Connection(
                        "server ended the replication stream".to_string(),
                    ))
                }
            }
        }

        debug!("Cancellation requested, sending final standby status");
        self.send_status(transport).await?;
        info!(
            position = %self.acknowledged,
            events = self.events_emitted,
            "Streaming stopped"
        );
        Ok(())
    }

    async fn send_status<T>(&mut self, transport: &mut T) -> Result<()>
    where
        T: ReplicationTransport + ?Sized,
    {
        let status = StandbyStatus::at(self.cursor, Utc::now());
        transport.send_copy_data(status.encode()).await?;

        self.acknowledged = self.cursor;
        self.position.send_replace(self.cursor);
        self.report_now = false;
        self.next_report = Instant::now() + self.interval;
        debug!(
            position = %self.cursor,
            server_wal_end = %self.server_wal_end,
            "Sent standby status update"
        );
        Ok(())
    }

    async fn handle_frame<S>(&mut self, frame: Bytes, sink: &mut S) -> Result<()>
    where
        S: EventSink + ?Sized,
    {
        match ReplicationFrame::parse(frame)? {
            ReplicationFrame::Keepalive(keepalive) => self.on_keepalive(keepalive),
            ReplicationFrame::WalData(data) => self.on_wal_data(data, sink).await?,
            ReplicationFrame::Unknown { tag } => {
                warn!("Skipping unknown replication frame type: {}", tag as char)
            }
        }
        Ok(())
    }

    fn on_keepalive(&mut self, keepalive: PrimaryKeepalive) {
        trace!(
            server_wal_end = %keepalive.server_wal_end,
            reply_requested = keepalive.reply_requested,
            "Primary keepalive"
        );
        self.server_wal_end = self.server_wal_end.max(keepalive.server_wal_end);
        if keepalive.reply_requested {
            self.report_now = true;
        }
    }

    async fn on_wal_data<S>(&mut self, data: XLogData, sink: &mut S) -> Result<()>
    where
        S: EventSink + ?Sized,
    {
        let end = data.end_position();
        self.server_wal_end = self.server_wal_end.max(data.server_wal_end);

        let message = LogicalMessage::parse(data.payload)?;
        let ends_transaction = matches!(message, LogicalMessage::Commit { .. });
        if let LogicalMessage::Begin { xid, .. } = &message {
            self.current_xid = Some(*xid);
        }

        if let Some(event) = translate(message, &mut self.registry)? {
            let record = ChangeRecord {
                event,
                source: SourceMetadata::new(
                    self.slot_name.clone(),
                    end,
                    self.current_xid,
                    data.server_time,
                ),
            };
            sink.emit(record).await.map_err(Error::Sink)?;
            self.events_emitted += 1;
        }

        if ends_transaction {
            self.current_xid = None;
        }
        if end > self.cursor {
            self.cursor = end;
        }
        trace!(position = %self.cursor, "Processed WAL data");
        Ok(())
    }
}
