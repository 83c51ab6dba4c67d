//! Replication session lifecycle: identify, provision, create the slot and
//! start streaming.

use postgres_protocol::escape::escape_literal;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::lsn::Lsn;
use super::publication::PublicationAdmin;
use super::standby::StandbyLoop;
use super::transport::{QueryRow, ReplicationTransport};
use crate::sink::EventSink;
use crate::{Error, Result};

/// The logical decoding output plugin this client speaks.
pub const OUTPUT_PLUGIN: &str = "pgoutput";
/// pgoutput protocol version requested at `START_REPLICATION`.
pub const PROTO_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Identifying,
    SlotReady,
    Streaming,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Absent,
    Created,
    Streaming,
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSlot {
    pub name: String,
    /// Temporary slots are dropped by the server when the connection ends.
    pub temporary: bool,
    pub state: SlotState,
    pub consistent_point: Option<Lsn>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: u32,
    pub xlogpos: Lsn,
    pub dbname: Option<String>,
}

impl SystemInfo {
    fn from_row(row: &QueryRow) -> Result<Self> {
        let field = |name: &str| {
            row.get(name)
                .ok_or_else(|| Error::Protocol(format!("IDENTIFY_SYSTEM returned no {}", name)))
        };

        let timeline = field("timeline")?;
        Ok(Self {
            system_id: field("systemid")?.to_string(),
            timeline: timeline
                .parse()
                .map_err(|_| Error::Protocol(format!("invalid timeline '{}'", timeline)))?,
            xlogpos: field("xlogpos")?.parse()?,
            dbname: row.get("dbname").map(str::to_string),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub slot_name: String,
    pub publication: String,
    /// Empty publishes all tables.
    pub tables: Vec<String>,
    /// Resume position; the server's current position when `None`.
    pub start_lsn: Option<Lsn>,
    pub standby_interval: Duration,
}

/// One streaming connection with its temporary slot.
pub struct ReplicationSession<T> {
    transport: T,
    options: SessionOptions,
    state: SessionState,
    slot: ReplicationSlot,
    system: Option<SystemInfo>,
    start_lsn: Lsn,
}

impl<T: ReplicationTransport> ReplicationSession<T> {
    /// Wraps a connected transport. Nothing is sent until [`start`](Self::start).
    pub fn new(transport: T, options: SessionOptions) -> Self {
        let slot = ReplicationSlot {
            name: options.slot_name.clone(),
            temporary: true,
            state: SlotState::Absent,
            consistent_point: None,
        };
        Self {
            transport,
            start_lsn: options.start_lsn.unwrap_or_default(),
            options,
            state: SessionState::Connecting,
            slot,
            system: None,
        }
    }

    /// [`new`](Self::new) followed by [`start`](Self::start).
    pub async fn open<A>(transport: T, admin: &mut A, options: SessionOptions) -> Result<Self>
    where
        A: PublicationAdmin + ?Sized,
    {
        let mut session = Self::new(transport, options);
        session.start(admin).await?;
        Ok(session)
    }

    /// Runs the setup sequence and leaves the connection in copy-both mode.
    ///
    /// If any step fails, the session is closed and that step's error is
    /// returned; [`slot`](Self::slot) then tells whether the slot had been
    /// created.
    pub async fn start<A>(&mut self, admin: &mut A) -> Result<()>
    where
        A: PublicationAdmin + ?Sized,
    {
        if self.state != SessionState::Connecting {
            return Err(Error::Protocol(format!(
                "cannot start a session in state {:?}",
                self.state
            )));
        }

        match self.setup(admin).await {
            Ok(()) => {
                info!(
                    slot = %self.slot.name,
                    publication = %self.options.publication,
                    start_lsn = %self.start_lsn,
                    "Replication session open"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    slot = %self.options.slot_name,
                    state = ?self.state,
                    "Failed to open replication session: {}",
                    e
                );
                self.close().await;
                Err(e)
            }
        }
    }

    async fn setup<A>(&mut self, admin: &mut A) -> Result<()>
    where
        A: PublicationAdmin + ?Sized,
    {
        self.state = SessionState::Identifying;
        let system = identify_system(&mut self.transport).await?;
        info!(
            system_id = %system.system_id,
            timeline = system.timeline,
            xlogpos = %system.xlogpos,
            "Identified system"
        );
        self.start_lsn = self.options.start_lsn.unwrap_or(system.xlogpos);
        self.system = Some(system);

        admin
            .recreate_publication(&self.options.publication, &self.options.tables)
            .await?;

        self.slot.consistent_point =
            create_temporary_slot(&mut self.transport, &self.options.slot_name).await?;
        self.slot.state = SlotState::Created;
        self.state = SessionState::SlotReady;

        self.transport
            .start_copy_both(&start_replication_command(
                &self.options.slot_name,
                self.start_lsn,
                &self.options.publication,
            ))
            .await?;
        self.slot.state = SlotState::Streaming;
        self.state = SessionState::Streaming;
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn slot(&self) -> &ReplicationSlot {
        &self.slot
    }

    /// Server identity, known once the session got past `IDENTIFY_SYSTEM`.
    pub fn system(&self) -> Option<&SystemInfo> {
        self.system.as_ref()
    }

    /// Position streaming was started from.
    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    /// A standby loop positioned at this session's start, with an empty
    /// relation registry.
    pub fn standby_loop(&self) -> StandbyLoop {
        StandbyLoop::new(
            self.options.slot_name.clone(),
            self.start_lsn,
            self.options.standby_interval,
        )
    }

    /// Drives `standby` over this session's stream until cancellation or
    /// failure.
    pub async fn stream<S>(
        &mut self,
        standby: &mut StandbyLoop,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        S: EventSink + ?Sized,
    {
        if self.state != SessionState::Streaming {
            return Err(Error::Protocol(format!(
                "cannot stream in state {:?}",
                self.state
            )));
        }

        let result = standby.run(&mut self.transport, sink, cancel).await;
        self.state = SessionState::Draining;
        result
    }

    /// Releases the connection. The server drops the temporary slot with it.
    /// Closing twice is a no-op.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.transport.close().await;
        self.state = SessionState::Closed;
        if self.slot.temporary && self.slot.state != SlotState::Absent {
            self.slot.state = SlotState::Dropped;
        }
        info!(slot = %self.slot.name, state = ?self.state, "Replication session closed");
    }
}

async fn identify_system<T: ReplicationTransport + ?Sized>(transport: &mut T) -> Result<SystemInfo> {
    let rows = transport.simple_query("IDENTIFY_SYSTEM").await?;
    let row = rows
        .first()
        .ok_or_else(|| Error::Protocol("IDENTIFY_SYSTEM returned no rows".to_string()))?;
    SystemInfo::from_row(row)
}

async fn create_temporary_slot<T: ReplicationTransport + ?Sized>(
    transport: &mut T,
    slot_name: &str,
) -> Result<Option<Lsn>> {
    let query = format!(
        "CREATE_REPLICATION_SLOT {} TEMPORARY LOGICAL {} NOEXPORT_SNAPSHOT",
        slot_name, OUTPUT_PLUGIN
    );
    let rows = transport.simple_query(&query).await?;

    let consistent_point = rows
        .first()
        .and_then(|row| row.get("consistent_point"))
        .map(str::parse::<Lsn>)
        .transpose()?;
    debug!(
        slot = %slot_name,
        consistent_point = ?consistent_point,
        "Created temporary replication slot"
    );
    Ok(consistent_point)
}

pub fn start_replication_command(slot_name: &str, start: Lsn, publication: &str) -> String {
    format!(
        "START_REPLICATION SLOT {} LOGICAL {} (proto_version '{}', publication_names {})",
        slot_name,
        start,
        PROTO_VERSION,
        escape_literal(publication)
    )
}
