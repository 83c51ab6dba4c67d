use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::postgres::{Lsn, PgAdmin, PgConnection, ReplicationSession, SessionOptions};
use crate::sink::EventSink;
use crate::{Config, Error, Result};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Keeps a replication stream running: opens a session, streams until it
/// ends, and reopens reconnect-worthy failures from the last acknowledged
/// position.
pub struct Replicator {
    config: Config,
    checkpoints: Option<CheckpointManager>,
    acknowledged: Option<Lsn>,
}

impl Replicator {
    pub fn new(config: Config) -> Self {
        let checkpoints = config
            .replication
            .checkpoint_file
            .as_ref()
            .map(CheckpointManager::new);
        Self {
            config,
            checkpoints,
            acknowledged: None,
        }
    }

    /// Last position acknowledged to the server by any session.
    pub fn acknowledged(&self) -> Option<Lsn> {
        self.acknowledged
    }

    /// Runs until `cancel` fires or a failure that reconnecting cannot fix.
    pub async fn run<S>(&mut self, sink: &mut S, cancel: CancellationToken) -> Result<()>
    where
        S: EventSink + ?Sized,
    {
        info!(
            url = %self.config.postgres_url(),
            slot = %self.config.postgres.slot_name,
            "Replicator starting"
        );

        let mut resume = self.resolve_start_lsn().await?;
        let mut attempts = 0u32;

        loop {
            let before = self.acknowledged;
            let result = self.run_session(sink, &cancel, resume).await;

            if self.acknowledged > before {
                // The session made progress, so the failure budget starts over.
                attempts = 0;
            }
            resume = self.acknowledged.or(resume);

            match result {
                Ok(()) | Err(Error::Shutdown) => {
                    info!(position = ?self.acknowledged, "Replicator stopped");
                    return Ok(());
                }
                Err(e)
                    if e.is_reconnectable()
                        && attempts < self.config.replication.max_reconnect_attempts =>
                {
                    attempts += 1;
                    let delay = backoff_delay(
                        Duration::from_millis(self.config.replication.reconnect_backoff_ms),
                        attempts,
                    );
                    warn!(
                        attempt = attempts,
                        max_attempts = self.config.replication.max_reconnect_attempts,
                        delay_ms = delay.as_millis() as u64,
                        resume = ?resume,
                        "Replication session failed, reconnecting: {}",
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!(class = ?e.class(), "Replication failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// An explicit `start_lsn` wins over the checkpoint file.
    async fn resolve_start_lsn(&self) -> Result<Option<Lsn>> {
        if let Some(lsn) = self.config.start_lsn()? {
            info!(start_lsn = %lsn, "Starting from configured position");
            return Ok(Some(lsn));
        }

        match &self.checkpoints {
            Some(manager) => Ok(manager.load().await?.map(|checkpoint| {
                if checkpoint.slot != self.config.postgres.slot_name {
                    warn!(
                        checkpoint_slot = %checkpoint.slot,
                        "Checkpoint was written by a different slot"
                    );
                }
                checkpoint.lsn
            })),
            None => Ok(None),
        }
    }

    fn session_options(&self, start_lsn: Option<Lsn>) -> SessionOptions {
        SessionOptions {
            slot_name: self.config.postgres.slot_name.clone(),
            publication: self.config.postgres.publication.clone(),
            tables: self.config.postgres.tables.clone(),
            start_lsn,
            standby_interval: self.config.standby_interval(),
        }
    }

    async fn run_session<S>(
        &mut self,
        sink: &mut S,
        cancel: &CancellationToken,
        start_lsn: Option<Lsn>,
    ) -> Result<()>
    where
        S: EventSink + ?Sized,
    {
        let options = self.session_options(start_lsn);
        let postgres = &self.config.postgres;

        let open = async {
            let mut admin = PgAdmin::connect(postgres).await?;
            let transport = PgConnection::connect(postgres).await?;
            ReplicationSession::open(transport, &mut admin, options).await
        };
        let mut session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Shutdown),
            session = open => session?,
        };

        let mut standby = session.standby_loop();
        let tracker = self.checkpoints.clone().map(|manager| {
            let positions = standby.subscribe();
            let slot = postgres.slot_name.clone();
            tokio::spawn(async move { manager.follow(&slot, positions).await })
        });

        let result = session.stream(&mut standby, sink, cancel).await;
        self.acknowledged = Some(standby.acknowledged());
        session.close().await;

        // Dropping the loop closes the position channel and ends the tracker.
        drop(standby);
        if let Some(tracker) = tracker {
            match tracker.await {
                Ok(persisted) => debug!(persisted = ?persisted, "Checkpoint tracker finished"),
                Err(e) => warn!("Checkpoint task failed: {}", e),
            }
        }

        result
    }
}

/// Exponential backoff: `base`, `2 * base`, `4 * base`, ... capped at one
/// minute.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_BACKOFF)
}
