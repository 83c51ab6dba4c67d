use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::postgres::Lsn;
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    pub publication: String,
    pub slot_name: String,
    /// Tables to publish as `table` or `schema.table`; empty means all tables.
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_standby_interval_secs")]
    pub standby_interval_secs: u64,
    /// Resume position in `X/Y` form; overrides both the checkpoint and the
    /// server's current position.
    #[serde(default)]
    pub start_lsn: Option<String>,
    #[serde(default)]
    pub checkpoint_file: Option<PathBuf>,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkFormat {
    /// One log line per event.
    #[default]
    Log,
    /// Newline-delimited JSON on stdout.
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SinkConfig {
    #[serde(default)]
    pub format: SinkFormat,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            standby_interval_secs: default_standby_interval_secs(),
            start_lsn: None,
            checkpoint_file: None,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_LOGREPL")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let slot = &self.postgres.slot_name;
        if slot.is_empty()
            || slot.len() > 63
            || !slot
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(Error::Config(format!(
                "slot_name '{}' must be 1-63 characters of lower-case letters, digits and underscores",
                slot
            )));
        }
        if self.postgres.publication.is_empty() {
            return Err(Error::Config("publication must not be empty".to_string()));
        }
        if self.replication.standby_interval_secs == 0 {
            return Err(Error::Config(
                "standby_interval_secs must be at least 1".to_string(),
            ));
        }
        self.start_lsn()?;
        Ok(())
    }

    pub fn standby_interval(&self) -> Duration {
        Duration::from_secs(self.replication.standby_interval_secs)
    }

    pub fn start_lsn(&self) -> Result<Option<Lsn>> {
        self.replication
            .start_lsn
            .as_deref()
            .map(|s| {
                s.parse()
                    .map_err(|_| Error::Config(format!("start_lsn '{}' is not of the form X/Y", s)))
            })
            .transpose()
    }

    /// Connection URL with the password masked, for logging.
    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:***@{}:{}/{}?replication=database",
            self.postgres.username, self.postgres.host, self.postgres.port, self.postgres.database
        )
    }
}

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_standby_interval_secs() -> u64 {
    10
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_backoff_ms() -> u64 {
    1000
}
