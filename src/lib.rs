//! Logical replication client for PostgreSQL.
//!
//! Attaches to the write-ahead log through a temporary `pgoutput` slot,
//! decodes the copy-mode stream into typed [`postgres::ChangeEvent`]s, hands
//! them to an [`sink::EventSink`] and acknowledges consumed positions back to
//! the server.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod postgres;
pub mod replicator;
pub mod sink;

pub use config::Config;
pub use error::{Error, ErrorClass, Result};
pub use replicator::Replicator;
