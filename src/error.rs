//! Error types and result handling for pg-logrepl.
//!
//! This module defines the main error type [`Error`], the coarse
//! [`ErrorClass`] taxonomy used to decide whether a failed session is worth
//! reopening, and a convenience [`Result`] type alias used throughout the
//! crate.
//!
//! # Example
//!
//! ```rust
//! use pg_logrepl::{Error, ErrorClass, Result};
//!
//! fn lookup_relation() -> Result<()> {
//!     Err(Error::UnknownRelation { relation_id: 16384 })
//! }
//!
//! match lookup_relation() {
//!     Ok(()) => println!("found"),
//!     Err(e) if e.class() == ErrorClass::Consistency => eprintln!("schema gap: {}", e),
//!     Err(e) => eprintln!("other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for pg-logrepl operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from the config file, environment or validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client error on the administrative connection.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON serialization error when encoding events or checkpoints.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error on the replication socket or the checkpoint file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection-level failure: closed socket, refused connect, stream ended.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication failure with PostgreSQL.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// `ErrorResponse` sent by the server.
    #[error("Server error: {severity} {code}: {message}")]
    Server {
        /// Severity field, e.g. `ERROR` or `FATAL`
        severity: String,
        /// SQLSTATE code
        code: String,
        /// Primary human-readable message
        message: String,
    },

    /// Unexpected backend message for the current protocol state.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid or malformed replication message.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// Text that does not parse as an `X/Y` log sequence number.
    #[error("Invalid LSN: {0}")]
    InvalidLsn(String),

    /// A data message referenced a relation that was never described.
    #[error("Unknown relation ID: {relation_id}")]
    UnknownRelation {
        /// Server-assigned relation identifier
        relation_id: u32,
    },

    /// A tuple does not line up with the registered column list.
    #[error("Column count mismatch for {relation}: schema has {expected}, tuple has {actual}")]
    SchemaMismatch {
        /// Qualified relation name
        relation: String,
        /// Columns in the registered descriptor
        expected: usize,
        /// Columns in the received tuple
        actual: usize,
    },

    /// The downstream sink refused an event.
    #[error("Sink error: {0:#}")]
    Sink(#[source] anyhow::Error),

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// Graceful shutdown was requested (e.g., via Ctrl+C).
    ///
    /// This is not really an error but uses the error mechanism
    /// to cleanly exit the replication loop.
    #[error("Shutdown requested")]
    Shutdown,
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The connection is gone or unusable; reopening a session may help.
    Transport,
    /// The byte stream cannot be interpreted; the session state is lost.
    Protocol,
    /// Decoded data contradicts the relation registry.
    Consistency,
    /// The downstream consumer failed.
    Sink,
    /// Bad configuration or local serialization problem.
    Config,
    /// Cancellation was requested.
    Shutdown,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Postgres(_)
            | Error::Io(_)
            | Error::Connection(_)
            | Error::Authentication(_)
            | Error::Server { .. }
            | Error::Timeout { .. } => ErrorClass::Transport,
            Error::Protocol(_) | Error::InvalidMessage { .. } | Error::InvalidLsn(_) => {
                ErrorClass::Protocol
            }
            Error::UnknownRelation { .. } | Error::SchemaMismatch { .. } => {
                ErrorClass::Consistency
            }
            Error::Sink(_) => ErrorClass::Sink,
            Error::Config(_) | Error::Serialization(_) => ErrorClass::Config,
            Error::Shutdown => ErrorClass::Shutdown,
        }
    }

    /// Whether the caller should reopen the session after this error.
    ///
    /// Only transport failures qualify, and of those only the ones that a new
    /// connection can plausibly fix: authentication failures and non-fatal
    /// server errors (bad SQL, permissions) would fail again identically.
    pub fn is_reconnectable(&self) -> bool {
        match self {
            Error::Io(_) | Error::Connection(_) | Error::Timeout { .. } => true,
            // Anything the server did not report itself is a connection problem.
            Error::Postgres(e) => e.as_db_error().is_none(),
            Error::Server { severity, .. } => severity == "FATAL" || severity == "PANIC",
            _ => false,
        }
    }

    pub(crate) fn invalid_message(message: impl Into<String>) -> Self {
        Error::InvalidMessage {
            message: message.into(),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

/// A convenient Result type alias for pg-logrepl operations.
///
/// This is equivalent to `std::result::Result<T, pg_logrepl::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
