pub mod buffer;
pub mod connection;
pub mod decoder;
pub mod lsn;
pub mod protocol;
pub mod publication;
pub mod relation;
pub mod replication;
pub mod standby;
pub mod translator;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use connection::PgConnection;
pub use decoder::{LogicalMessage, OldTuple, OldTupleKind, TupleData};
pub use lsn::Lsn;
pub use protocol::{PrimaryKeepalive, ReplicationFrame, StandbyStatus, XLogData};
pub use publication::{PgAdmin, PublicationAdmin};
pub use relation::{ColumnDescriptor, RelationDescriptor, RelationName, RelationRegistry, ReplicaIdentity};
pub use replication::{ReplicationSession, SessionOptions, SessionState, SystemInfo};
pub use standby::StandbyLoop;
pub use translator::translate;
pub use transport::{CopyRead, QueryRow, ReplicationTransport};
pub use types::*;
