//! Relation schema registry.
//!
//! The server describes each relation once per session (and again whenever
//! its definition changes) before sending rows for it. Tuple data is purely
//! positional, so rows can only be interpreted against the latest
//! description for their relation id.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// How much of the old row the server sends on update and delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaIdentity {
    /// Primary key columns.
    Default,
    /// No old row at all.
    Nothing,
    /// Every column.
    Full,
    /// Columns of a chosen unique index.
    Index,
}

impl ReplicaIdentity {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'd' => Some(ReplicaIdentity::Default),
            b'n' => Some(ReplicaIdentity::Nothing),
            b'f' => Some(ReplicaIdentity::Full),
            b'i' => Some(ReplicaIdentity::Index),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_id: u32,
    pub type_modifier: i32,
    /// Part of the replica identity key.
    pub is_key: bool,
}

/// Schema-qualified relation name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationName {
    pub schema: String,
    pub table: String,
}

impl fmt::Display for RelationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDescriptor {
    pub id: u32,
    pub name: RelationName,
    pub replica_identity: ReplicaIdentity,
    /// In tuple order.
    pub columns: Vec<ColumnDescriptor>,
}

impl RelationDescriptor {
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// Relation id to descriptor map for one replication session.
#[derive(Debug, Default)]
pub struct RelationRegistry {
    relations: HashMap<u32, Arc<RelationDescriptor>>,
}

impl RelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `descriptor`, replacing any earlier definition of the same id.
    pub fn register(&mut self, descriptor: RelationDescriptor) -> Arc<RelationDescriptor> {
        let descriptor = Arc::new(descriptor);
        debug!(
            relation_id = descriptor.id,
            relation = %descriptor.name,
            columns = descriptor.columns.len(),
            "Registered relation"
        );
        self.relations.insert(descriptor.id, Arc::clone(&descriptor));
        descriptor
    }

    pub fn lookup(&self, relation_id: u32) -> Result<Arc<RelationDescriptor>> {
        self.relations
            .get(&relation_id)
            .cloned()
            .ok_or(Error::UnknownRelation { relation_id })
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}
