//! Turns positional pgoutput messages into named change events.

use std::sync::Arc;

use tracing::{debug, trace};

use super::decoder::{LogicalMessage, OldTuple, OldTupleKind, TupleData};
use super::relation::{RelationDescriptor, RelationRegistry};
use super::types::{ChangeEvent, OldRow, OldRowKind, Row};
use crate::{Error, Result};

/// Applies `message` to `registry` and returns the event it produces, if any.
///
/// Relation messages update the registry and produce nothing. Data messages
/// must reference a relation registered earlier in the same session.
pub fn translate(
    message: LogicalMessage,
    registry: &mut RelationRegistry,
) -> Result<Option<ChangeEvent>> {
    let event = match message {
        LogicalMessage::Relation(descriptor) => {
            registry.register(descriptor);
            None
        }
        LogicalMessage::Begin {
            final_lsn,
            commit_time,
            xid,
        } => Some(ChangeEvent::Begin {
            final_lsn,
            commit_time,
            xid,
        }),
        LogicalMessage::Commit {
            commit_lsn,
            end_lsn,
            commit_time,
            ..
        } => Some(ChangeEvent::Commit {
            commit_lsn,
            end_lsn,
            commit_time,
        }),
        LogicalMessage::Insert {
            relation_id,
            new_tuple,
        } => {
            let relation = registry.lookup(relation_id)?;
            Some(ChangeEvent::Insert {
                new: named_row(&relation, new_tuple)?,
                relation: relation.name.clone(),
            })
        }
        LogicalMessage::Update {
            relation_id,
            old_tuple,
            new_tuple,
        } => {
            let relation = registry.lookup(relation_id)?;
            let old = old_tuple
                .map(|old| named_old_row(&relation, old))
                .transpose()?;
            Some(ChangeEvent::Update {
                new: named_row(&relation, new_tuple)?,
                old,
                relation: relation.name.clone(),
            })
        }
        LogicalMessage::Delete {
            relation_id,
            old_tuple,
        } => {
            let relation = registry.lookup(relation_id)?;
            Some(ChangeEvent::Delete {
                old: named_old_row(&relation, old_tuple)?,
                relation: relation.name.clone(),
            })
        }
        LogicalMessage::Truncate {
            cascade,
            restart_identity,
            relation_ids,
        } => {
            let relations = relation_ids
                .into_iter()
                .map(|id| registry.lookup(id).map(|r| r.name.clone()))
                .collect::<Result<Vec<_>>>()?;
            Some(ChangeEvent::Truncate {
                relations,
                cascade,
                restart_identity,
            })
        }
        LogicalMessage::Origin { commit_lsn, name } => {
            debug!(origin = %name, lsn = %commit_lsn, "Replication origin");
            None
        }
        LogicalMessage::Type {
            type_id,
            namespace,
            name,
        } => {
            debug!(type_id, "Custom type {}.{}", namespace, name);
            None
        }
        LogicalMessage::Message {
            transactional,
            lsn,
            prefix,
            content,
        } => {
            debug!(
                prefix = %prefix,
                lsn = %lsn,
                transactional,
                len = content.len(),
                "Logical decoding message"
            );
            None
        }
        LogicalMessage::Unknown { tag } => {
            debug!("Skipping unknown pgoutput message type: {}", tag as char);
            None
        }
    };

    if let Some(event) = &event {
        trace!(kind = event.kind(), "Translated change event");
    }
    Ok(event)
}

fn named_row(relation: &Arc<RelationDescriptor>, tuple: TupleData) -> Result<Row> {
    let TupleData(values) = tuple;
    if values.len() != relation.columns.len() {
        return Err(Error::SchemaMismatch {
            relation: relation.name.to_string(),
            expected: relation.columns.len(),
            actual: values.len(),
        });
    }

    Ok(Row::new(
        relation
            .columns
            .iter()
            .map(|c| c.name.clone())
            .zip(values)
            .collect(),
    ))
}

fn named_old_row(relation: &Arc<RelationDescriptor>, old: OldTuple) -> Result<OldRow> {
    let kind = match old.kind {
        OldTupleKind::Key => OldRowKind::Key,
        OldTupleKind::Full => OldRowKind::Full,
    };
    Ok(OldRow {
        kind,
        values: named_row(relation, old.tuple)?,
    })
}
