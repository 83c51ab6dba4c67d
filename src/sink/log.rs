use async_trait::async_trait;
use std::fmt::Write;
use tracing::info;

use super::EventSink;
use crate::postgres::{ChangeEvent, ChangeRecord, ColumnValue, Row};

/// Writes one `info!` line per record.
#[derive(Debug, Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }

    /// Renders `event` the way it is logged, e.g. `INSERT public.gizmos(id: 7, val: hello)`.
    pub fn describe(event: &ChangeEvent) -> String {
        match event {
            ChangeEvent::Begin { xid, final_lsn, .. } => format!("BEGIN xid={} lsn={}", xid, final_lsn),
            ChangeEvent::Commit { end_lsn, .. } => format!("COMMIT lsn={}", end_lsn),
            ChangeEvent::Insert { relation, new } => format!("INSERT {}({})", relation, render(new)),
            ChangeEvent::Update { relation, old, new } => match old {
                Some(old) => format!(
                    "UPDATE {}({}) -> ({})",
                    relation,
                    render(&old.values),
                    render(new)
                ),
                None => format!("UPDATE {}({})", relation, render(new)),
            },
            ChangeEvent::Delete { relation, old } => {
                format!("DELETE {}({})", relation, render(&old.values))
            }
            ChangeEvent::Truncate {
                relations, cascade, ..
            } => {
                let names: Vec<String> = relations.iter().map(|r| r.to_string()).collect();
                let mut line = format!("TRUNCATE {}", names.join(", "));
                if *cascade {
                    line.push_str(" CASCADE");
                }
                line
            }
        }
    }
}

fn render(row: &Row) -> String {
    let mut out = String::new();
    for (i, (name, value)) in row.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = match value {
            ColumnValue::Text(s) => write!(out, "{}: {}", name, s),
            ColumnValue::Null => write!(out, "{}: NULL", name),
            ColumnValue::Unchanged => write!(out, "{}: <unchanged>", name),
            ColumnValue::Binary(b) => write!(out, "{}: <{} bytes>", name, b.len()),
        };
    }
    out
}

#[async_trait]
impl EventSink for LogSink {
    async fn emit(&mut self, record: ChangeRecord) -> anyhow::Result<()> {
        info!(
            lsn = %record.source.lsn,
            xid = ?record.source.xid,
            "{}",
            Self::describe(&record.event)
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::RelationName;

    #[test]
    fn test_describe_insert() {
        let event = ChangeEvent::Insert {
            relation: RelationName {
                schema: "public".to_string(),
                table: "gizmos".to_string(),
            },
            new: Row::new(vec![
                ("id".to_string(), ColumnValue::Text("7".to_string())),
                ("val".to_string(), ColumnValue::Text("hello".to_string())),
                ("note".to_string(), ColumnValue::Null),
            ]),
        };
        assert_eq!(
            LogSink::describe(&event),
            "INSERT public.gizmos(id: 7, val: hello, note: NULL)"
        );
    }

    #[test]
    fn test_describe_truncate() {
        let event = ChangeEvent::Truncate {
            relations: vec![
                RelationName {
                    schema: "public".to_string(),
                    table: "gizmos".to_string(),
                },
                RelationName {
                    schema: "public".to_string(),
                    table: "widgets".to_string(),
                },
            ],
            cascade: true,
            restart_identity: false,
        };
        assert_eq!(
            LogSink::describe(&event),
            "TRUNCATE public.gizmos, public.widgets CASCADE"
        );
    }
}
