//! Publication management over an ordinary (non-replication) connection.

use async_trait::async_trait;
use postgres_protocol::escape::escape_identifier;
use std::time::Duration;
use tokio_postgres::{Client, NoTls};
use tracing::{error, info};

use crate::config::PostgresConfig;
use crate::Result;

/// Administrative SQL the session needs before streaming.
#[async_trait]
pub trait PublicationAdmin: Send {
    /// Drops `name` if it exists and creates it for `tables`, or for all
    /// tables when `tables` is empty.
    async fn recreate_publication(&mut self, name: &str, tables: &[String]) -> Result<()>;
}

/// Builds the `DROP` and `CREATE` statements for a publication.
pub fn publication_statements(name: &str, tables: &[String]) -> (String, String) {
    let publication = escape_identifier(name);
    let drop = format!("DROP PUBLICATION IF EXISTS {}", publication);

    let create = if tables.is_empty() {
        format!("CREATE PUBLICATION {} FOR ALL TABLES", publication)
    } else {
        let tables = tables
            .iter()
            .map(|t| qualified_table(t))
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE PUBLICATION {} FOR TABLE {}", publication, tables)
    };

    (drop, create)
}

fn qualified_table(table: &str) -> String {
    match table.split_once('.') {
        Some((schema, name)) => format!("{}.{}", escape_identifier(schema), escape_identifier(name)),
        None => escape_identifier(table),
    }
}

/// [`PublicationAdmin`] backed by a `tokio-postgres` client.
pub struct PgAdmin {
    client: Client,
    connection_task: tokio::task::JoinHandle<()>,
}

impl PgAdmin {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&config.host)
            .port(config.port)
            .user(&config.username)
            .dbname(&config.database)
            .application_name(env!("CARGO_PKG_NAME"))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs));
        if let Some(password) = &config.password {
            pg_config.password(password);
        }

        let (client, connection) = pg_config.connect(NoTls).await?;
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Admin connection error: {}", e);
            }
        });

        Ok(Self {
            client,
            connection_task,
        })
    }
}

impl Drop for PgAdmin {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}

#[async_trait]
impl PublicationAdmin for PgAdmin {
    async fn recreate_publication(&mut self, name: &str, tables: &[String]) -> Result<()> {
        let (drop, create) = publication_statements(name, tables);
        self.client.batch_execute(&drop).await?;
        self.client.batch_execute(&create).await?;

        if tables.is_empty() {
            info!(publication = %name, "Created publication for all tables");
        } else {
            info!(publication = %name, tables = ?tables, "Created publication");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_for_listed_tables() {
        let (drop, create) = publication_statements(
            "gizmo_pub",
            &["gizmos".to_string(), "inventory.widgets".to_string()],
        );
        assert_eq!(drop, r#"DROP PUBLICATION IF EXISTS "gizmo_pub""#);
        assert_eq!(
            create,
            r#"CREATE PUBLICATION "gizmo_pub" FOR TABLE "gizmos", "inventory"."widgets""#
        );
    }

    #[test]
    fn test_statements_for_all_tables() {
        let (_, create) = publication_statements("all_pub", &[]);
        assert_eq!(create, r#"CREATE PUBLICATION "all_pub" FOR ALL TABLES"#);
    }

    #[test]
    fn test_identifiers_are_escaped() {
        let (drop, _) = publication_statements(r#"we"ird"#, &[]);
        assert_eq!(drop, r#"DROP PUBLICATION IF EXISTS "we""ird""#);
    }
}
