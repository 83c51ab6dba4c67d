#![allow(dead_code)]

use pg_logrepl::config::{Config, PostgresConfig, ReplicationConfig, SinkConfig};
use std::env;
use tokio_postgres::{Client, NoTls};

/// Get test configuration from environment variables
pub fn get_test_config() -> Config {
    // Use TEST_ prefix for test environment variables
    let postgres = PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: Some(env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string())),
        publication: format!("test_publication_{}", std::process::id()),
        slot_name: format!("test_slot_{}", std::process::id()),
        tables: vec![],
        connect_timeout_secs: 10,
    };

    let replication = ReplicationConfig {
        standby_interval_secs: 1,
        max_reconnect_attempts: 1,
        reconnect_backoff_ms: 100,
        ..Default::default()
    };

    Config {
        postgres,
        replication,
        sink: SinkConfig::default(),
    }
}

/// Opens an ordinary client for issuing DML against the test database.
pub async fn connect_client(config: &Config) -> Client {
    let pg = &config.postgres;
    let conn_str = format!(
        "host={} port={} user={} password={} dbname={}",
        pg.host,
        pg.port,
        pg.username,
        pg.password.as_deref().unwrap_or_default(),
        pg.database
    );
    let (client, connection) = tokio_postgres::connect(&conn_str, NoTls)
        .await
        .expect("Failed to connect to test database");
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("Test connection error: {}", e);
        }
    });
    client
}

/// Recreates `table` as `(id serial primary key, name text, qty int)` and
/// points the config's publication at it.
pub async fn setup_table(client: &Client, config: &mut Config, table: &str) {
    client
        .batch_execute(&format!(
            "DROP TABLE IF EXISTS {table};
             CREATE TABLE {table} (id SERIAL PRIMARY KEY, name TEXT, qty INT);"
        ))
        .await
        .expect("Failed to create test table");
    config.postgres.tables = vec![table.to_string()];
}

pub async fn cleanup(client: &Client, config: &Config, table: &str) {
    client
        .batch_execute(&format!(
            "DROP PUBLICATION IF EXISTS {}; DROP TABLE IF EXISTS {};",
            config.postgres.publication, table
        ))
        .await
        .ok();
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("pg_logrepl=debug")
        .try_init()
        .ok();
}
