mod common;

use pg_logrepl::postgres::{PgAdmin, PgConnection, ReplicationSession, SessionOptions};
use pg_logrepl::sink::ChannelSink;
use pg_logrepl::{Error, ErrorClass, Replicator};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A port nothing listens on.
const CLOSED_PORT: u16 = 1;

#[tokio::test]
async fn test_unreachable_server_is_reconnectable() {
    let mut config = common::get_test_config();
    config.postgres.host = "127.0.0.1".to_string();
    config.postgres.port = CLOSED_PORT;
    config.postgres.connect_timeout_secs = 2;

    let err = PgConnection::connect(&config.postgres).await.err().unwrap();
    assert_eq!(err.class(), ErrorClass::Transport);
    assert!(err.is_reconnectable());

    let err = PgAdmin::connect(&config.postgres).await.err().unwrap();
    assert!(err.is_reconnectable());
}

#[tokio::test]
async fn test_replicator_gives_up_after_max_attempts() {
    let mut config = common::get_test_config();
    config.postgres.host = "127.0.0.1".to_string();
    config.postgres.port = CLOSED_PORT;
    config.postgres.connect_timeout_secs = 2;
    config.replication.max_reconnect_attempts = 2;
    config.replication.reconnect_backoff_ms = 10;

    let (mut sink, _records) = ChannelSink::new(1);
    let mut replicator = Replicator::new(config);
    let err = replicator
        .run(&mut sink, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_reconnectable());
    assert_eq!(replicator.acknowledged(), None);
}

#[tokio::test]
async fn test_cancel_during_backoff_stops_cleanly() {
    let mut config = common::get_test_config();
    config.postgres.host = "127.0.0.1".to_string();
    config.postgres.port = CLOSED_PORT;
    config.postgres.connect_timeout_secs = 2;
    config.replication.max_reconnect_attempts = 10;
    config.replication.reconnect_backoff_ms = 60_000;

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        })
    };

    let (mut sink, _records) = ChannelSink::new(1);
    let mut replicator = Replicator::new(config);
    tokio::time::timeout(Duration::from_secs(10), replicator.run(&mut sink, cancel))
        .await
        .expect("replicator should stop promptly")
        .unwrap();
    canceller.await.unwrap();
}

#[tokio::test]
#[ignore] // Run with: cargo test --test failure_scenarios_test -- --ignored test_wrong_password
async fn test_wrong_password_is_not_reconnectable() {
    common::init_tracing();

    let mut config = common::get_test_config();
    config.postgres.password = Some("definitely-not-the-password".to_string());

    let err = PgConnection::connect(&config.postgres).await.err().unwrap();
    assert!(matches!(err, Error::Authentication(_)), "got {:?}", err);
    assert!(!err.is_reconnectable());
}

#[tokio::test]
#[ignore] // Run with: cargo test --test failure_scenarios_test -- --ignored test_missing_table
async fn test_missing_table_aborts_open() {
    common::init_tracing();

    let mut config = common::get_test_config();
    config.postgres.tables = vec!["table_that_does_not_exist".to_string()];

    let mut admin = PgAdmin::connect(&config.postgres).await.unwrap();
    let transport = PgConnection::connect(&config.postgres).await.unwrap();
    let result = ReplicationSession::open(
        transport,
        &mut admin,
        SessionOptions {
            slot_name: config.postgres.slot_name.clone(),
            publication: config.postgres.publication.clone(),
            tables: config.postgres.tables.clone(),
            start_lsn: None,
            standby_interval: Duration::from_secs(1),
        },
    )
    .await;

    let err = result.err().unwrap();
    assert!(matches!(err, Error::Postgres(_)), "got {:?}", err);
    assert!(!err.is_reconnectable());
}

#[tokio::test]
#[ignore] // Run with: cargo test --test failure_scenarios_test -- --ignored test_duplicate_slot
async fn test_duplicate_slot_name_fails_second_session() {
    common::init_tracing();

    let config = common::get_test_config();
    let options = SessionOptions {
        slot_name: config.postgres.slot_name.clone(),
        publication: config.postgres.publication.clone(),
        tables: vec![],
        start_lsn: None,
        standby_interval: Duration::from_secs(1),
    };

    let mut admin = PgAdmin::connect(&config.postgres).await.unwrap();
    let first = PgConnection::connect(&config.postgres).await.unwrap();
    let mut session = ReplicationSession::open(first, &mut admin, options.clone())
        .await
        .unwrap();

    let second = PgConnection::connect(&config.postgres).await.unwrap();
    let err = ReplicationSession::open(second, &mut admin, options)
        .await
        .err()
        .unwrap();
    match &err {
        Error::Server { code, .. } => assert_eq!(code, "42710"),
        other => panic!("Expected duplicate object error, got {:?}", other),
    }
    assert!(!err.is_reconnectable());

    session.close().await;
}
