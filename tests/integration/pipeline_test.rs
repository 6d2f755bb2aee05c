// tests/integration/pipeline_test.rs

//! Integration tests for pipelines and MULTI/EXEC transactions.

use super::mock_server::MockServer;
use super::test_helpers::{connect, reconnected, within};
use bytes::Bytes;
use spinel_client::core::errors::ServerErrorKind;
use spinel_client::{Client, ClientError, RespValue, TransactionOutcome, cmd};

// ===== Pipelines =====

#[tokio::test]
async fn test_pipeline_returns_replies_in_order() {
    let server = MockServer::start().await;
    let client = Client::from(connect(&server).await);

    let results = within(
        client
            .pipeline()
            .cmd(cmd("SET").arg("a").arg(1))
            .cmd(cmd("INCR").arg("a"))
            .cmd(cmd("GET").arg("a"))
            .exec(),
    )
    .await
    .unwrap();

    let values: Vec<RespValue> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(
        values,
        vec![
            RespValue::Status("OK".into()),
            RespValue::Integer(2),
            RespValue::Bulk(Bytes::from_static(b"2")),
        ]
    );
}

#[tokio::test]
async fn test_pipeline_error_is_isolated_to_its_command() {
    let server = MockServer::start().await;
    let client = Client::from(connect(&server).await);

    let results = within(
        client
            .pipeline()
            .cmd(cmd("SET").arg("x").arg("not-a-number"))
            .cmd(cmd("INCR").arg("x"))
            .cmd(cmd("GET").arg("x"))
            .exec(),
    )
    .await
    .unwrap();

    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    match &results[1] {
        Err(ClientError::Server(e)) => assert_eq!(e.kind, ServerErrorKind::Generic),
        other => panic!("Expected server error, got {other:?}"),
    }
    assert_eq!(
        results[2].as_ref().unwrap(),
        &RespValue::Bulk(Bytes::from_static(b"not-a-number"))
    );
}

#[tokio::test]
async fn test_empty_pipeline() {
    let server = MockServer::start().await;
    let client = Client::from(connect(&server).await);

    let pipeline = client.pipeline();
    assert!(pipeline.is_empty());
    let results = pipeline.exec().await.unwrap();
    assert!(results.is_empty());
}

// ===== Transactions =====

#[tokio::test]
async fn test_transaction_commits() {
    let server = MockServer::start().await;
    let client = Client::from(connect(&server).await);

    let outcome = within(
        client
            .transaction()
            .cmd(cmd("SET").arg("balance").arg(10))
            .cmd(cmd("INCRBY").arg("balance").arg(5))
            .exec(),
    )
    .await
    .unwrap();

    let results = outcome.into_results().expect("transaction should commit");
    assert_eq!(results.len(), 2);
    assert_eq!(results[1].as_ref().unwrap(), &RespValue::Integer(15));
    assert_eq!(server.value("balance"), Some(Bytes::from_static(b"15")));
    assert_eq!(server.count("MULTI", None), 1);
    assert_eq!(server.count("EXEC", None), 1);
}

#[tokio::test]
async fn test_watch_conflict_aborts_without_side_effects() {
    let server = MockServer::start().await;
    let client = Client::from(connect(&server).await);
    server.insert("watched", "1");

    client.send(cmd("WATCH").arg("watched")).await.unwrap();
    // Another client modifies the key between WATCH and EXEC.
    server.insert("watched", "changed");

    let outcome = within(
        client
            .transaction()
            .cmd(cmd("SET").arg("watched").arg("mine"))
            .cmd(cmd("SET").arg("other").arg("mine"))
            .exec(),
    )
    .await
    .unwrap();

    assert!(matches!(outcome, TransactionOutcome::Aborted));
    assert!(outcome.is_aborted());
    assert_eq!(server.value("watched"), Some(Bytes::from_static(b"changed")));
    assert_eq!(server.value("other"), None);
}

#[tokio::test]
async fn test_watch_lost_to_reconnect_aborts_transaction() {
    let server = MockServer::start().await;
    let conn = connect(&server).await;
    let client = Client::from(conn.clone());
    client.send(cmd("WATCH").arg("balance")).await.unwrap();

    let mut events = conn.events();
    server.kill_connections();
    reconnected(&mut events).await;

    let outcome = within(
        client
            .transaction()
            .cmd(cmd("SET").arg("balance").arg(10))
            .exec(),
    )
    .await
    .unwrap();
    assert!(outcome.is_aborted());
    assert_eq!(server.value("balance"), None);
    assert_eq!(server.count("MULTI", None), 0);

    // Only the first transaction after the loss is affected.
    let outcome = within(
        client
            .transaction()
            .cmd(cmd("SET").arg("balance").arg(10))
            .exec(),
    )
    .await
    .unwrap();
    assert!(!outcome.is_aborted());
    assert_eq!(server.value("balance"), Some(Bytes::from_static(b"10")));
}

#[tokio::test]
async fn test_queue_error_aborts_whole_transaction() {
    let server = MockServer::start().await;
    let client = Client::from(connect(&server).await);

    let err = within(
        client
            .transaction()
            .cmd(cmd("SET").arg("k").arg("v"))
            .cmd(cmd("NOTACOMMAND").arg("k"))
            .exec(),
    )
    .await
    .unwrap_err();

    match err {
        ClientError::ExecAbort { errors } => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].0, 1);
            assert!(errors[0].1.message.contains("unknown command"));
        }
        other => panic!("Expected ExecAbort, got {other:?}"),
    }
    assert_eq!(server.value("k"), None);
}

#[tokio::test]
async fn test_transaction_then_plain_commands() {
    let server = MockServer::start().await;
    let client = Client::from(connect(&server).await);

    let outcome = client
        .transaction()
        .cmd(cmd("INCR").arg("n"))
        .exec()
        .await
        .unwrap();
    assert!(!outcome.is_aborted());

    // Replies after EXEC line up with their commands again.
    assert_eq!(client.incr("n").await.unwrap(), 2);
    assert_eq!(client.ping().await.unwrap(), "PONG");
}
