// tests/integration/cluster_test.rs

//! Integration tests for cluster routing against two mock nodes sharing one
//! slot layout.

use super::mock_server::{ClusterLayout, MockServer};
use super::test_helpers::{endpoint_of, eventually, fast_reconnect, init_tracing, within};
use bytes::Bytes;
use futures::StreamExt;
use spinel_client::connection::ConnectionOptions;
use spinel_client::core::cluster::{NodeRole, get_slot};
use spinel_client::core::errors::ServerErrorKind;
use spinel_client::{
    ClientError, ClusterClient, ClusterOptions, MessageFilter, RespValue, TransactionOutcome, cmd,
};
use std::sync::Arc;
use std::time::Duration;

struct TestCluster {
    layout: Arc<ClusterLayout>,
    a: MockServer,
    b: MockServer,
    client: ClusterClient,
}

/// Two nodes, both seeds; A owns every slot until a test moves some to B.
async fn start_cluster() -> TestCluster {
    start_cluster_with(|_| {}).await
}

async fn start_cluster_with(tune: impl FnOnce(&mut ClusterOptions)) -> TestCluster {
    init_tracing();
    let layout = ClusterLayout::new();
    let a = MockServer::start_clustered(layout.clone()).await;
    let b = MockServer::start_clustered(layout.clone()).await;
    layout.assign(vec![(0, 16383, a.port())]);

    let node = ConnectionOptions::new(endpoint_of(&a)).with_reconnect(fast_reconnect());
    let mut options =
        ClusterOptions::new(vec![endpoint_of(&a), endpoint_of(&b)]).with_node_options(node);
    options.retry_delay_on_failover = Duration::from_millis(10);
    options.retry_delay_on_try_again = Duration::from_millis(10);
    options.retry_delay_on_cluster_down = Duration::from_millis(10);
    tune(&mut options);
    let client = within(ClusterClient::connect(options)).await.unwrap();
    TestCluster { layout, a, b, client }
}

#[tokio::test]
async fn test_initial_slot_table() {
    let cluster = start_cluster().await;

    let table = cluster.client.slot_table();
    assert_eq!(table.covered_slots(), 16384);
    assert_eq!(cluster.client.node_for_key(b"foo"), Some(endpoint_of(&cluster.a)));
    assert_eq!(table.nodes(NodeRole::Master), vec![endpoint_of(&cluster.a)]);
}

#[tokio::test]
async fn test_moved_redirect_is_followed_and_learned() {
    let cluster = start_cluster().await;
    let slot = get_slot(b"foo");
    assert_eq!(slot, 12182);

    cluster.layout.move_slot(slot, cluster.b.port());
    cluster.b.insert("foo", "bar");

    let value = within(cluster.client.send(cmd("GET").arg("foo"))).await.unwrap();
    assert_eq!(value, RespValue::Bulk(Bytes::from_static(b"bar")));

    let table = cluster.client.slot_table();
    assert_eq!(table.master_for_slot(slot), Some(&endpoint_of(&cluster.b)));
    assert_eq!(cluster.a.count("GET", Some("foo")), 1);

    // The next request goes straight to B.
    within(cluster.client.send(cmd("GET").arg("foo"))).await.unwrap();
    assert_eq!(cluster.a.count("GET", Some("foo")), 1);
    assert_eq!(cluster.b.count("GET", Some("foo")), 2);
}

#[tokio::test]
async fn test_ask_redirect_does_not_change_table() {
    let cluster = start_cluster().await;
    let slot = get_slot(b"foo");

    cluster.layout.start_migration(slot, cluster.b.port());
    cluster.b.insert("foo", "migrated");

    let value = within(cluster.client.send(cmd("GET").arg("foo"))).await.unwrap();
    assert_eq!(value, RespValue::Bulk(Bytes::from_static(b"migrated")));

    assert_eq!(
        cluster.client.slot_table().master_for_slot(slot),
        Some(&endpoint_of(&cluster.a))
    );
    assert_eq!(cluster.b.count("ASKING", None), 1);
}

#[tokio::test]
async fn test_keys_in_unmoved_slots_stay_on_owner() {
    let cluster = start_cluster().await;
    cluster.layout.move_slot(get_slot(b"foo"), cluster.b.port());

    cluster.client.send(cmd("SET").arg("bar").arg("1")).await.unwrap();
    assert_eq!(cluster.a.value("bar"), Some(Bytes::from_static(b"1")));
    assert_eq!(cluster.b.count("SET", Some("bar")), 0);
}

#[tokio::test]
async fn test_same_slot_pipeline() {
    let cluster = start_cluster().await;

    let results = within(
        cluster
            .client
            .pipeline()
            .cmd(cmd("SET").arg("{user1}:name").arg("ann"))
            .cmd(cmd("INCR").arg("{user1}:visits"))
            .cmd(cmd("GET").arg("{user1}:name"))
            .exec(),
    )
    .await
    .unwrap();

    let values: Vec<RespValue> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(
        values,
        vec![
            RespValue::Status("OK".into()),
            RespValue::Integer(1),
            RespValue::Bulk(Bytes::from_static(b"ann")),
        ]
    );
}

#[tokio::test]
async fn test_pipeline_follows_moved_slot() {
    let cluster = start_cluster().await;
    let slot = get_slot(b"{user1}");
    cluster.layout.move_slot(slot, cluster.b.port());

    let results = within(
        cluster
            .client
            .pipeline()
            .cmd(cmd("SET").arg("{user1}:a").arg(1))
            .cmd(cmd("SET").arg("{user1}:b").arg(2))
            .exec(),
    )
    .await
    .unwrap();

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(cluster.b.value("{user1}:a"), Some(Bytes::from_static(b"1")));
    assert_eq!(cluster.a.value("{user1}:a"), None);
}

#[tokio::test]
async fn test_cross_slot_commands_are_rejected() {
    let cluster = start_cluster().await;

    let err = cluster
        .client
        .send(cmd("MGET").arg("a").arg("b"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::CrossSlot), "got {err:?}");

    let err = cluster
        .client
        .pipeline()
        .cmd(cmd("GET").arg("a"))
        .cmd(cmd("GET").arg("b"))
        .exec()
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::CrossSlot), "got {err:?}");

    // Nothing reached the servers.
    assert_eq!(cluster.a.count("MGET", None), 0);
    assert_eq!(cluster.a.count("GET", None), 0);
}

#[tokio::test]
async fn test_refresh_slots_picks_up_new_layout() {
    let cluster = start_cluster().await;
    cluster
        .layout
        .assign(vec![(0, 8191, cluster.a.port()), (8192, 16383, cluster.b.port())]);

    within(cluster.client.refresh_slots()).await.unwrap();

    let table = cluster.client.slot_table();
    assert_eq!(table.master_for_slot(0), Some(&endpoint_of(&cluster.a)));
    assert_eq!(table.master_for_slot(16383), Some(&endpoint_of(&cluster.b)));
    assert_eq!(table.nodes(NodeRole::Master).len(), 2);
}

#[tokio::test]
async fn test_connect_fails_without_cluster_support() {
    init_tracing();
    let standalone = MockServer::start().await;
    let node = ConnectionOptions::new(endpoint_of(&standalone)).with_reconnect(fast_reconnect());
    let options = ClusterOptions::new(vec![endpoint_of(&standalone)]).with_node_options(node);

    let err = within(ClusterClient::connect(options)).await.unwrap_err();
    assert!(matches!(err, ClientError::ClusterInit(_)), "got {err:?}");
}

// ===== Failover and retries =====

#[tokio::test]
async fn test_dead_master_is_replaced_after_refresh() {
    let cluster = start_cluster().await;
    let slot = get_slot(b"foo");
    cluster.a.insert("foo", "old");
    within(cluster.client.send(cmd("GET").arg("foo"))).await.unwrap();

    // A dies and B takes over its slots.
    cluster.a.shutdown();
    cluster.layout.assign(vec![(0, 16383, cluster.b.port())]);
    cluster.b.insert("foo", "bar");

    let value = within(cluster.client.send(cmd("GET").arg("foo"))).await.unwrap();
    assert_eq!(value, RespValue::Bulk(Bytes::from_static(b"bar")));
    assert_eq!(
        cluster.client.slot_table().master_for_slot(slot),
        Some(&endpoint_of(&cluster.b))
    );
}

#[tokio::test]
async fn test_try_again_is_retried() {
    let cluster = start_cluster().await;
    cluster.a.insert("foo", "bar");
    cluster
        .a
        .fail_next("GET", "TRYAGAIN Multiple keys request during rehashing of slot", 2);

    let value = within(cluster.client.send(cmd("GET").arg("foo"))).await.unwrap();
    assert_eq!(value, RespValue::Bulk(Bytes::from_static(b"bar")));
    assert_eq!(cluster.a.count("GET", Some("foo")), 3);
}

#[tokio::test]
async fn test_cluster_down_is_retried_and_refreshes() {
    let cluster = start_cluster().await;
    let before = cluster.a.count("CLUSTER", Some("SLOTS"));
    cluster
        .a
        .fail_next("SET", "CLUSTERDOWN The cluster is down", 1);

    within(cluster.client.send(cmd("SET").arg("foo").arg("1")))
        .await
        .unwrap();
    assert_eq!(cluster.a.value("foo"), Some(Bytes::from_static(b"1")));
    eventually(|| {
        cluster.a.count("CLUSTER", Some("SLOTS")) + cluster.b.count("CLUSTER", Some("SLOTS"))
            > before
    })
    .await;
}

#[tokio::test]
async fn test_routing_gives_up_after_max_redirections() {
    let cluster = start_cluster_with(|options| options.max_redirections = 2).await;
    cluster
        .a
        .fail_next("GET", "TRYAGAIN Multiple keys request during rehashing of slot", 10);

    let err = within(cluster.client.send(cmd("GET").arg("foo")))
        .await
        .unwrap_err();
    match err {
        ClientError::RoutingExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            let server = last.server_error().expect("last error is a server reply");
            assert_eq!(server.kind, ServerErrorKind::TryAgain);
        }
        other => panic!("Expected RoutingExhausted, got {other:?}"),
    }
    assert_eq!(cluster.a.count("GET", Some("foo")), 3);
}

#[tokio::test]
async fn test_pipeline_retries_try_again() {
    let cluster = start_cluster().await;
    cluster
        .a
        .fail_next("SET", "TRYAGAIN Multiple keys request during rehashing of slot", 2);

    let results = within(
        cluster
            .client
            .pipeline()
            .cmd(cmd("SET").arg("{user1}:a").arg(1))
            .cmd(cmd("SET").arg("{user1}:b").arg(2))
            .exec(),
    )
    .await
    .unwrap();

    assert!(results.iter().all(Result::is_ok), "got {results:?}");
    assert_eq!(cluster.a.count("SET", None), 4);
    assert_eq!(cluster.a.value("{user1}:b"), Some(Bytes::from_static(b"2")));
}

#[tokio::test]
async fn test_transaction_follows_ask_redirect() {
    let cluster = start_cluster().await;
    let slot = get_slot(b"{user1}");
    cluster.layout.start_migration(slot, cluster.b.port());

    let outcome = within(
        cluster
            .client
            .transaction()
            .cmd(cmd("SET").arg("{user1}:name").arg("ann"))
            .cmd(cmd("INCR").arg("{user1}:visits"))
            .exec(),
    )
    .await
    .unwrap();

    let TransactionOutcome::Committed(results) = outcome else {
        panic!("transaction was aborted");
    };
    assert_eq!(results[1].as_ref().unwrap(), &RespValue::Integer(1));
    assert_eq!(cluster.b.value("{user1}:name"), Some(Bytes::from_static(b"ann")));
    assert_eq!(cluster.a.value("{user1}:name"), None);
    assert_eq!(cluster.b.count("ASKING", None), 1);
    assert_eq!(
        cluster.client.slot_table().master_for_slot(slot),
        Some(&endpoint_of(&cluster.a))
    );
}

// ===== Eviction =====

#[tokio::test]
async fn test_node_missing_from_two_refreshes_is_evicted() {
    let cluster = start_cluster().await;
    let mut messages = cluster.client.messages(MessageFilter::All);
    within(cluster.client.subscribe(["news"])).await.unwrap();
    assert_eq!(cluster.client.subscriber_node(), Some(endpoint_of(&cluster.a)));

    cluster.layout.assign(vec![(0, 16383, cluster.b.port())]);
    within(cluster.client.refresh_slots()).await.unwrap();
    // One miss is tolerated.
    assert_eq!(cluster.client.subscriber_node(), Some(endpoint_of(&cluster.a)));

    within(cluster.client.refresh_slots()).await.unwrap();
    assert_eq!(cluster.client.subscriber_node(), Some(endpoint_of(&cluster.b)));

    // The subscriptions are replayed on B.
    eventually(|| cluster.b.count("SUBSCRIBE", Some("news")) == 1).await;
    let receivers: i64 = within(cluster.client.query(cmd("PUBLISH").arg("news").arg("hi")))
        .await
        .unwrap();
    assert_eq!(receivers, 1);
    let message = within(messages.next()).await.unwrap();
    assert_eq!(message.payload(), Some(&Bytes::from_static(b"hi")));
}
