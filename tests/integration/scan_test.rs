// tests/integration/scan_test.rs

//! Integration tests for cursor streams (SCAN, HSCAN), standalone and across
//! a cluster.

use super::mock_server::{ClusterLayout, MockServer};
use super::test_helpers::{connect, endpoint_of, fast_reconnect, within};
use bytes::Bytes;
use futures::TryStreamExt;
use spinel_client::connection::ConnectionOptions;
use spinel_client::core::scan::ScanOptions;
use spinel_client::{Client, ClusterClient, ClusterOptions};
use std::collections::{BTreeSet, HashMap};

fn names(prefix: &str, n: usize) -> BTreeSet<Bytes> {
    (0..n).map(|i| Bytes::from(format!("{prefix}{i}"))).collect()
}

#[tokio::test]
async fn test_scan_visits_every_key() {
    let server = MockServer::start().await;
    for i in 0..25 {
        server.insert(&format!("key:{i}"), "v");
    }
    let client = Client::from(connect(&server).await);

    let pages: Vec<Vec<Bytes>> = within(
        client
            .scan_stream(ScanOptions::default().count(10))
            .try_collect(),
    )
    .await
    .unwrap();

    assert_eq!(pages.len(), 3);
    let keys: BTreeSet<Bytes> = pages.into_iter().flatten().collect();
    assert_eq!(keys, names("key:", 25));
    assert_eq!(server.count("SCAN", None), 3);
}

#[tokio::test]
async fn test_scan_with_match_pattern() {
    let server = MockServer::start().await;
    for i in 0..5 {
        server.insert(&format!("user:{i}"), "v");
        server.insert(&format!("session:{i}"), "v");
    }
    let client = Client::from(connect(&server).await);

    let pages: Vec<Vec<Bytes>> = within(
        client
            .scan_stream(ScanOptions::default().pattern("user:*"))
            .try_collect(),
    )
    .await
    .unwrap();

    let keys: BTreeSet<Bytes> = pages.into_iter().flatten().collect();
    assert_eq!(keys, names("user:", 5));
}

#[tokio::test]
async fn test_scan_of_empty_keyspace_ends_immediately() {
    let server = MockServer::start().await;
    let client = Client::from(connect(&server).await);

    let pages: Vec<Vec<Bytes>> = within(client.scan_stream(ScanOptions::default()).try_collect())
        .await
        .unwrap();
    assert!(pages.is_empty());
}

#[tokio::test]
async fn test_hscan_returns_field_value_pairs() {
    let server = MockServer::start().await;
    let client = Client::from(connect(&server).await);
    for i in 0..12 {
        client
            .hset("profile", format!("field{i}"), format!("value{i}"))
            .await
            .unwrap();
    }

    let pages: Vec<Vec<Bytes>> = within(
        client
            .hscan_stream("profile", ScanOptions::default().count(5))
            .try_collect(),
    )
    .await
    .unwrap();

    let flat: Vec<Bytes> = pages.into_iter().flatten().collect();
    assert_eq!(flat.len(), 24);
    let pairs: HashMap<Bytes, Bytes> = flat
        .chunks(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    assert_eq!(pairs.len(), 12);
    assert_eq!(
        pairs.get(&Bytes::from_static(b"field7")),
        Some(&Bytes::from_static(b"value7"))
    );
}

#[tokio::test]
async fn test_cluster_scan_covers_every_master() {
    let layout = ClusterLayout::new();
    let a = MockServer::start_clustered(layout.clone()).await;
    let b = MockServer::start_clustered(layout.clone()).await;
    layout.assign(vec![(0, 8191, a.port()), (8192, 16383, b.port())]);
    for i in 0..4 {
        a.insert(&format!("a:{i}"), "v");
        b.insert(&format!("b:{i}"), "v");
    }

    let node = ConnectionOptions::new(endpoint_of(&a)).with_reconnect(fast_reconnect());
    let options = ClusterOptions::new(vec![endpoint_of(&a)]).with_node_options(node);
    let client = Client::from(within(ClusterClient::connect(options)).await.unwrap());

    let pages: Vec<Vec<Bytes>> = within(client.scan_stream(ScanOptions::default()).try_collect())
        .await
        .unwrap();

    let keys: BTreeSet<Bytes> = pages.into_iter().flatten().collect();
    let expected: BTreeSet<Bytes> = names("a:", 4).into_iter().chain(names("b:", 4)).collect();
    assert_eq!(keys, expected);
    assert_eq!(a.count("SCAN", None), 1);
    assert_eq!(b.count("SCAN", None), 1);
}
