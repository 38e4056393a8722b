//! End-to-end tests of the async client over a loopback backend.

use docsync_engine::{
    loopback, DocSync, EmptyCredentials, ListenOptions, Source, SyncConfig, SyncError,
};
use docsync_model::{FieldPath, MutationResult, Query, SnapshotVersion, User, Value};
use docsync_protocol::{ListenRequest, WriteRequest, WriteResponse};
use docsync_testkit::{fields, found_doc, init_tracing, initial_results, key, version};
use serde_json::json;
use tempfile::TempDir;

async fn start(config: SyncConfig) -> (DocSync, docsync_engine::LoopbackServer) {
    init_tracing();
    let (connection, server) = loopback();
    let client = DocSync::start(
        config,
        User::unauthenticated(),
        Box::new(connection),
        Box::new(EmptyCredentials),
    )
    .await
    .unwrap();
    (client, server)
}

#[tokio::test]
async fn write_is_acknowledged_by_backend() {
    let (client, mut server) = start(SyncConfig::default()).await;

    let pending = client
        .set(key("items/a"), fields(&[("qty", 3)]))
        .await
        .unwrap();
    let doc = client
        .get_document(key("items/a"), Source::Cache)
        .await
        .unwrap()
        .unwrap();
    assert!(doc.has_local_mutations());

    assert_eq!(server.next_write_request().await, Some(WriteRequest::Handshake));
    assert!(server.send_write_response(WriteResponse {
        stream_token: b"handshake".to_vec(),
        commit_version: SnapshotVersion::MIN,
        results: Vec::new(),
    }));
    match server.next_write_request().await {
        Some(WriteRequest::Write { mutations, .. }) => assert_eq!(mutations.len(), 1),
        other => panic!("unexpected request {other:?}"),
    }
    assert!(server.send_write_response(WriteResponse {
        stream_token: b"ack".to_vec(),
        commit_version: version(10),
        results: vec![MutationResult::new(version(10))],
    }));

    pending.acknowledged().await.unwrap();
    let doc = client
        .get_document(key("items/a"), Source::Cache)
        .await
        .unwrap()
        .unwrap();
    assert!(!doc.has_local_mutations());
    assert_eq!(doc.field(&FieldPath::from("qty")), Some(&Value::Integer(3)));
    client.shutdown().await;
}

#[tokio::test]
async fn listener_receives_backend_results() {
    let (client, mut server) = start(SyncConfig::default()).await;
    let mut listener = client
        .listen(Query::collection("items"), ListenOptions::default())
        .await
        .unwrap();

    let target_id = match server.next_listen_request().await {
        Some(ListenRequest::AddTarget { target_id, .. }) => target_id,
        other => panic!("unexpected request {other:?}"),
    };
    for change in initial_results(
        target_id,
        vec![found_doc("items/a", 100, json!({ "qty": 1 }))],
        version(100),
        "t1",
    ) {
        assert!(server.send_watch_change(change));
    }

    let snapshot = listener.next().await.unwrap().unwrap();
    assert_eq!(snapshot.document_ids(), vec!["a"]);
    assert!(!snapshot.from_cache);
    assert_eq!(snapshot.snapshot_version, version(100));

    client.unlisten(listener.id()).await.unwrap();
    client.unlisten(listener.id()).await.unwrap();
    client.shutdown().await;
}

#[tokio::test]
async fn server_read_fails_while_offline() {
    let (client, _server) = start(SyncConfig::default()).await;
    client.disable_network().await.unwrap();

    let err = client
        .get(Query::collection("items"), Source::Server)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Unavailable(_)));

    // The cache still answers.
    let snapshot = client
        .get(Query::collection("items"), Source::Default)
        .await
        .unwrap();
    assert!(snapshot.from_cache);
    client.shutdown().await;
}

#[tokio::test]
async fn pending_writes_survive_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache.log");

    let (client, _server) = start(SyncConfig::default().with_file_persistence(&path)).await;
    assert!(!client.is_persistence_degraded());
    client.disable_network().await.unwrap();
    client
        .set(key("items/a"), fields(&[("qty", 7)]))
        .await
        .unwrap();
    client.shutdown().await;

    let (client, _server) = start(SyncConfig::default().with_file_persistence(&path)).await;
    assert!(!client.is_persistence_degraded());
    let doc = client
        .get_document(key("items/a"), Source::Cache)
        .await
        .unwrap()
        .unwrap();
    assert!(doc.has_local_mutations());
    assert_eq!(doc.field(&FieldPath::from("qty")), Some(&Value::Integer(7)));
    client.shutdown().await;
}

#[tokio::test]
async fn unusable_cache_file_falls_back_to_memory() {
    let dir = TempDir::new().unwrap();
    // A directory cannot be opened as the log file.
    let (client, _server) = start(SyncConfig::default().with_file_persistence(dir.path())).await;
    assert!(client.is_persistence_degraded());

    client.disable_network().await.unwrap();
    client
        .set(key("items/a"), fields(&[("qty", 1)]))
        .await
        .unwrap();
    assert!(client
        .get_document(key("items/a"), Source::Cache)
        .await
        .unwrap()
        .is_some());
    client.shutdown().await;
}
