//! Integration tests for the sync engine against a loopback backend.

mod common;

use common::{drain, latest, Harness};
use docsync_engine::{
    AuthToken, CredentialsProvider, ListenOptions, OnlineState, StreamKind, SyncConfig, SyncError,
    SyncEvent, TimerId,
};
use docsync_model::{
    DatabaseId, Direction, Document, DocumentKey, DocumentKeySet, FieldPath, Mutation,
    ObjectValue, Operator, Query, Target, TargetId, User, Value,
};
use docsync_protocol::{Code, ListenRequest, ResumeFrom, Status};
use docsync_testkit::{
    added, current, document_change, document_remove, existence_filter_with_bloom, fields,
    found_doc, initial_results, key, object_value_strategy, removed, snapshot, version,
};
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;

fn field(doc: &Document, name: &str) -> Option<Value> {
    doc.field(&FieldPath::from(name)).cloned()
}

fn cached(h: &Harness, path: &str) -> Option<Document> {
    h.engine.get_document_from_cache(&key(path)).unwrap()
}

struct RejectingCredentials;

impl CredentialsProvider for RejectingCredentials {
    fn get_token(&mut self) -> Result<Option<AuthToken>, Status> {
        Err(Status::new(Code::Unauthenticated, "token expired"))
    }

    fn invalidate_token(&mut self) {}
}

fn resolve_limbo(h: &mut Harness, targets: &[TargetId], read_time: i64) {
    h.send(added(targets));
    h.send(current(targets, "limbo"));
    h.send(snapshot(version(read_time), &format!("s{read_time}")));
}

#[test]
fn writes_are_visible_to_listeners_and_reads_while_offline() {
    let mut h = Harness::offline();
    let (_, mut rx) = h.listen(Query::document(&key("items/a")), ListenOptions::default());
    let initial = latest(&mut rx);
    assert!(initial.is_empty());
    assert!(initial.from_cache);

    h.write(vec![Mutation::set(key("items/a"), fields(&[("qty", 3)]))]);

    let snapshot = latest(&mut rx);
    let doc = snapshot.get(&key("items/a")).unwrap();
    assert_eq!(field(doc, "qty"), Some(Value::Integer(3)));
    assert!(snapshot.has_pending_writes);

    let doc = cached(&h, "items/a").unwrap();
    assert_eq!(field(&doc, "qty"), Some(Value::Integer(3)));
    let result = h.engine.get_from_cache(&Query::collection("items")).unwrap();
    assert_eq!(result.document_ids(), vec!["a"]);
    assert!(h.server.drain_write_requests().is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn reads_reflect_the_latest_write_per_key(
        writes in prop::collection::vec((0usize..4, prop::option::of(object_value_strategy())), 1..12)
    ) {
        let mut h = Harness::offline();
        let mut expected: BTreeMap<DocumentKey, Option<ObjectValue>> = BTreeMap::new();
        for (id, data) in writes {
            let key = key(&format!("items/doc{id}"));
            let mutation = match &data {
                Some(data) => Mutation::set(key.clone(), data.clone()),
                None => Mutation::delete(key.clone()),
            };
            h.write(vec![mutation]);
            expected.insert(key, data);
        }
        for (key, data) in expected {
            let doc = h.engine.get_document_from_cache(&key).unwrap();
            prop_assert_eq!(doc.map(|doc| doc.data().clone()), data);
        }
    }
}

#[test]
fn unlisten_twice_is_a_no_op() {
    let mut h = Harness::new();
    let (id, _rx) = h.listen(Query::collection("items"), ListenOptions::default());
    let target_id = h.added_targets()[0].0;

    h.engine.unlisten(id).unwrap();
    h.pump();
    h.engine.unlisten(id).unwrap();
    h.pump();

    assert_eq!(h.engine.listener_count(), 0);
    assert!(!h.engine.remote().is_listening(target_id));
    let removals: Vec<ListenRequest> = h.server.drain_listen_requests();
    assert_eq!(removals, vec![ListenRequest::RemoveTarget { target_id }]);
}

#[test]
fn later_batch_wins_on_the_same_field() {
    let mut h = Harness::offline();
    let (first, _) = h.write(vec![Mutation::set(key("items/a"), fields(&[("x", 1)]))]);
    let (second, _) = h.write(vec![Mutation::update(key("items/a"), fields(&[("x", 2)]))]);
    assert!(first < second);
    assert_eq!(field(&cached(&h, "items/a").unwrap(), "x"), Some(Value::Integer(2)));

    h.engine.enable_network().unwrap();
    h.pump();
    let sent = h.complete_handshake();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0][0], Mutation::set(key("items/a"), fields(&[("x", 1)])));

    // The first batch is acknowledged; the second still shadows it.
    h.acknowledge(100, 1);
    let doc = cached(&h, "items/a").unwrap();
    assert_eq!(field(&doc, "x"), Some(Value::Integer(2)));
    assert!(doc.has_local_mutations());
    assert_eq!(h.engine.pending_write_count(), 1);
}

#[test]
fn acknowledged_value_is_never_reapplied() {
    let mut h = Harness::new();
    let (target_id, mut rx) = h.listen_target(Query::document(&key("items/a")));
    h.send_all(initial_results(target_id, vec![], version(100), "t1"));

    let (first, mut first_ack) = h.write(vec![Mutation::set(key("items/a"), fields(&[("x", 5)]))]);
    h.complete_handshake();
    h.acknowledge(200, 1);
    assert!(matches!(first_ack.try_recv(), Ok(Ok(()))));
    assert!(h.engine.local().lookup_mutation_batch(first).unwrap().is_none());

    h.send(document_change(found_doc("items/a", 200, json!({ "x": 5 })), &[target_id]));
    h.send(snapshot(version(200), "t2"));
    // Someone else overwrites the document.
    h.send(document_change(found_doc("items/a", 300, json!({ "x": 7 })), &[target_id]));
    h.send(snapshot(version(300), "t3"));
    assert_eq!(field(&cached(&h, "items/a").unwrap(), "x"), Some(Value::Integer(7)));

    let (_, mut second_ack) = h.write(vec![Mutation::set(key("items/a"), fields(&[("x", 9)]))]);
    assert_eq!(field(&cached(&h, "items/a").unwrap(), "x"), Some(Value::Integer(9)));
    h.fail_write_stream(Status::new(Code::FailedPrecondition, "rejected"));

    assert!(matches!(second_ack.try_recv(), Ok(Err(SyncError::Server(_)))));
    assert_eq!(field(&cached(&h, "items/a").unwrap(), "x"), Some(Value::Integer(7)));
    let last = latest(&mut rx);
    assert_eq!(field(last.get(&key("items/a")).unwrap(), "x"), Some(Value::Integer(7)));
    assert!(!last.has_pending_writes);
}

#[test]
fn snapshot_versions_never_go_backwards() {
    let mut h = Harness::new();
    let (target_id, mut rx) = h.listen_target(Query::collection("items"));
    h.send_all(initial_results(
        target_id,
        vec![found_doc("items/a", 100, json!({ "n": 1 }))],
        version(100),
        "t1",
    ));
    h.send(document_change(found_doc("items/b", 200, json!({ "n": 2 })), &[target_id]));
    h.send(snapshot(version(200), "t2"));
    // A stale boundary is ignored.
    h.send(snapshot(version(150), "stale"));
    h.write(vec![Mutation::set(key("items/local"), fields(&[("n", 3)]))]);
    h.send(document_change(found_doc("items/c", 300, json!({ "n": 3 })), &[target_id]));
    h.send(snapshot(version(300), "t3"));

    let versions: Vec<_> = drain(&mut rx)
        .into_iter()
        .map(|snapshot| snapshot.snapshot_version)
        .collect();
    assert!(versions.len() >= 3);
    assert!(versions.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(versions.last(), Some(&version(300)));
}

#[test]
fn write_round_trip_clears_pending_writes() {
    let mut h = Harness::new();
    let (_, mut ack) = h.write(vec![Mutation::set(key("items/a"), fields(&[("x", 5)]))]);

    let doc = cached(&h, "items/a").unwrap();
    assert_eq!(field(&doc, "x"), Some(Value::Integer(5)));
    assert!(h
        .engine
        .get_from_cache(&Query::collection("items"))
        .unwrap()
        .has_pending_writes);

    assert_eq!(h.complete_handshake().len(), 1);
    h.acknowledge(10, 1);
    assert!(matches!(ack.try_recv(), Ok(Ok(()))));

    let result = h.engine.get_from_cache(&Query::collection("items")).unwrap();
    assert_eq!(
        field(result.get(&key("items/a")).unwrap(), "x"),
        Some(Value::Integer(5))
    );
    assert!(!result.has_pending_writes);
    assert_eq!(h.engine.pending_write_count(), 0);
}

#[test]
fn bloom_filter_evicts_only_absent_documents() {
    let mut h = Harness::new();
    let (target_id, _rx) = h.listen_target(Query::collection("items"));
    h.send_all(initial_results(
        target_id,
        vec![
            found_doc("items/a", 100, json!({ "n": 1 })),
            found_doc("items/b", 100, json!({ "n": 2 })),
            found_doc("items/c", 100, json!({ "n": 3 })),
        ],
        version(100),
        "t1",
    ));
    assert_eq!(h.engine.local().remote_keys_for_target(target_id).unwrap().len(), 3);

    h.send(existence_filter_with_bloom(
        &DatabaseId::default(),
        target_id,
        &[key("items/a"), key("items/c")],
    ));
    h.send(snapshot(version(200), "t2"));

    let tracked = h.engine.local().remote_keys_for_target(target_id).unwrap();
    let expected: DocumentKeySet = [key("items/a"), key("items/c")].into_iter().collect();
    assert_eq!(tracked, expected);

    // No reset: the target was neither removed nor re-added.
    let requests = h.server.drain_listen_requests();
    assert!(requests.iter().all(|request| match request {
        ListenRequest::AddTarget { target_id: id, .. } | ListenRequest::RemoveTarget { target_id: id } =>
            *id != target_id,
    }));
    // The evicted document is checked on its own.
    assert!(requests.iter().any(|request| matches!(
        request,
        ListenRequest::AddTarget { target, .. } if *target == Target::for_document(&key("items/b"))
    )));
    assert!(h.engine.active_limbo_targets().contains_key(&key("items/b")));
}

#[test]
fn limbo_resolutions_are_capped_and_drain() {
    let mut h = Harness::new();
    // Going into limbo changes metadata only.
    let (target_id, mut rx) = h.listen_target_with(
        Query::collection("items"),
        ListenOptions::default().with_metadata_changes(true),
    );
    let docs: Vec<Document> = (0..150)
        .map(|i| found_doc(&format!("items/doc{i:03}"), 100, json!({ "n": i })))
        .collect();
    let keys: Vec<DocumentKey> = docs.iter().map(|doc| doc.key().clone()).collect();
    h.send_all(initial_results(target_id, docs, version(100), "t1"));
    assert_eq!(latest(&mut rx).len(), 150);

    for key in &keys {
        h.send(document_remove(key.clone(), &[target_id]));
    }
    h.send(snapshot(version(200), "t2"));

    assert_eq!(h.engine.active_limbo_resolutions(), 100);
    assert_eq!(h.engine.enqueued_limbo_resolutions(), 50);
    let limbo_requests = h
        .added_targets()
        .into_iter()
        .filter(|(_, target)| target.is_document_target())
        .count();
    assert_eq!(limbo_requests, 100);
    assert!(latest(&mut rx).from_cache);

    let first: Vec<TargetId> = h
        .engine
        .active_limbo_targets()
        .values()
        .copied()
        .take(50)
        .collect();
    resolve_limbo(&mut h, &first, 300);
    assert_eq!(h.engine.active_limbo_resolutions(), 100);
    assert_eq!(h.engine.enqueued_limbo_resolutions(), 0);

    let rest: Vec<TargetId> = h.engine.active_limbo_targets().values().copied().collect();
    resolve_limbo(&mut h, &rest, 400);
    assert_eq!(h.engine.active_limbo_resolutions(), 0);
    assert_eq!(h.engine.enqueued_limbo_resolutions(), 0);

    let last = latest(&mut rx);
    assert!(last.is_empty());
    assert!(!last.from_cache);
}

#[test]
fn limited_query_follows_local_writes() {
    let mut h = Harness::new();
    let (all, _all_rx) = h.listen_target(Query::collection("items"));
    h.send_all(initial_results(
        all,
        vec![
            found_doc("items/a", 100, json!({ "qty": 1 })),
            found_doc("items/b", 100, json!({ "qty": 3 })),
            found_doc("items/c", 100, json!({ "qty": 2 })),
        ],
        version(100),
        "t1",
    ));

    let query = Query::collection("items")
        .where_field("qty", Operator::GreaterThan, 0)
        .order_by("qty", Direction::Descending)
        .limit_to_first(2);
    let (limited, mut rx) = h.listen_target(query.clone());
    assert_eq!(latest(&mut rx).document_ids(), vec!["b", "c"]);
    h.send_all(initial_results(
        limited,
        vec![
            found_doc("items/b", 100, json!({ "qty": 3 })),
            found_doc("items/c", 100, json!({ "qty": 2 })),
        ],
        version(200),
        "t2",
    ));
    drain(&mut rx);

    h.write(vec![Mutation::delete(key("items/a"))]);
    assert!(drain(&mut rx).is_empty());
    assert_eq!(
        h.engine.get_from_cache(&query).unwrap().document_ids(),
        vec!["b", "c"]
    );

    h.write(vec![Mutation::update(key("items/b"), fields(&[("qty", 0)]))]);
    assert_eq!(latest(&mut rx).document_ids(), vec!["c"]);
    assert_eq!(h.engine.get_from_cache(&query).unwrap().document_ids(), vec!["c"]);
}

#[test]
fn rejected_write_fails_only_its_batch() {
    let mut h = Harness::new();
    let (_, mut first) = h.write(vec![Mutation::set(key("items/a"), fields(&[("x", 1)]))]);
    let (_, mut second) = h.write(vec![Mutation::set(key("items/b"), fields(&[("x", 2)]))]);
    assert_eq!(h.complete_handshake().len(), 2);

    h.fail_write_stream(Status::new(Code::FailedPrecondition, "precondition failed"));
    match first.try_recv() {
        Ok(Err(SyncError::Server(status))) => assert_eq!(status.code, Code::FailedPrecondition),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(second.try_recv().is_err());
    assert!(cached(&h, "items/a").is_none());
    assert!(cached(&h, "items/b").is_some());

    // The surviving batch is resent on the next stream.
    h.fire(TimerId::WriteStreamBackoff);
    let resent = h.complete_handshake();
    assert_eq!(resent, vec![vec![Mutation::set(key("items/b"), fields(&[("x", 2)]))]]);
}

#[test]
fn transient_write_failure_keeps_batch_queued() {
    let mut h = Harness::new();
    let mut events = h.engine.subscribe_events();
    let (batch_id, mut ack) = h.write(vec![Mutation::set(key("items/a"), fields(&[("x", 1)]))]);
    h.complete_handshake();

    h.fail_write_stream(Status::new(Code::Unavailable, "try again"));
    assert!(ack.try_recv().is_err());
    let mut retried = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::WriteRetrying { batch_id: id, attempts, .. } = event {
            assert_eq!((id, attempts), (batch_id, 1));
            retried = true;
        }
    }
    assert!(retried);

    h.fire(TimerId::WriteStreamBackoff);
    assert_eq!(h.complete_handshake().len(), 1);
    h.acknowledge(50, 1);
    assert!(matches!(ack.try_recv(), Ok(Ok(()))));
}

#[test]
fn malformed_acknowledgement_replays_batches_in_order() {
    let mut h = Harness::new();
    let (_, mut first) = h.write(vec![Mutation::set(key("items/a"), fields(&[("x", 1)]))]);
    let (_, mut second) = h.write(vec![Mutation::set(key("items/b"), fields(&[("x", 2)]))]);
    assert_eq!(h.complete_handshake().len(), 2);

    // One mutation, no results.
    h.acknowledge(100, 0);
    assert!(first.try_recv().is_err());
    assert!(second.try_recv().is_err());
    assert!(h.scheduler.is_scheduled(TimerId::WriteStreamBackoff));

    h.fire(TimerId::WriteStreamBackoff);
    let resent = h.complete_handshake();
    assert_eq!(resent.len(), 2);
    assert_eq!(resent[0][0].key, key("items/a"));
    assert_eq!(resent[1][0].key, key("items/b"));

    h.acknowledge(200, 1);
    assert!(matches!(first.try_recv(), Ok(Ok(()))));
    assert!(second.try_recv().is_err());
    h.acknowledge(300, 1);
    assert!(matches!(second.try_recv(), Ok(Ok(()))));
    assert_eq!(h.engine.pending_write_count(), 0);
    assert!(h.sent_writes().is_empty());
}

#[test]
fn write_auth_failure_is_reported_to_the_writer() {
    let mut h = Harness::with_credentials(SyncConfig::default(), Box::new(RejectingCredentials));
    let mut events = h.engine.subscribe_events();
    let (_, mut ack) = h.write(vec![Mutation::set(key("items/a"), fields(&[("x", 1)]))]);
    assert!(ack.try_recv().is_err());

    h.fire(TimerId::WriteStreamBackoff);
    assert!(matches!(
        ack.try_recv(),
        Ok(Err(SyncError::AuthenticationFailed(_)))
    ));
    assert!(!h.scheduler.is_scheduled(TimerId::WriteStreamBackoff));
    let mut reported = false;
    while let Ok(event) = events.try_recv() {
        reported |= matches!(
            event,
            SyncEvent::AuthenticationFailed {
                stream: StreamKind::Write,
                ..
            }
        );
    }
    assert!(reported);
    // The batch stays queued for the next sign-in.
    assert!(cached(&h, "items/a").is_some_and(|doc| doc.has_local_mutations()));
}

#[test]
fn rejected_listen_reports_error_to_its_listener() {
    let mut h = Harness::new();
    let (target_id, mut rx) = h.listen_target(Query::collection("secret"));
    h.send(removed(
        &[target_id],
        Some(Status::new(Code::PermissionDenied, "denied")),
    ));

    match rx.try_recv() {
        Ok(Err(SyncError::Server(status))) => assert_eq!(status.code, Code::PermissionDenied),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(h.engine.listener_count(), 0);
    assert!(!h.engine.remote().is_listening(target_id));
}

#[test]
fn silent_backend_releases_cached_results_after_timeout() {
    let mut h = Harness::new();
    let (_, mut rx) = h.listen_target(Query::collection("items"));
    assert!(drain(&mut rx).is_empty());
    assert!(h.scheduler.is_scheduled(TimerId::OnlineStateTimeout));

    h.fire(TimerId::OnlineStateTimeout);
    assert_eq!(h.engine.online_state(), OnlineState::Offline);
    let snapshot = latest(&mut rx);
    assert!(snapshot.is_empty());
    assert!(snapshot.from_cache);
}

#[test]
fn reconnect_resumes_targets_from_token() {
    let mut h = Harness::new();
    let (target_id, _rx) = h.listen_target(Query::collection("items"));
    h.send_all(initial_results(
        target_id,
        vec![found_doc("items/a", 100, json!({ "n": 1 }))],
        version(100),
        "t1",
    ));
    assert_eq!(h.engine.online_state(), OnlineState::Online);

    h.fail_listen_stream(Status::new(Code::Unavailable, "connection reset"));
    assert_eq!(h.engine.online_state(), OnlineState::Unknown);
    h.fire(TimerId::ListenStreamBackoff);

    let requests = h.server.drain_listen_requests();
    assert_eq!(
        requests,
        vec![ListenRequest::AddTarget {
            target_id,
            target: Query::collection("items").to_target(),
            resume: ResumeFrom::Token(b"t1".to_vec()),
            expected_count: Some(1),
        }]
    );
}

#[test]
fn repeated_auth_rejection_stops_the_stream() {
    let mut h = Harness::new();
    let mut events = h.engine.subscribe_events();
    h.server
        .require_token(Some(docsync_engine::AuthToken::new("secret")));
    let (_, mut rx) = h.listen(Query::collection("items"), ListenOptions::default());

    h.fire(TimerId::ListenStreamBackoff);
    assert!(!h.scheduler.is_scheduled(TimerId::ListenStreamBackoff));
    assert_eq!(h.server.listen_stream_opens(), 2);

    let mut results = Vec::new();
    while let Ok(result) = rx.try_recv() {
        results.push(result);
    }
    assert!(matches!(
        results.last(),
        Some(Err(SyncError::AuthenticationFailed(_)))
    ));
    let mut reported = false;
    while let Ok(event) = events.try_recv() {
        reported |= matches!(event, SyncEvent::AuthenticationFailed { .. });
    }
    assert!(reported);
}

#[test]
fn user_change_cancels_pending_writes() {
    let mut h = Harness::offline();
    let (_, mut ack) = h.write(vec![Mutation::set(key("items/a"), fields(&[("x", 1)]))]);

    h.engine.handle_user_change(User::new("alice")).unwrap();
    h.pump();

    assert!(matches!(ack.try_recv(), Ok(Err(SyncError::Cancelled(_)))));
    assert!(cached(&h, "items/a").is_none());
    assert_eq!(h.engine.pending_write_count(), 0);
}

#[test]
fn pending_write_limit_is_enforced() {
    let mut h = Harness::with_config(SyncConfig::default().with_max_pending_writes(1));
    h.engine.disable_network();
    h.write(vec![Mutation::set(key("items/a"), fields(&[("x", 1)]))]);

    let err = h
        .engine
        .write(vec![Mutation::set(key("items/b"), fields(&[("x", 2)]))])
        .unwrap_err();
    assert!(matches!(err, SyncError::TooManyPendingWrites { limit: 1 }));
    assert!(cached(&h, "items/b").is_none());
}
