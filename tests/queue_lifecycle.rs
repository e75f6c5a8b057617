#[path = "common.rs"]
mod common;

use std::time::Duration;

use zaku::client::Client;
use zaku::core::error::ErrorKind;
use zaku::core::value::Value;

#[tokio::test]
async fn take_on_empty_queue_is_null_not_error() {
    common::init_logging();
    let addr = common::spawn_server().await;
    let client = Client::connect(addr).await.unwrap();

    client.init_queue("q1").await.unwrap();
    assert!(client.take("q1").await.unwrap().is_none());
}

#[tokio::test]
async fn fifo_order_under_a_single_claimant() {
    common::init_logging();
    let addr = common::spawn_server().await;
    let client = Client::connect(addr).await.unwrap();

    let x = client
        .add("q1", Value::map([("a", Value::Int(1))]))
        .await
        .unwrap();
    let y = client
        .add("q1", Value::map([("a", Value::Int(2))]))
        .await
        .unwrap();

    let (id1, payload1) = client.take("q1").await.unwrap().unwrap();
    assert_eq!(id1, x);
    assert_eq!(
        payload1.unwrap().get("a").and_then(Value::as_int),
        Some(1)
    );

    let (id2, payload2) = client.take("q1").await.unwrap().unwrap();
    assert_eq!(id2, y);
    assert_eq!(
        payload2.unwrap().get("a").and_then(Value::as_int),
        Some(2)
    );

    assert!(client.take("q1").await.unwrap().is_none());
}

#[tokio::test]
async fn reset_requeues_at_the_tail() {
    common::init_logging();
    let addr = common::spawn_server().await;
    let client = Client::connect(addr).await.unwrap();

    client
        .add_with("q1", None, Some("A"), None)
        .await
        .unwrap();
    client
        .add_with("q1", None, Some("B"), None)
        .await
        .unwrap();

    let (claimed, _) = client.take("q1").await.unwrap().unwrap();
    assert_eq!(claimed, "A");
    client.mark_reset("q1", "A").await.unwrap();

    let (first, _) = client.take("q1").await.unwrap().unwrap();
    assert_eq!(first, "B");
    let (second, _) = client.take("q1").await.unwrap().unwrap();
    assert_eq!(second, "A");
}

#[tokio::test]
async fn explicit_id_collision_fails_with_conflict() {
    common::init_logging();
    let addr = common::spawn_server().await;
    let client = Client::connect(addr).await.unwrap();

    client
        .add_with("q1", Some(Value::Int(1)), Some("5"), None)
        .await
        .unwrap();
    let err = client
        .add_with("q1", Some(Value::Int(2)), Some("5"), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);
}

#[tokio::test]
async fn failed_op_leaves_the_connection_usable() {
    common::init_logging();
    let addr = common::spawn_server().await;
    let client = Client::connect(addr).await.unwrap();

    client
        .add_with("q1", None, Some("dup"), None)
        .await
        .unwrap();
    assert!(client.add_with("q1", None, Some("dup"), None).await.is_err());

    // the ERR was per-op; the same connection keeps working
    client.ping().await.unwrap();
    let (id, _) = client.take("q1").await.unwrap().unwrap();
    assert_eq!(id, "dup");
}

#[tokio::test]
async fn scoped_claim_marks_done_on_normal_exit() {
    common::init_logging();
    let addr = common::spawn_server().await;
    let client = Client::connect(addr).await.unwrap();

    client.add("q1", Value::map([("n", Value::Int(1))])).await.unwrap();

    let task = client.pop("q1").await.unwrap().unwrap();
    assert_eq!(
        task.payload().unwrap().get("n").and_then(Value::as_int),
        Some(1)
    );
    task.done().await.unwrap();

    // done removes the task entirely
    assert!(client.take("q1").await.unwrap().is_none());
}

#[tokio::test]
async fn scoped_claim_resets_when_dropped() {
    common::init_logging();
    let addr = common::spawn_server().await;
    let client = Client::connect(addr).await.unwrap();

    let id = client.add("q1", Value::Int(9)).await.unwrap();

    {
        let task = client.pop("q1").await.unwrap().unwrap();
        assert_eq!(task.task_id(), id);
        // dropped without done(): abnormal exit path
    }

    // drop-path reset runs on a spawned task
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (reclaimed, _) = client.take("q1").await.unwrap().unwrap();
    assert_eq!(reclaimed, id);
}

#[tokio::test]
async fn disconnect_releases_claims_best_effort() {
    common::init_logging();
    let addr = common::spawn_server().await;

    let id = {
        let worker = Client::connect(addr).await.unwrap();
        let (id, _) = {
            worker.add("q1", Value::Int(1)).await.unwrap();
            worker.take("q1").await.unwrap().unwrap()
        };
        id
        // worker dropped: connection closes with the claim outstanding
    };

    tokio::time::sleep(Duration::from_millis(200)).await;

    let observer = Client::connect(addr).await.unwrap();
    let (reclaimed, _) = observer.take("q1").await.unwrap().unwrap();
    assert_eq!(reclaimed, id);
}

#[tokio::test]
async fn clear_and_remove_queue() {
    common::init_logging();
    let addr = common::spawn_server().await;
    let client = Client::connect(addr).await.unwrap();

    client.add("q1", Value::Int(1)).await.unwrap();
    client.add("q1", Value::Int(2)).await.unwrap();

    client.clear_queue("q1").await.unwrap();
    assert!(client.take("q1").await.unwrap().is_none());

    client.remove_queue("q1").await.unwrap();
    // removal is from the server's point of view; the name is reusable
    client.init_queue("q1").await.unwrap();
}

#[tokio::test]
async fn invalid_queue_name_is_rejected() {
    common::init_logging();
    let addr = common::spawn_server().await;
    let client = Client::connect(addr).await.unwrap();

    let err = client.init_queue("bad name").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);
}
