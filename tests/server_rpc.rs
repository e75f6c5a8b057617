#[path = "common.rs"]
mod common;

use zaku::client::Client;
use zaku::core::value::Value;

/// The worker side of the RPC pattern: pop, read `_request_id`, publish the
/// result to that topic.
async fn serve_one_rpc(worker: Client, queue: &'static str) {
    loop {
        match worker.pop(queue).await.unwrap() {
            Some(task) => {
                let payload = task.payload().unwrap().clone();
                let request_id = payload
                    .get("_request_id")
                    .and_then(Value::as_str)
                    .unwrap()
                    .to_string();
                let x = payload.get("x").and_then(Value::as_int).unwrap();

                worker
                    .publish(
                        &request_id,
                        Value::map([
                            ("result", Value::Str("ok".into())),
                            ("x", Value::Int(x)),
                        ]),
                    )
                    .await
                    .unwrap();
                task.done().await.unwrap();
                return;
            }
            None => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
        }
    }
}

#[tokio::test]
async fn rpc_round_trip() {
    common::init_logging();
    let addr = common::spawn_server().await;

    let caller = Client::connect(addr).await.unwrap();
    let worker = Client::connect(addr).await.unwrap();
    caller.init_queue("q_rpc").await.unwrap();

    let worker_task = tokio::spawn(serve_one_rpc(worker, "q_rpc"));

    let reply = caller
        .rpc("q_rpc", Value::map([("x", Value::Int(7))]), 5.0)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(reply.get("result").and_then(Value::as_str), Some("ok"));
    assert_eq!(reply.get("x").and_then(Value::as_int), Some(7));
    worker_task.await.unwrap();
}

#[tokio::test]
async fn streaming_rpc_yields_every_published_result() {
    common::init_logging();
    let addr = common::spawn_server().await;

    let caller = Client::connect(addr).await.unwrap();
    let worker = Client::connect(addr).await.unwrap();
    caller.init_queue("q_stream").await.unwrap();

    let worker_task = tokio::spawn(async move {
        loop {
            match worker.pop("q_stream").await.unwrap() {
                Some(task) => {
                    let request_id = task
                        .payload()
                        .unwrap()
                        .get("_request_id")
                        .and_then(Value::as_str)
                        .unwrap()
                        .to_string();
                    for step in 0..3 {
                        worker
                            .publish(&request_id, Value::map([("step", Value::Int(step))]))
                            .await
                            .unwrap();
                    }
                    task.done().await.unwrap();
                    return;
                }
                None => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
            }
        }
    });

    let mut stream = caller
        .rpc_stream("q_stream", Value::map([("x", Value::Int(1))]), Some(5.0))
        .await
        .unwrap();

    for expected in 0..3 {
        let event = stream.next().await.unwrap();
        assert_eq!(event.get("step").and_then(Value::as_int), Some(expected));
    }
    stream.unsubscribe().await;
    worker_task.await.unwrap();
}

#[tokio::test]
async fn correlation_is_by_payload_convention_only() {
    common::init_logging();
    let addr = common::spawn_server().await;
    let client = Client::connect(addr).await.unwrap();

    // a task carrying _request_id is an ordinary task to the queue engine
    let id = client
        .add(
            "plain",
            Value::map([("_request_id", Value::Str("r1".into()))]),
        )
        .await
        .unwrap();
    let (taken, payload) = client.take("plain").await.unwrap().unwrap();
    assert_eq!(taken, id);
    assert_eq!(
        payload.unwrap().get("_request_id").and_then(Value::as_str),
        Some("r1")
    );
}
