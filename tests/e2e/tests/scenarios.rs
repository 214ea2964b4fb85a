//! Golden path scenarios against the echo backend over every transport

use e2e_tests::{within, TestFramework};
use echo_server::{Counter, Echo, Increment};
use port::ChannelEvent;
use serde_json::{json, Value};
use signals::producer;
use tokio::sync::mpsc;

async fn echo_rpc_resolves_and_releases(framework: TestFramework) {
    let client = framework.connect("echo-app", "k").await.unwrap();
    let open = client.has_open_communication();

    let result = within(client.call_rpc("echo", json!({"x": 1})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, json!({"x": 1}));
    assert!(!open.get(), "rpc registry entry outlived its result");

    let counter: Counter = client
        .call_rpc_typed("increment", &Increment { by: 3 })
        .await
        .unwrap();
    assert_eq!(counter, Counter { count: 3 });
    assert_eq!(framework.state().count(), 3);
}

#[tokio::test]
async fn echo_rpc_over_ipc() {
    echo_rpc_resolves_and_releases(TestFramework::ipc().unwrap()).await;
}

#[tokio::test]
async fn echo_rpc_over_tcp() {
    echo_rpc_resolves_and_releases(TestFramework::tcp().await.unwrap()).await;
}

async fn signal_follows_server_patches(framework: TestFramework) {
    let client = framework.connect("signal-app", "k").await.unwrap();
    let counter = client.create_signal("counter", Value::Null).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = counter.subscribe(move |value| {
        let _ = tx.send(value.clone());
    });

    assert_eq!(within(counter.pull()).await.unwrap(), Ok(json!({"count": 0})));
    while rx.try_recv().is_ok() {}

    framework.state().increment(1);
    let seen = within(rx.recv()).await.unwrap();
    assert_eq!(seen, Some(Some(json!({"count": 1}))));
    assert_eq!(counter.get(), Some(json!({"count": 1})));

    drop(subscription);
    assert!(counter.is_stale());
}

#[tokio::test]
async fn signal_replication_over_ipc() {
    signal_follows_server_patches(TestFramework::ipc().unwrap()).await;
}

#[tokio::test]
async fn signal_replication_over_tcp() {
    signal_follows_server_patches(TestFramework::tcp().await.unwrap()).await;
}

async fn optimistic_writes_settle_in_one_round_trip(framework: TestFramework) {
    let client = framework.connect("owl-app", "k").await.unwrap();
    let counter = client
        .create_writable_signal("writableCounter", Value::Null)
        .unwrap();
    let _subscription = counter.subscribe(|_| {});
    assert_eq!(within(counter.pull()).await.unwrap(), Ok(json!({"count": 0})));

    let increment = || {
        producer(|draft| {
            let count = draft["count"].as_i64().unwrap_or(0);
            draft["count"] = json!(count + 1);
        })
    };
    let first = counter.update(increment(), vec![]);
    let second = counter.update(increment(), vec![]);
    assert_eq!(counter.get(), Some(json!({"count": 2})));

    assert_eq!(within(first).await.unwrap(), Ok(()));
    assert_eq!(within(second).await.unwrap(), Ok(()));
    assert_eq!(counter.get(), Some(json!({"count": 2})));
    assert_eq!(counter.pending_writes(), 0);
    assert_eq!(framework.state().count(), 2);
}

#[tokio::test]
async fn writable_signal_over_ipc() {
    optimistic_writes_settle_in_one_round_trip(TestFramework::ipc().unwrap()).await;
}

#[tokio::test]
async fn writable_signal_over_tcp() {
    optimistic_writes_settle_in_one_round_trip(TestFramework::tcp().await.unwrap()).await;
}

#[tokio::test]
async fn writers_on_separate_connections_see_each_other() {
    let framework = TestFramework::tcp().await.unwrap();
    let writer = framework.connect("writer", "k").await.unwrap();
    let reader = framework.connect("reader", "k").await.unwrap();

    let mirror = reader.create_signal("counter", Value::Null).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watch = mirror.subscribe(move |value| {
        let _ = tx.send(value.clone());
    });
    assert_eq!(within(mirror.pull()).await.unwrap(), Ok(json!({"count": 0})));

    let writable = writer
        .create_writable_signal("writableCounter", Value::Null)
        .unwrap();
    let _hold = writable.subscribe(|_| {});
    within(writable.pull()).await.unwrap().unwrap();
    let write = writable.update(producer(|draft| draft["count"] = json!(41)), vec![]);
    within(write).await.unwrap().unwrap();

    loop {
        let seen = within(rx.recv()).await.unwrap().unwrap();
        if seen == Some(json!({"count": 41})) {
            break;
        }
    }
}

async fn channel_echoes_messages(framework: TestFramework) {
    let client = framework.connect("channel-app", "k").await.unwrap();
    let channel = client.create_channel("echoChannel", Value::Null).unwrap();

    for x in 0..3 {
        within(channel.send_and_wait_for_ack(json!(Echo { x })))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            within(channel.recv()).await.unwrap(),
            Some(ChannelEvent::Message(json!({"x": x})))
        );
    }

    channel.close();
    assert_eq!(within(channel.recv()).await.unwrap(), Some(ChannelEvent::Closed));
    assert_eq!(channel.recv().await, None);
}

#[tokio::test]
async fn echo_channel_over_ipc() {
    channel_echoes_messages(TestFramework::ipc().unwrap()).await;
}

#[tokio::test]
async fn echo_channel_over_tcp() {
    channel_echoes_messages(TestFramework::tcp().await.unwrap()).await;
}
