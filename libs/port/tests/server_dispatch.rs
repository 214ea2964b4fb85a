//! Client and server ports wired together over in-process message ports

use network::{IpcConnector, IpcListener};
use parking_lot::Mutex;
use port::{
    BackendInterface, ChannelEvent, ClientOptions, ClientPort, Endpoint, FirstComeFirstServe,
    PortError, Schema, Server, ServerOptions, WritableSignalSource,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use signals::{Signal, SignalError, Subscribable};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use wire::{Patch, PathKey};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Echo {
    x: i64,
}

fn backend() -> BackendInterface {
    let mut backend = BackendInterface::new();
    backend
        .add(
            Endpoint::rpc("echo")
                .parameter(Schema::of::<Echo>())
                .returns(Schema::of::<Echo>()),
        )
        .unwrap();
    backend.add(Endpoint::rpc("unhandled")).unwrap();
    backend.add(Endpoint::rpc("fails")).unwrap();
    backend.add(Endpoint::rpc("slow")).unwrap();
    backend.add(Endpoint::channel("shout")).unwrap();
    backend.add(Endpoint::writable_signal("readonly")).unwrap();

    backend
        .on_rpc("echo", |_, parameter| async move { Ok(parameter) })
        .unwrap();
    backend
        .on_rpc("fails", |_, _| async move {
            Err::<Value, _>(anyhow::anyhow!("disk full").context("Could not save"))
        })
        .unwrap();
    backend
        .on_channel("shout", |_, _, channel| async move {
            while let Some(ChannelEvent::Message(message)) = channel.recv().await {
                let loud = message.as_str().unwrap_or_default().to_uppercase();
                channel.send_and_wait_for_ack(json!(loud)).await?;
            }
            Ok(())
        })
        .unwrap();
    backend
        .on_writable_signal("readonly", |_, _| async move {
            let signal = Arc::new(Signal::new(json!({"count": 1})));
            Ok(WritableSignalSource::new(signal, |_, _| {
                Err(anyhow::anyhow!("value is read only"))
            }))
        })
        .unwrap();
    backend
}

async fn connect(backend: Arc<BackendInterface>, connector: &IpcConnector) -> ClientPort {
    ClientPort::connect(
        Arc::new(connector.connect().unwrap()),
        backend,
        ClientOptions::new("tests", "passkey"),
    )
    .await
    .unwrap()
}

async fn start(backend: BackendInterface) -> (ClientPort, IpcConnector) {
    let backend = Arc::new(backend);
    let server = Server::new(
        Arc::clone(&backend),
        Arc::new(FirstComeFirstServe::new()),
        ServerOptions::default(),
    );
    let (listener, connector) = IpcListener::new();
    tokio::spawn(server.serve_ipc(listener));
    (connect(backend, &connector).await, connector)
}

#[tokio::test]
async fn echo_rpc_round_trip() {
    let (client, _connector) = start(backend()).await;
    let echoed: Echo = client.call_rpc_typed("echo", &Echo { x: 1 }).await.unwrap();
    assert_eq!(echoed, Echo { x: 1 });
}

#[tokio::test]
async fn invalid_parameter_is_rejected_locally() {
    let (client, _connector) = start(backend()).await;
    let err = client.call_rpc("echo", json!({"y": 2})).await.unwrap_err();
    assert!(matches!(err, PortError::Validation { .. }));
    assert!(!client.has_open_communication().get());
}

#[tokio::test]
async fn missing_handler_is_an_application_error() {
    let (client, _connector) = start(backend()).await;
    match client.call_rpc("unhandled", json!(null)).await {
        Err(PortError::Remote(error)) => assert!(error.title.contains("No handler")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn handler_errors_keep_their_cause_chain() {
    let (client, _connector) = start(backend()).await;
    match client.call_rpc("fails", json!(null)).await {
        Err(PortError::Remote(error)) => {
            assert_eq!(error.title, "Could not save");
            assert_eq!(error.cause.as_deref(), Some("disk full"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_rpc_drops_the_server_handler() {
    struct NotifyOnDrop(Option<oneshot::Sender<()>>);
    impl Drop for NotifyOnDrop {
        fn drop(&mut self) {
            if let Some(tx) = self.0.take() {
                let _ = tx.send(());
            }
        }
    }

    let (dropped_tx, dropped_rx) = oneshot::channel();
    let (started_tx, started_rx) = oneshot::channel();
    let slot = Arc::new(Mutex::new(Some((dropped_tx, started_tx))));

    let mut backend = backend();
    backend
        .on_rpc("slow", move |_, _| {
            let taken = slot.lock().take();
            async move {
                let _guard = taken.map(|(dropped, started)| {
                    let _ = started.send(());
                    NotifyOnDrop(Some(dropped))
                });
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }
        })
        .unwrap();

    let (client, _connector) = start(backend).await;
    let cancel = CancellationToken::new();
    let call = tokio::spawn({
        let client = client.clone();
        let cancel = cancel.clone();
        async move { client.call_rpc_with_cancel("slow", json!(null), &cancel).await }
    });

    started_rx.await.unwrap();
    cancel.cancel();
    assert_eq!(call.await.unwrap(), Err(PortError::Cancelled));
    tokio::time::timeout(Duration::from_secs(5), dropped_rx)
        .await
        .expect("server handler was not dropped")
        .unwrap();
}

#[tokio::test]
async fn channel_messages_are_acknowledged_on_consumption() {
    let (client, _connector) = start(backend()).await;
    let channel = client.create_channel("shout", json!(null)).unwrap();

    channel.send_and_wait_for_ack(json!("hello")).await.unwrap();
    assert_eq!(
        channel.recv().await,
        Some(ChannelEvent::Message(json!("HELLO")))
    );

    channel.close();
    assert_eq!(channel.recv().await, Some(ChannelEvent::Closed));
}

#[tokio::test]
async fn rejected_write_reverts_optimistic_value() {
    let (client, _connector) = start(backend()).await;
    let readonly = client.create_writable_signal("readonly", json!(null)).unwrap();
    let _sub = readonly.subscribe(|_| {});
    assert_eq!(readonly.pull().await, Ok(json!({"count": 1})));

    let write = readonly.update(
        |value| {
            let next = json!({"count": value["count"].as_i64().unwrap_or(0) + 1});
            (next, vec![Patch::replace(vec!["count".into()], json!(2))])
        },
        vec![],
    );
    assert_eq!(readonly.get(), Some(json!({"count": 2})));

    let result = write.await;
    assert!(matches!(result, Err(SignalError::WriteRejected { .. })));
    assert_eq!(readonly.get(), Some(json!({"count": 1})));
}

#[tokio::test]
async fn second_passkey_for_live_identity_is_refused() {
    let (_client, connector) = start(backend()).await;
    let err = ClientPort::connect(
        Arc::new(connector.connect().unwrap()),
        Arc::new(backend()),
        ClientOptions::new("tests", "another"),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, PortError::Authentication { .. }));

    let again = connect(Arc::new(backend()), &connector).await;
    let echoed = again.call_rpc("echo", json!({"x": 5})).await.unwrap();
    assert_eq!(echoed, json!({"x": 5}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replica_keeps_changes_made_while_subscribing() {
    const WRITES: i64 = 200;
    let source = Signal::new(json!({}));
    let mut backend = backend();
    backend.add(Endpoint::signal("busy")).unwrap();
    let served = source.clone();
    backend
        .on_signal("busy", move |_, _| {
            let signal = served.clone();
            async move { Ok(Arc::new(signal) as Arc<dyn Subscribable<Value>>) }
        })
        .unwrap();
    let (client, _connector) = start(backend).await;

    let writer = source.clone();
    let churn = std::thread::spawn(move || {
        for i in 0..WRITES {
            let key = format!("k{i}");
            writer.update(
                move |value| {
                    let mut next = value.clone();
                    next[key.as_str()] = json!(i);
                    (next, vec![Patch::add(vec![PathKey::from(key)], json!(i))])
                },
                vec![],
            );
        }
    });

    let replica = client.create_signal("busy", json!(null)).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = replica.subscribe(move |value| {
        let _ = tx.send(value.clone());
    });
    churn.join().unwrap();

    let expected = source.get();
    assert_eq!(expected.as_object().map(|map| map.len()), Some(WRITES as usize));
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(value) = rx.recv().await {
            if value.as_ref() == Some(&expected) {
                return;
            }
        }
    })
    .await
    .expect("replica never converged on the source value");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_operations_get_distinct_ids() {
    let (client, _connector) = start(backend()).await;

    let calls: Vec<_> = (0..16)
        .map(|x| {
            let client = client.clone();
            tokio::spawn(async move { (x, client.call_rpc("echo", json!({"x": x})).await) })
        })
        .collect();
    for call in calls {
        let (x, echoed) = call.await.unwrap();
        assert_eq!(echoed, Ok(json!({"x": x})));
    }

    let opened: Vec<_> = (0..16)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move {
                let channel = client.create_channel("shout", json!(null)).unwrap();
                channel.send_and_wait_for_ack(json!(format!("m{n}"))).await.unwrap();
                let reply = channel.recv().await;
                (n, channel, reply)
            })
        })
        .collect();
    let mut ids = std::collections::HashSet::new();
    for open in opened {
        let (n, channel, reply) = open.await.unwrap();
        assert_eq!(reply, Some(ChannelEvent::Message(json!(format!("M{n}")))));
        assert!(ids.insert(channel.id()), "channel id {} reused", channel.id());
    }
}
