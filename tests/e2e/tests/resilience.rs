//! Failure paths: unknown ids, cancellation, admission and lost transports

use bytes::Bytes;
use e2e_tests::{recv_envelope, send_envelope, within, TestFramework};
use network::{IpcListener, Transport};
use port::{BackendInterface, ChannelEvent, ClientOptions, ClientPort, Endpoint, PortError};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wire::{AuthPacket, AuthResult, ClientToServerMessage, ServerToClientMessage};

#[tokio::test]
async fn unknown_ids_warn_without_closing_the_connection() {
    let framework = TestFramework::ipc().unwrap();
    let transport = framework.admitted_raw_transport("raw").await.unwrap();

    send_envelope(
        &transport,
        &ClientToServerMessage::ChannelSend {
            channel_id: 999,
            message: json!("lost"),
            ack_id: None,
        },
    )
    .await
    .unwrap();
    match recv_envelope(&transport).await.unwrap() {
        ServerToClientMessage::CommunicationWarning { warning } => {
            assert!(warning.contains("999"), "unexpected warning {warning}");
        }
        other => panic!("expected a warning, got {other:?}"),
    }

    send_envelope(
        &transport,
        &ClientToServerMessage::RpcCall {
            endpoint: "echo".to_string(),
            call_id: 1,
            parameter: json!({"x": 7}),
        },
    )
    .await
    .unwrap();
    assert_eq!(
        recv_envelope(&transport).await.unwrap(),
        ServerToClientMessage::RpcResult {
            call_id: 1,
            result: json!({"x": 7}),
        }
    );
}

#[tokio::test]
async fn keep_alive_is_acknowledged() {
    let framework = TestFramework::tcp().await.unwrap();
    let transport = framework.admitted_raw_transport("pinger").await.unwrap();
    send_envelope(&transport, &ClientToServerMessage::KeepAlive)
        .await
        .unwrap();
    assert_eq!(
        recv_envelope(&transport).await.unwrap(),
        ServerToClientMessage::KeepAliveAck
    );
}

#[tokio::test]
async fn unknown_endpoint_fails_the_call_only() {
    let framework = TestFramework::ipc().unwrap();
    let transport = framework.admitted_raw_transport("raw").await.unwrap();

    send_envelope(
        &transport,
        &ClientToServerMessage::RpcCall {
            endpoint: "doesNotExist".to_string(),
            call_id: 4,
            parameter: Value::Null,
        },
    )
    .await
    .unwrap();
    match recv_envelope(&transport).await.unwrap() {
        ServerToClientMessage::RpcError { call_id, error } => {
            assert_eq!(call_id, 4);
            assert!(error.title.contains("doesNotExist"));
        }
        other => panic!("expected an rpc error, got {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_channel_reports_cancellation_locally() {
    let framework = TestFramework::ipc().unwrap();
    let client = framework.connect("cancel-app", "k").await.unwrap();
    let open = client.has_open_communication();

    let cancel = CancellationToken::new();
    let channel = client
        .create_channel_with_cancel("echoChannel", Value::Null, cancel.clone())
        .unwrap();
    within(channel.send_and_wait_for_ack(json!("ping")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        within(channel.recv()).await.unwrap(),
        Some(ChannelEvent::Message(json!("ping")))
    );
    assert!(open.get());

    cancel.cancel();
    assert_eq!(
        within(channel.recv()).await.unwrap(),
        Some(ChannelEvent::Errored(PortError::Cancelled))
    );
    within(open.until(|open| !open)).await.unwrap().unwrap();

    let echoed = client.call_rpc("echo", json!({"x": 2})).await.unwrap();
    assert_eq!(echoed, json!({"x": 2}));
}

#[tokio::test]
async fn mismatched_passkey_is_rejected_until_identity_is_released() {
    let framework = TestFramework::tcp().await.unwrap();
    let first = framework.connect("shared-id", "right").await.unwrap();

    let err = framework
        .connect("shared-id", "wrong")
        .await
        .err()
        .expect("second passkey was admitted");
    assert!(
        matches!(
            err.downcast_ref::<PortError>(),
            Some(PortError::Authentication { .. })
        ),
        "unexpected error {err:#}"
    );

    first.close().await;
    drop(first);

    let mut admitted = None;
    for _ in 0..50 {
        if let Ok(client) = framework.connect("shared-id", "wrong").await {
            admitted = Some(client);
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(admitted.is_some(), "identity was never released");
}

#[tokio::test]
async fn unsupported_auth_version_is_refused() {
    let framework = TestFramework::ipc().unwrap();
    let transport = framework.raw_transport().await.unwrap();
    let mut packet = AuthPacket::new("future", "k");
    packet.auth_version = 99;
    transport
        .send(Bytes::from(serde_json::to_vec(&packet).unwrap()))
        .await
        .unwrap();

    let reply = e2e_tests::recv_frame(&transport).await.unwrap();
    let result: AuthResult = serde_json::from_slice(&reply).unwrap();
    assert!(!result.success);
    assert!(result.error.unwrap_or_default().contains("99"));
}

#[tokio::test]
async fn lost_transport_fails_everything_in_flight() {
    let mut backend = BackendInterface::new();
    backend.add(Endpoint::rpc("hang")).unwrap();
    backend.add(Endpoint::channel("stream")).unwrap();
    let backend = Arc::new(backend);

    // A server that admits the client, waits for two requests and hangs up
    let (mut listener, connector) = IpcListener::new();
    let server = tokio::spawn(async move {
        let port = listener.accept().await.unwrap();
        port.receive().await.unwrap().unwrap();
        let accepted = serde_json::to_vec(&AuthResult::accepted()).unwrap();
        port.send(Bytes::from(accepted)).await.unwrap();
        port.receive().await.unwrap().unwrap();
        port.receive().await.unwrap().unwrap();
        port.close().await.unwrap();
    });

    let client = ClientPort::connect(
        Arc::new(connector.connect().unwrap()),
        backend,
        ClientOptions::new("doomed", "k"),
    )
    .await
    .unwrap();
    let channel = client.create_channel("stream", Value::Null).unwrap();
    let call = client.call_rpc("hang", Value::Null);

    let result = within(call).await.unwrap();
    assert!(matches!(result, Err(PortError::Transport { .. })), "{result:?}");
    assert!(matches!(
        within(channel.recv()).await.unwrap(),
        Some(ChannelEvent::Errored(PortError::Transport { .. }))
    ));
    assert!(client.is_closed());
    assert!(!client.has_open_communication().get());
    server.await.unwrap();
}

#[tokio::test]
async fn unix_socket_transport_serves_the_same_backend() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("unix://{}", dir.path().join("echo.sock").display());
    let framework = TestFramework::socket(&url).await.unwrap();

    let client = framework.connect("unix-app", "k").await.unwrap();
    let echoed = within(client.call_rpc("echo", json!({"x": 1})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, json!({"x": 1}));
    assert!(within(framework.server().connection_count()).await.unwrap() >= 1);
}
