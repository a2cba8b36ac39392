mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use beach_pier::config::{Cli, ServerConfig};
use beach_pier::server::{serve, AppState};
use beach_pier_core::ServerFrame;
use bytes::Bytes;
use clap::Parser;
use common::{Behaviour, FakeBackend, STEP_TIMEOUT};
use futures::{SinkExt, StreamExt};
use serde_json::Map;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(backend: Arc<FakeBackend>) -> (SocketAddr, JoinHandle<()>) {
    let cli = Cli::try_parse_from([
        "beach-pier",
        "--backend",
        "docker",
        "--drain-timeout-secs",
        "1",
    ])
    .expect("cli");
    let config = ServerConfig::try_from(cli).expect("config");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = Arc::new(AppState {
        config,
        backend,
        metrics: None,
    });
    let handle = tokio::spawn(async move {
        serve(listener, state, std::future::pending())
            .await
            .expect("serve");
    });
    (addr, handle)
}

async fn next_frame(client: &mut Client) -> ServerFrame {
    loop {
        let message = timeout(STEP_TIMEOUT, client.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("websocket message");
        match message {
            Message::Text(text) => {
                return ServerFrame::decode(text.as_bytes()).expect("valid server frame")
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message {other:?}"),
        }
    }
}

#[tokio::test]
async fn browser_session_over_websocket() {
    let backend = Arc::new(FakeBackend::new(Behaviour::Echo));
    let (addr, server) = start_server(Arc::clone(&backend)).await;

    let (mut client, _response) = connect_async(format!("ws://{addr}/ws?container=web"))
        .await
        .expect("connect");

    assert_eq!(
        next_frame(&mut client).await,
        ServerFrame::SetWindowTitle("TTY - /bin/bash".into())
    );
    assert_eq!(
        next_frame(&mut client).await,
        ServerFrame::SetPreferences(Map::new())
    );

    client
        .send(Message::Text("0ls\r".into()))
        .await
        .expect("send input");
    assert_eq!(
        next_frame(&mut client).await,
        ServerFrame::Output(Bytes::from_static(b"ls\r"))
    );

    client.send(Message::Text("1".into())).await.expect("send ping");
    assert_eq!(next_frame(&mut client).await, ServerFrame::Pong);

    client.close(None).await.expect("close");

    let input = backend.observed.wait_for_input_suffix(b"exit\r").await;
    assert_eq!(input, b"ls\rexit\r");

    let targets = backend.observed.targets.lock().unwrap().clone();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].namespace, "default");
    assert_eq!(targets[0].container.as_deref(), Some("web"));

    server.abort();
}

#[tokio::test]
async fn invalid_target_is_rejected_before_upgrade() {
    let backend = Arc::new(FakeBackend::new(Behaviour::Echo));
    let (addr, server) = start_server(Arc::clone(&backend)).await;

    for query in ["container=--privileged", "pod=web-0"] {
        let err = match connect_async(format!("ws://{addr}/ws?{query}")).await {
            Ok(_) => panic!("upgrade with {query} should be refused"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("400"), "{err}");
    }
    assert!(backend.observed.targets.lock().unwrap().is_empty());

    server.abort();
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let backend = Arc::new(FakeBackend::new(Behaviour::Echo));
    let (addr, server) = start_server(backend).await;

    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .expect("write request");
    let mut response = String::new();
    timeout(STEP_TIMEOUT, stream.read_to_string(&mut response))
        .await
        .expect("response within timeout")
        .expect("read response");

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#"{"status":"ok"}"#), "{response}");

    server.abort();
}
