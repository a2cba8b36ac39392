mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use beach_pier::config::{Cli, ServerConfig};
use beach_pier::server::{serve, AppState};
use clap::Parser;
use common::{Behaviour, FakeBackend, STEP_TIMEOUT};
use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;

async fn get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("write request");
    let mut response = String::new();
    timeout(STEP_TIMEOUT, stream.read_to_string(&mut response))
        .await
        .expect("response within timeout")
        .expect("read response");
    response
}

#[tokio::test]
async fn session_metrics_are_exported() {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("install recorder");

    let cli = Cli::try_parse_from(["beach-pier", "--backend", "docker"]).expect("cli");
    let config = ServerConfig::try_from(cli).expect("config");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = Arc::new(AppState {
        config,
        backend: Arc::new(FakeBackend::new(Behaviour::Echo)),
        metrics: Some(handle),
    });
    let server = tokio::spawn(async move {
        serve(listener, state, std::future::pending())
            .await
            .expect("serve");
    });

    let (mut client, _response) = connect_async(format!("ws://{addr}/ws?container=web"))
        .await
        .expect("connect");
    // The title frame only goes out once the session is counted.
    timeout(STEP_TIMEOUT, client.next())
        .await
        .expect("frame within timeout")
        .expect("stream open")
        .expect("websocket message");

    let response = get(addr, "/metrics").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("beach_pier_sessions_total 1"), "{response}");

    drop(client);
    server.abort();
}
