use std::sync::Arc;

use anyhow::Result;
use beach_pier::{
    config::{Cli, ServerConfig},
    remote::PtyBackend,
    server,
    telemetry::Telemetry,
};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        backend = ?config.backend.kind,
        command = ?config.backend.command,
        reconnect = ?config.session.reconnect,
        "starting beach-pier server"
    );

    let backend = Arc::new(PtyBackend::new(config.backend.clone()));
    server::run(config, backend, Some(telemetry.metrics_handle())).await
}
