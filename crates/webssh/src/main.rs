#![forbid(unsafe_code)]

//! `webssh` binary: the embedded SSH daemon plus the websocket terminal
//! endpoint, sharing one session registry.

mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, LogFormat};
use webssh::task::supervise;
use webssh::{Gateway, ServerBuilder, SessionRegistry, ws};

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.default_filter()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    match cli.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = cli.gateway_config()?;
    let credentials = cli.credentials()?;
    if credentials.user_count() == 0 && credentials.key_count() == 0 {
        warn!("No users or authorized keys configured; every daemon login will be denied");
    }

    let registry = Arc::new(SessionRegistry::new());
    registry.start_sweeper(config.sweep_interval(), config.max_idle());
    let gateway = Gateway::new(Arc::clone(&registry));

    if let Some(addr) = &config.ws_listen {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding websocket endpoint {addr}"))?;
        supervise("ws-endpoint", ws::serve(listener, gateway.clone()));
    }

    let server = ServerBuilder::from_config(&config)
        .credentials(credentials)
        .build()
        .context("building SSH daemon")?;
    info!(address = server.address(), "Starting WebSSH");

    tokio::select! {
        result = server.listen() => result.context("SSH daemon stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    registry.stop_sweeper();
    for session in registry.sessions() {
        registry.delete(session.id()).await;
    }
    Ok(())
}
