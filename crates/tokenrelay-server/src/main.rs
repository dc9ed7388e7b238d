//! tokenrelay Server
//!
//! Accepts browser WebSocket connections, pairs each token with a dialed-out
//! agent connection and relays messages between them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use tokenrelay_core::config::load_config;
use tokenrelay_server::{
    AcceptAnyToken, AllowList, ConnectionHandler, RelayHub, RelayServer, SessionSettings,
    TokenValidator, WsDialer,
};

#[derive(Parser, Debug)]
#[command(name = "tokenrelay-server")]
#[command(
    version,
    about = "tokenrelay server - token-addressed WebSocket relay between browsers and agents"
)]
struct Args {
    /// Explicit JSON config file, layered over the global settings file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on (overrides `server.listen_addr`).
    #[arg(long)]
    addr: Option<String>,

    /// Upgrade path accepted for relay connections (overrides `server.path`).
    #[arg(long)]
    path: Option<String>,

    /// Agent WebSocket URL dialed for every session (overrides `agent.url`).
    #[arg(long)]
    agent_url: Option<String>,

    /// Agent dial attempts before a session is closed.
    #[arg(long)]
    max_retries: Option<u32>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "TOKENRELAY_LOG_JSON")]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "TOKENRELAY_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    #[cfg(feature = "metrics")]
    let metrics_endpoint = args.metrics_endpoint.as_deref();
    #[cfg(not(feature = "metrics"))]
    let metrics_endpoint: Option<&str> = None;

    // Hold the guard so the OTel pipeline stays alive for the process lifetime.
    let _metrics_guard = tokenrelay_core::tracing_init::init_tracing_with_metrics(
        "tokenrelay_server=info,tokenrelay_core=info",
        args.log_json,
        metrics_endpoint,
    );

    let mut config = load_config(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.listen_addr = addr;
    }
    if let Some(path) = args.path {
        config.server.path = path;
    }
    if let Some(url) = args.agent_url {
        config.agent.url = url;
    }
    if let Some(max_retries) = args.max_retries {
        config.reconnect.max_retries = max_retries;
    }
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.server.listen_addr,
        path = %config.server.path,
        agent_url = %config.agent.url,
        max_retries = config.reconnect.max_retries,
        "Starting tokenrelay-server"
    );

    let dialer = Arc::new(WsDialer::new(Duration::from_secs(
        config.agent.connect_timeout_secs,
    )));
    let hub = RelayHub::new(SessionSettings::from(&config), dialer);

    let validator: Arc<dyn TokenValidator> = match config.server.allowed_tokens.clone() {
        Some(tokens) => {
            info!(count = tokens.len(), "Token allow list enabled");
            Arc::new(AllowList::new(tokens))
        }
        None => Arc::new(AcceptAnyToken),
    };

    let handler = ConnectionHandler::new(
        hub,
        validator,
        config.agent.url.clone(),
        config.server.path.clone(),
    );
    let listener = TcpListener::bind(&config.server.listen_addr).await?;
    let server = RelayServer::new(listener, handler);
    info!(addr = %server.local_addr()?, "Relay ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serve = tokio::spawn(server.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C shutdown signal");
    let _ = shutdown_tx.send(true);
    serve.await?;

    info!("Relay stopped");
    Ok(())
}
