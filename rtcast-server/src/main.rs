use anyhow::Context;
use clap::Parser;
use rtcast_router::endpoint::webrtc::WebRtcEndpoint;
use rtcast_server::config::Config;
use rtcast_server::state::AppState;
use rtcast_server::{logging, relays, rtmp};
use std::sync::Arc;
use tracing::info;

/// rtcast: WebRTC/RTMP based live streaming edge server
#[derive(Debug, Parser)]
#[command(name = "rtcast", version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_file(&args.config)
        .with_context(|| format!("loading config from {}", args.config))?;
    logging::init_logging(&config.logging)?;

    let endpoint = Arc::new(WebRtcEndpoint::new(config.webrtc())?);
    let state = AppState::new(endpoint, config.capabilities(), config.cluster_origins());

    if config.rtmp.port > 0 {
        let rtmp_state = Arc::clone(&state);
        let rtmp_port = config.rtmp.port;
        tokio::spawn(async move {
            if let Err(err) = rtmp::run(rtmp_state, rtmp_port).await {
                tracing::error!(error = %err, "rtmp ingest exited");
            }
        });
    }

    relays::start_static_relays(&state, config.static_relays());

    let address = config.listen_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;
    info!(%address, "rtcast edge listening");

    axum::serve(listener, rtcast_server::app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutting down");
}
