//! Command line entry point for the signaling server

use anyhow::Context;
use clap::Parser;
use std::num::NonZeroUsize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use videoroom_server::config::{DEFAULT_ROOM_CAPACITY, DEFAULT_WS_PATH};
use videoroom_server::{ServerConfig, SignalingServer};

#[derive(Debug, Parser)]
#[command(
    name = "videoroom-signaling",
    about = "WebSocket signaling relay for peer-to-peer video rooms"
)]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "VIDEOROOM_BIND", default_value = "0.0.0.0:8080")]
    bind: String,

    /// Request path that accepts WebSocket upgrades.
    #[arg(long, env = "VIDEOROOM_PATH", default_value = DEFAULT_WS_PATH)]
    path: String,

    /// Maximum members per room.
    #[arg(long, env = "VIDEOROOM_ROOM_CAPACITY", default_value_t = DEFAULT_ROOM_CAPACITY)]
    room_capacity: NonZeroUsize,

    /// Log level when `RUST_LOG` is not set.
    #[arg(long, env = "VIDEOROOM_LOG", default_value = "info")]
    log_level: String,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let config = ServerConfig {
        bind_addr: args.bind,
        ws_path: args.path,
        room_capacity: args.room_capacity,
    };
    let server = SignalingServer::new(config.clone())
        .bind()
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("bye");
    Ok(())
}
