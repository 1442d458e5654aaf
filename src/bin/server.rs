//! Relay Server Application
//!
//! Runs the control server, the built-in tone backend and, when enabled,
//! the HTTP status API.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_media_relay::{
    config::AppConfig,
    server::{Server, ServerContext},
};

#[derive(Parser, Debug)]
#[command(name = "relay-server", version, about = "LAN media relay server")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind the control listener to
    #[arg(long)]
    bind: Option<String>,

    /// Control protocol port
    #[arg(short, long)]
    port: Option<u16>,

    /// HTTP status API port
    #[arg(long)]
    http_port: Option<u16>,

    /// Disable the HTTP status API
    #[arg(long)]
    no_api: bool,

    /// Write the effective configuration to this path and exit
    #[arg(long)]
    write_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load_or_default(args.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = args.bind {
        config.network.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.network.control_port = port;
    }
    if let Some(port) = args.http_port {
        config.api.http_port = port;
    }
    if args.no_api {
        config.api.enabled = false;
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.filter.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(path) = args.write_config {
        config.save(&path)?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }

    tracing::info!("Starting LAN media relay");

    let ctx = ServerContext::new(config.clone())?;
    let mut server = Server::bind(ctx.clone())?;
    server.start()?;

    #[cfg(feature = "http-api")]
    let api_handle = if config.api.enabled {
        let api = lan_media_relay::api::ApiServer::new(config.api.clone(), ctx.clone());
        Some(api.start_background())
    } else {
        None
    };

    tracing::info!(
        "Control protocol on {}, press Ctrl+C to stop",
        server.local_addr()
    );
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");

    #[cfg(feature = "http-api")]
    {
        if let Some(handle) = api_handle {
            handle.abort();
        }
    }

    tokio::task::spawn_blocking(move || {
        server.stop();
        ctx.shutdown();
    })
    .await?;

    Ok(())
}
