//! EngineHub RPC Server - JSON-RPC front end for the command router.
//!
//! This binary hosts an `EngineHub`, listens for instance channels, and serves
//! the caller-facing API as JSON-RPC 2.0 over HTTP.

mod handlers;
mod server;
mod wrapper;

use anyhow::Result;
use clap::Parser;
use enginehub_core::{EngineHub, HubSettings};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "enginehub-rpc")]
#[command(about = "JSON-RPC server routing commands to running engine instances")]
struct Args {
    /// Port to listen on for RPC (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port instances open their channels to (0 = auto-assign)
    #[arg(long, default_value = "6500")]
    channel_port: u16,

    /// Directory holding instance status files (defaults to ~/.enginehub)
    #[arg(long)]
    status_dir: Option<PathBuf>,

    /// Instance used when a caller has no pin and several instances are live
    #[arg(long)]
    default_instance: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --debug
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting EngineHub RPC Server");

    let mut settings = HubSettings::from_env();
    if let Some(dir) = args.status_dir {
        settings = settings.with_status_dir(dir);
    }
    if let Some(identity) = args.default_instance {
        settings = settings.with_default_instance(identity);
    }

    info!("Status directory: {}", settings.status_dir.display());

    let hub = EngineHub::builder(settings)
        .channel_listener(format!("{}:{}", args.host, args.channel_port))
        .build()
        .await?;

    let addr = server::start_server(hub.clone(), &args.host, args.port).await?;

    // Launchers read these lines to find both ports
    if let Some(channel_addr) = hub.channel_addr() {
        println!("CHANNEL_PORT={}", channel_addr.port());
    }
    println!("RPC_PORT={}", addr.port());

    info!("RPC server running on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    hub.shutdown();

    Ok(())
}
