//! Weft daemon binary.
//!
//! Loads configuration, applies command-line overrides, and runs the
//! router until interrupted. Without a real capture backend the data
//! plane is an in-memory device; the mesh side (connections, gossip,
//! routing) is fully live.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, EnvFilter};
use weft::{Config, MemoryDevice, Router};

/// Peer-to-peer virtual network router
#[derive(Parser, Debug)]
#[command(name = "weft", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// TCP/UDP listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Nickname shown in diagnostics
    #[arg(long)]
    nickname: Option<String>,

    /// Shared password enabling encrypted transport
    #[arg(long)]
    password: Option<String>,

    /// Fixed peer name (colon-separated hex octets); random when absent
    #[arg(long)]
    name: Option<String>,

    /// Initial peers to connect to (host or host:port)
    #[arg(value_name = "PEER")]
    peers: Vec<String>,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded config file");
                config
            }
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Some(port) = args.port {
        config.router.port = port;
    }
    if args.nickname.is_some() {
        config.router.nickname = args.nickname;
    }
    if args.password.is_some() {
        config.router.password = args.password;
    }
    if args.name.is_some() {
        config.router.name = args.name;
    }
    config.peers.extend(args.peers);

    let (device, written) = MemoryDevice::new();
    let sink = device.sink();
    // No capture backend is wired up; discard whatever the router
    // injects locally.
    std::thread::spawn(move || while written.recv().is_ok() {});

    let router = match Router::start(config, Box::new(device), Box::new(sink)).await {
        Ok(router) => router,
        Err(e) => {
            error!("Failed to start router: {}", e);
            std::process::exit(1);
        }
    };

    info!(name = %router.name(), "Router running, press Ctrl+C to exit");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    info!("{}", router.status());
    info!("Router shutting down");
}
