use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use scrapnet_api::handlers::AppState;
use scrapnet_api::{
    build_server, ArtifactStore, JwtService, NodeConfig, Replicator, Scraper, UserDirectory,
};
use scrapnet_ring::{Discovery, RingNode};

/// Peer-to-peer web-scraping node. Finds its ring over the LAN and needs
/// no arguments; everything else is configuration.
#[derive(Debug, Parser)]
#[command(name = "scrapnet", version, about)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    let config = match NodeConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };
    config.validate()?;

    let own_ip = detect_host_ip()?;
    info!(ip = %own_ip, "Configuration loaded, node address resolved");

    run_node(config, own_ip).await
}

async fn run_node(config: NodeConfig, own_ip: String) -> Result<()> {
    // Ring first: the RPC listener must answer before we announce
    // ourselves to anyone.
    let ring = Arc::new(RingNode::new(own_ip.clone(), config.ring.clone())?);
    let ring_workers = ring.start().await?;

    let discovery = Discovery::new(own_ip.clone(), &config.ring);
    let contact = discovery.discover().await;
    if let Err(e) = ring.join(contact.as_deref()).await {
        warn!(error = %e, "Join attempt failed, continuing as lone member");
    }
    let responders = discovery.spawn_responders();

    // Local state and collaborators.
    let store = Arc::new(ArtifactStore::open(&config.storage.root, &own_ip)?);
    let users = Arc::new(UserDirectory::new());
    let jwt = JwtService::new(
        config.auth.jwt_secret.as_bytes(),
        config.auth.token_ttl_minutes,
    );
    let scraper = Arc::new(Scraper::new(&config.scrape)?);
    let shutting_down = Arc::new(AtomicBool::new(false));

    let state = AppState {
        ring: Arc::clone(&ring),
        store: Arc::clone(&store),
        users: Arc::clone(&users),
        jwt,
        scraper,
        scrape_lock: Arc::new(tokio::sync::Mutex::new(())),
        http_port: config.http.port,
        shutting_down: Arc::clone(&shutting_down),
    };

    let replicator = Replicator::new(
        Arc::clone(&ring),
        Arc::clone(&store),
        Arc::clone(&users),
        &config.replication,
        config.http.port,
        Arc::clone(&shutting_down),
    )?;
    let replication_task = replicator.spawn();

    let server = build_server(state, &config.http)?;
    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    info!(node = %ring.local(), "Node up");

    shutdown_signal().await;
    info!("Shutdown signal received, stopping");

    // Teardown is monotonic: new work is refused first, storage is wiped
    // last.
    shutting_down.store(true, Ordering::SeqCst);
    discovery.stop();
    ring.stop();

    replication_task.abort();
    for responder in responders {
        responder.abort();
    }
    ring_workers.shutdown();

    server_handle.stop(true).await;
    let _ = server_task.await;

    store.wipe()?;
    info!("Node stopped, storage wiped");
    Ok(())
}

/// Initialize logging from `SCRAPNET_LOG_LEVEL` / `SCRAPNET_LOG_FORMAT`.
fn init_logging() -> Result<()> {
    let level = env::var("SCRAPNET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let format = env::var("SCRAPNET_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&level))?;

    match format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        "pretty" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().compact().with_target(false))
                .init();
        }
    }

    Ok(())
}

/// The node's own LAN address: `SCRAPNET_IP` when set, otherwise whatever
/// source address the OS routes outward traffic from. The probe socket
/// never sends a packet.
fn detect_host_ip() -> Result<String> {
    if let Ok(ip) = env::var("SCRAPNET_IP") {
        return Ok(ip);
    }

    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip().to_string())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}
