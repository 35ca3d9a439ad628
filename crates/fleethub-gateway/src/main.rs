//! FleetHub Gateway Server

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use fleethub_core::OpKind;
use fleethub_gateway::config::Config;
use fleethub_gateway::crypto::{generate_bootstrap_token, EdgeCa};
use fleethub_gateway::registry::run_keepalive_sweeper;
use fleethub_gateway::state::AppState;
use fleethub_gateway::tunnel::TunnelServer;
use fleethub_gateway::upstream::InMemoryCluster;
use fleethub_gateway::{monitor, tls, transport};

#[derive(Parser)]
#[command(name = "fleethub-gateway", about = "FleetHub edge gateway")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Generate and register a one-time bootstrap token at startup.
    #[arg(long)]
    issue_bootstrap_token: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    // Load config
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    // Load the edge CA (optional - the bootstrap surface won't work without it)
    let ca = match EdgeCa::from_files(
        &config.hub_tls.ca_file,
        &config.hub_tls.ca_key_file,
        config.edge_cert_validity_days,
    ) {
        Ok(ca) => {
            info!(
                ca_cert = %config.hub_tls.ca_file,
                validity_days = config.edge_cert_validity_days,
                "Edge CA loaded"
            );
            Some(Arc::new(ca))
        }
        Err(e) => {
            warn!(
                error = %e,
                "Failed to load edge CA - certificate bootstrap will not work"
            );
            None
        }
    };

    // Cluster client: the in-process store; a deployment against a real
    // cluster manager swaps this implementation behind the same trait.
    let cluster = match &ca {
        Some(ca) => InMemoryCluster::with_ca(ca.clone()),
        None => InMemoryCluster::new(),
    };

    let state = AppState::new(config.clone(), cluster, ca);

    if args.issue_bootstrap_token {
        let (plaintext, hash) = generate_bootstrap_token();
        state.add_bootstrap_token(hash, 24).await;
        info!(token = %plaintext, "Bootstrap token issued (valid 24h, single use)");
    }

    info!(
        node_limit = config.node_limit,
        keepalive_secs = config.keepalive_interval_secs,
        "Starting FleetHub gateway"
    );

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    // Keepalive sweeper
    tasks.push(tokio::spawn(run_keepalive_sweeper(
        state.registry.clone(),
        Duration::from_secs(config.keepalive_interval_secs),
        shutdown.clone(),
    )));

    // Client-facing listeners share the hub trust domain; the HTTPS surface
    // admits anonymous peers for certificate bootstrap.
    if config.websocket.enable || config.quic.enable {
        let hub_tls = tls::server_config(&config.hub_tls, true)?;

        if config.websocket.enable {
            let state = state.clone();
            let tls = hub_tls.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = transport::websocket::run_listener(state, tls, shutdown).await {
                    error!(error = %e, "WebSocket listener failed");
                }
            }));
        }

        if config.quic.enable {
            let state = state.clone();
            let tls = hub_tls.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = transport::quic::run_listener(state, tls, shutdown).await {
                    error!(error = %e, "QUIC listener failed");
                }
            }));
        }
    }

    if config.https.enable {
        let https_tls = tls::server_config(&config.hub_tls, false)?;
        let state = state.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = transport::https::run_listener(state, https_tls, shutdown).await {
                error!(error = %e, "HTTPS listener failed");
            }
        }));
    }

    if config.unix_socket.enable {
        let state = state.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = transport::uds::run_listener(state, shutdown).await {
                error!(error = %e, "Unix socket listener failed");
            }
        }));
    }

    if config.tunnel.enable {
        let tunnel_tls = tls::server_config(&config.tunnel.tls, true)?;
        let stream_tls = if config.stream.use_tls {
            Some(tls::client_config(&config.stream.tls)?)
        } else {
            None
        };
        let server = TunnelServer::new(config.tunnel.clone(), stream_tls);
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.run(tunnel_tls, shutdown).await {
                error!(error = %e, "Tunnel listener failed");
            }
        }));
    }

    if config.monitor.enable {
        let state = state.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = monitor::run_server(state, shutdown).await {
                error!(error = %e, "Monitor server failed");
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    // Stop accepting, close sessions, then let queued work items drain.
    shutdown.cancel();
    state.registry.close_all("gateway shutting down").await;

    let drain_deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let pending: usize = OpKind::ALL
            .iter()
            .map(|kind| state.metrics.depth(*kind))
            .sum();
        if pending == 0 || tokio::time::Instant::now() >= drain_deadline {
            if pending > 0 {
                warn!(pending, "Drain deadline reached with work items pending");
            }
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    for task in tasks {
        let _ = task.await;
    }

    info!("FleetHub gateway stopped");
    Ok(())
}
