//! RakNet server node binary.
//!
//! Binds a UDP socket, accepts RakNet sessions and logs their lifecycle.
//! With `--echo` every application message is sent back to its sender.

use bytes::Bytes;
use clap::Parser;
use raknet_session::{Priority, RakServer, SessionEvent};
use raknet_wire::Reliability;
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::NodeConfig;
use logging::RakLogFormatter;

/// RakNet reliable UDP server
#[derive(Parser, Debug)]
#[command(name = "raknet", version, about = "RakNet reliable UDP server")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// UDP bind address, e.g. 0.0.0.0:19132
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Status string returned to unconnected pings
    #[arg(long)]
    motd: Option<String>,

    /// Highest negotiable MTU
    #[arg(long)]
    max_mtu: Option<u16>,

    /// Session inactivity timeout, e.g. 10s
    #[arg(long)]
    timeout: Option<humantime::Duration>,

    /// Session tick period, e.g. 50ms
    #[arg(long)]
    tick_interval: Option<humantime::Duration>,

    /// Log level for RakNet crates
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Send every received message back to its sender
    #[arg(long)]
    echo: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("raknet={}", args.log_level).parse()?)
        .add_directive(format!("raknet_session={}", args.log_level).parse()?)
        .add_directive(format!("raknet_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(RakLogFormatter::new("raknet"))
        .init();

    info!("Starting RakNet server v{}", env!("CARGO_PKG_VERSION"));

    let node_config = NodeConfig::load_from_file(&args.config);
    let mut config = node_config.to_server_config()?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(motd) = args.motd.clone() {
        config.motd = motd;
    }
    if let Some(max_mtu) = args.max_mtu {
        config.max_mtu = max_mtu;
    }
    if let Some(timeout) = args.timeout {
        config.timeout = Duration::from(timeout);
    }
    if let Some(tick_interval) = args.tick_interval {
        config.tick_interval = Duration::from(tick_interval);
    }

    info!(
        "Server config: bind={}, server_id={}, mtu={}..={}, tick={:?}, timeout={:?}",
        config.bind_addr,
        config.server_id,
        config.min_mtu,
        config.max_mtu,
        config.tick_interval,
        config.timeout
    );

    let (server, mut events) = RakServer::bind(config).await?;
    component_info!("server", "Listening on {}", server.local_addr());

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;

    loop {
        #[cfg(unix)]
        let terminate = sigterm.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = terminate => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(event) => handle_event(&server, event, args.echo).await,
                None => {
                    warn!("Event channel closed");
                    break;
                }
            }
        }
    }

    server.shutdown().await;
    info!("RakNet server stopped");
    Ok(())
}

async fn handle_event(server: &RakServer, event: SessionEvent, echo: bool) {
    match event {
        SessionEvent::Connected { peer, client_id } => {
            component_info!("session", "Peer connected: peer={}, client_id={}", peer, client_id);
        }
        SessionEvent::Disconnected { peer, reason } => {
            component_info!("session", "Peer disconnected: peer={}, reason={}", peer, reason);
        }
        SessionEvent::Pong { peer, rtt } => {
            component_debug!("session", "Pong: peer={}, rtt={:?}", peer, rtt);
        }
        SessionEvent::MessageReceived { peer, payload } => {
            debug!("Message received: peer={}, len={}", peer, payload.len());
            if echo {
                echo_back(server, peer, payload).await;
            }
        }
        SessionEvent::RawPacket { peer, payload } => {
            debug!(
                "Raw packet: peer={}, id={:#04x}, len={}",
                peer,
                payload.first().copied().unwrap_or_default(),
                payload.len()
            );
        }
    }
}

async fn echo_back(server: &RakServer, peer: SocketAddr, payload: Bytes) {
    if let Err(e) = server
        .send(peer, payload, Reliability::ReliableOrdered, Priority::Medium, 0)
        .await
    {
        component_warn!("echo", "Failed to echo message: peer={}, error={}", peer, e);
    }
}
