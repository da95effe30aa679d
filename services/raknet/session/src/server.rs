//! Server runtime: one socket reader task and one ticker task.

use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::manager::SessionManager;
use crate::queue::Priority;
use crate::session::SessionEvent;
use crate::transport::{bind_udp, DatagramSocket, RECV_BUFFER_SIZE};
use anyhow::Context;
use bytes::Bytes;
use raknet_wire::Reliability;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// A running RakNet server
#[derive(Debug)]
pub struct RakServer {
    manager: Arc<SessionManager>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RakServer {
    /// Bind the configured address and start serving
    pub async fn bind(
        config: ServerConfig,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let socket = bind_udp(config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind UDP socket on {}", config.bind_addr))?;
        Self::start(Arc::new(socket), config)
    }

    /// Start serving on an already bound socket
    pub fn start(
        socket: Arc<dyn DatagramSocket>,
        config: ServerConfig,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let local_addr = socket.local_addr().context("Failed to read local address")?;
        let tick_interval = config.tick_interval;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(SessionManager::new(Arc::new(config), socket.clone(), event_tx));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            "RakNet server listening: addr={}, server_id={}",
            local_addr,
            manager.config().server_id
        );

        let reader = {
            let manager = manager.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; RECV_BUFFER_SIZE];
                loop {
                    tokio::select! {
                        received = socket.recv_from(&mut buf) => match received {
                            Ok((n, peer)) => {
                                let bytes = Bytes::copy_from_slice(&buf[..n]);
                                manager.handle_packet(bytes, peer, Instant::now()).await;
                            }
                            Err(e) => {
                                // ICMP unreachable surfaces as a recv error on some platforms
                                debug!("UDP receive error: {}", e);
                            }
                        },
                        _ = shutdown_rx.changed() => break,
                    }
                }
                debug!("Socket reader stopped");
            })
        };

        let ticker = {
            let manager = manager.clone();
            let mut shutdown_rx = shutdown_rx;
            tokio::spawn(async move {
                let mut ticks = interval(tick_interval);
                ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticks.tick() => manager.tick(Instant::now()).await,
                        _ = shutdown_rx.changed() => break,
                    }
                }
                debug!("Session ticker stopped");
            })
        };

        Ok((
            Self {
                manager,
                local_addr,
                shutdown_tx,
                tasks: vec![reader, ticker],
            },
            event_rx,
        ))
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Session table
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Send an application payload to a connected peer
    pub async fn send(
        &self,
        peer: SocketAddr,
        payload: Bytes,
        reliability: Reliability,
        priority: Priority,
        channel: u8,
    ) -> Result<(), SessionError> {
        self.manager
            .send(peer, payload, reliability, priority, channel, Instant::now())
            .await
    }

    /// Disconnect one peer
    pub async fn disconnect(&self, peer: SocketAddr) -> Result<(), SessionError> {
        self.manager.disconnect(peer, Instant::now()).await
    }

    /// Notify every peer, stop both tasks and wait for them
    pub async fn shutdown(self) {
        info!(
            "Shutting down RakNet server: addr={}, sessions={}",
            self.local_addr,
            self.manager.session_count()
        );
        self.manager.disconnect_all(Instant::now()).await;
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Server task failed: {}", e);
            }
        }
    }
}
