//! Client connector.
//!
//! [`RakClient`] drives the offline handshake from the connecting side,
//! probing descending MTU candidates with open connection request 1 until the
//! server answers, then opens a client-role [`Session`] and completes the
//! online handshake over it. After that the same reader/ticker split as the
//! server keeps the session alive.

use crate::error::SessionError;
use crate::keepalive::millis_at;
use crate::queue::Priority;
use crate::session::{Role, Session, SessionConfig, SessionEvent, SessionState, SessionStats};
use crate::transport::{bind_udp, deliver, ephemeral_for, DatagramSocket, RECV_BUFFER_SIZE};
use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use raknet_wire::{
    OpenConnectionReply1, OpenConnectionReply2, OpenConnectionRequest1, OpenConnectionRequest2,
    Packet, Reliability, UnconnectedPing, UnconnectedPong, RAKNET_PROTOCOL_VERSION,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout_at, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for an outbound connection
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Identifier sent in open connection request 2 and the connection request
    pub client_id: u64,
    /// Protocol version sent in open connection request 1
    pub protocol: u8,
    /// MTU sizes probed in order
    pub mtu_candidates: Vec<u16>,
    /// Requests sent per MTU candidate and for request 2
    pub attempts: u32,
    /// Wait for each offline reply
    pub reply_timeout: Duration,
    /// Wait for the online handshake to complete
    pub connect_timeout: Duration,
    /// Session tick period
    pub tick_interval: Duration,
    /// Per-session settings; `local_id` is replaced by `client_id`
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: rand::random(),
            protocol: RAKNET_PROTOCOL_VERSION,
            mtu_candidates: vec![1492, 1200, 576],
            attempts: 4,
            reply_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(50),
            session: SessionConfig::default(),
        }
    }
}

/// Query a server's status string without connecting
pub async fn ping(server: SocketAddr, wait: Duration) -> anyhow::Result<UnconnectedPong> {
    let socket = bind_udp(ephemeral_for(&server)).await?;
    let request = Packet::UnconnectedPing(UnconnectedPing {
        ping_time: millis_at(Instant::now()) as i64,
    });
    socket.send_to(&request.to_bytes(), server).await?;
    match await_reply(&socket, server, wait, |packet| match packet {
        Packet::UnconnectedPong(pong) => Some(pong),
        _ => None,
    })
    .await?
    {
        Some(pong) => Ok(pong),
        None => bail!("No pong from {} within {:?}", server, wait),
    }
}

/// Wait until `server` sends a packet `pick` accepts, or the wait elapses
async fn await_reply<T>(
    socket: &dyn DatagramSocket,
    server: SocketAddr,
    wait: Duration,
    pick: impl Fn(Packet) -> Option<T>,
) -> anyhow::Result<Option<T>> {
    let deadline = tokio::time::Instant::now() + wait;
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let (n, from) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(received) => received.context("Failed to receive offline reply")?,
            Err(_) => return Ok(None),
        };
        if from != server {
            continue;
        }
        let mut bytes = Bytes::copy_from_slice(&buf[..n]);
        match Packet::decode(&mut bytes) {
            Ok(packet) => {
                if let Some(found) = pick(packet) {
                    return Ok(Some(found));
                }
            }
            Err(e) => debug!("Ignoring undecodable reply: peer={}, error={}", from, e),
        }
    }
}

/// A connection to a RakNet server
pub struct RakClient {
    server: SocketAddr,
    local_addr: SocketAddr,
    server_id: u64,
    socket: Arc<dyn DatagramSocket>,
    session: Arc<Mutex<Session>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    backlog: VecDeque<SessionEvent>,
    tick_interval: Duration,
    closing_drain_ticks: u32,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for RakClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RakClient")
            .field("server", &self.server)
            .field("local_addr", &self.local_addr)
            .field("server_id", &self.server_id)
            .finish()
    }
}

impl RakClient {
    /// Connect with default settings
    pub async fn connect(server: SocketAddr) -> anyhow::Result<Self> {
        Self::connect_with(server, ClientConfig::default()).await
    }

    /// Bind an ephemeral socket and connect
    pub async fn connect_with(server: SocketAddr, config: ClientConfig) -> anyhow::Result<Self> {
        let socket = bind_udp(ephemeral_for(&server))
            .await
            .context("Failed to bind client socket")?;
        Self::connect_on(Arc::new(socket), server, config).await
    }

    /// Connect over an already bound socket
    pub async fn connect_on(
        socket: Arc<dyn DatagramSocket>,
        server: SocketAddr,
        config: ClientConfig,
    ) -> anyhow::Result<Self> {
        let local_addr = socket.local_addr()?;
        info!("Connecting to RakNet server: server={}, local={}", server, local_addr);

        let (server_id, probed_mtu) = Self::probe_mtu(socket.as_ref(), server, &config).await?;
        let mtu = Self::open(socket.as_ref(), server, probed_mtu, &config).await?;
        info!("Offline handshake complete: server={}, server_id={}, mtu={}", server, server_id, mtu);

        let now = Instant::now();
        let session_config = SessionConfig {
            local_id: config.client_id,
            ..config.session.clone()
        };
        let mut session = Session::new(server, Role::Client, mtu, server_id, session_config, now);
        session.request_connection(now)?;
        let outbox = session.drain_outbox();

        let (event_tx, events) = mpsc::unbounded_channel();
        deliver(socket.as_ref(), server, outbox, Vec::new(), &event_tx).await;

        let session = Arc::new(Mutex::new(session));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            Self::spawn_reader(socket.clone(), server, session.clone(), event_tx.clone(), shutdown_rx.clone()),
            Self::spawn_ticker(
                socket.clone(),
                server,
                session.clone(),
                event_tx.clone(),
                config.tick_interval,
                shutdown_rx,
            ),
        ];

        let mut client = Self {
            server,
            local_addr,
            server_id,
            socket,
            session,
            event_tx,
            events,
            backlog: VecDeque::new(),
            tick_interval: config.tick_interval,
            closing_drain_ticks: config.session.closing_drain_ticks,
            shutdown_tx,
            tasks,
        };
        match client.await_connected(config.connect_timeout).await {
            Ok(()) => Ok(client),
            Err(e) => {
                client.stop().await;
                Err(e)
            }
        }
    }

    async fn probe_mtu(
        socket: &dyn DatagramSocket,
        server: SocketAddr,
        config: &ClientConfig,
    ) -> anyhow::Result<(u64, u16)> {
        for &mtu in &config.mtu_candidates {
            let request = Packet::OpenConnectionRequest1(OpenConnectionRequest1 {
                protocol: config.protocol,
                mtu,
            })
            .to_bytes();
            for attempt in 1..=config.attempts {
                debug!("Sent OpenConnectionRequest1: server={}, mtu={}, attempt={}", server, mtu, attempt);
                if let Err(e) = socket.send_to(&request, server).await {
                    // Oversized datagrams may be refused locally; try the next size
                    debug!("Failed to send request 1: mtu={}, error={}", mtu, e);
                    break;
                }
                let reply = await_reply(socket, server, config.reply_timeout, |packet| match packet {
                    Packet::OpenConnectionReply1(reply) => Some(reply),
                    _ => None,
                })
                .await?;
                if let Some(OpenConnectionReply1 { server_id, mtu, .. }) = reply {
                    return Ok((server_id as u64, mtu));
                }
            }
        }
        bail!("No open connection reply 1 from {}", server)
    }

    async fn open(
        socket: &dyn DatagramSocket,
        server: SocketAddr,
        mtu: u16,
        config: &ClientConfig,
    ) -> anyhow::Result<u16> {
        let request = Packet::OpenConnectionRequest2(OpenConnectionRequest2 {
            server_address: server,
            mtu,
            client_id: config.client_id as i64,
        })
        .to_bytes();
        for attempt in 1..=config.attempts {
            debug!("Sent OpenConnectionRequest2: server={}, mtu={}, attempt={}", server, mtu, attempt);
            socket.send_to(&request, server).await?;
            let reply = await_reply(socket, server, config.reply_timeout, |packet| match packet {
                Packet::OpenConnectionReply2(reply) => Some(reply),
                _ => None,
            })
            .await?;
            if let Some(OpenConnectionReply2 { mtu, .. }) = reply {
                return Ok(mtu);
            }
        }
        bail!("No open connection reply 2 from {}", server)
    }

    fn spawn_reader(
        socket: Arc<dyn DatagramSocket>,
        server: SocketAddr,
        session: Arc<Mutex<Session>>,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((n, from)) if from == server => {
                            let bytes = Bytes::copy_from_slice(&buf[..n]);
                            let (outbox, events) = {
                                let mut session = session.lock().await;
                                session.handle_datagram(bytes, Instant::now());
                                (session.drain_outbox(), session.drain_events())
                            };
                            deliver(socket.as_ref(), server, outbox, events, &event_tx).await;
                        }
                        Ok((_, from)) => debug!("Ignoring datagram from unexpected peer: peer={}", from),
                        Err(e) => debug!("UDP receive error: {}", e),
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }

    fn spawn_ticker(
        socket: Arc<dyn DatagramSocket>,
        server: SocketAddr,
        session: Arc<Mutex<Session>>,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
        tick_interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticks = interval(tick_interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        let (outbox, events, gone) = {
                            let mut session = session.lock().await;
                            session.tick(Instant::now());
                            (
                                session.drain_outbox(),
                                session.drain_events(),
                                session.state() == SessionState::Gone,
                            )
                        };
                        deliver(socket.as_ref(), server, outbox, events, &event_tx).await;
                        if gone {
                            break;
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }

    async fn await_connected(&mut self, wait: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let event = timeout_at(deadline, self.events.recv())
                .await
                .map_err(|_| anyhow!("Timed out connecting to {}", self.server))?
                .ok_or_else(|| anyhow!("Session with {} ended", self.server))?;
            match event {
                SessionEvent::Connected { .. } => return Ok(()),
                SessionEvent::Disconnected { reason, .. } => {
                    bail!("Disconnected from {} during handshake: {}", self.server, reason)
                }
                other => self.backlog.push_back(other),
            }
        }
    }

    /// Server address
    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// Local socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Identifier the server advertised
    pub fn server_id(&self) -> u64 {
        self.server_id
    }

    /// Negotiated MTU
    pub async fn mtu(&self) -> u16 {
        self.session.lock().await.mtu()
    }

    /// Whether the session is still connected
    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_connected()
    }

    /// Latest round-trip time measured by connected pings
    pub async fn rtt(&self) -> Option<Duration> {
        self.session.lock().await.rtt()
    }

    /// Session counters
    pub async fn stats(&self) -> SessionStats {
        self.session.lock().await.stats().clone()
    }

    /// Send an application payload to the server
    pub async fn send(
        &self,
        payload: Bytes,
        reliability: Reliability,
        priority: Priority,
        channel: u8,
    ) -> Result<(), SessionError> {
        let outbox = {
            let mut session = self.session.lock().await;
            session.send(payload, reliability, priority, channel, Instant::now())?;
            session.drain_outbox()
        };
        deliver(self.socket.as_ref(), self.server, outbox, Vec::new(), &self.event_tx).await;
        Ok(())
    }

    /// Next session event
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        self.events.recv().await
    }

    /// Next application payload; `None` once the session has ended
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.next_event().await? {
                SessionEvent::MessageReceived { payload, .. } => return Some(payload),
                SessionEvent::Disconnected { reason, .. } => {
                    info!("Disconnected from server: server={}, reason={}", self.server, reason);
                    return None;
                }
                _ => {}
            }
        }
    }

    /// Notify the server, wait for the close to drain, then stop
    pub async fn disconnect(mut self) -> Result<(), SessionError> {
        let outbox = {
            let mut session = self.session.lock().await;
            session.disconnect(Instant::now())?;
            session.drain_outbox()
        };
        deliver(self.socket.as_ref(), self.server, outbox, Vec::new(), &self.event_tx).await;

        let wait = self.tick_interval * (self.closing_drain_ticks + 1);
        let finished = tokio::time::timeout(wait, async {
            while let Some(event) = self.events.recv().await {
                if matches!(event, SessionEvent::Disconnected { .. }) {
                    break;
                }
            }
        })
        .await;
        if finished.is_err() {
            warn!("Close did not drain in time: server={}", self.server);
        }
        self.stop().await;
        Ok(())
    }

    async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}
