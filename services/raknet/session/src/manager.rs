//! Session table and inbound dispatch.
//!
//! The [`SessionManager`] owns every [`Session`] keyed by peer address,
//! routes each inbound UDP payload to its session or to the offline
//! handshake, and drives all sessions from the tick path. The table is a
//! `DashMap`; each session sits behind its own mutex so the reader and the
//! ticker serialize per session without blocking each other across peers.

use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::handshake::{OfflineHandshake, OfflineOutcome};
use crate::queue::Priority;
use crate::session::{Role, Session, SessionEvent, SessionState, SessionStats};
use crate::transport::{deliver, DatagramSocket};
use bytes::Bytes;
use dashmap::DashMap;
use raknet_wire::{has_magic, DatagramKind, Packet, Reliability, WireError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};

type SharedSession = Arc<Mutex<Session>>;

/// Owns the session table and the offline handshake
pub struct SessionManager {
    config: Arc<ServerConfig>,
    socket: Arc<dyn DatagramSocket>,
    sessions: DashMap<SocketAddr, SharedSession>,
    handshake: OfflineHandshake,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .field("pending_handshakes", &self.handshake.pending())
            .finish()
    }
}

impl SessionManager {
    /// Create a manager writing through `socket` and emitting on `event_tx`
    pub fn new(
        config: Arc<ServerConfig>,
        socket: Arc<dyn DatagramSocket>,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            handshake: OfflineHandshake::new(config.clone()),
            config,
            socket,
            sessions: DashMap::new(),
            event_tx,
        }
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Socket the manager writes to
    pub fn socket(&self) -> &Arc<dyn DatagramSocket> {
        &self.socket
    }

    fn session(&self, peer: &SocketAddr) -> Option<SharedSession> {
        // Clone the handle so no table guard is held across an await
        self.sessions.get(peer).map(|entry| entry.value().clone())
    }

    /// Dispatch one UDP payload received from `peer`
    pub async fn handle_packet(&self, bytes: Bytes, peer: SocketAddr, now: Instant) {
        let Some(&first) = bytes.first() else {
            return;
        };
        let kind = DatagramKind::classify(first);

        if let Some(session) = self.session(&peer) {
            if kind == DatagramKind::Offline {
                self.handle_offline_for_session(&session, bytes, peer, now).await;
            } else {
                let (outbox, events) = {
                    let mut session = session.lock().await;
                    session.handle_datagram(bytes, now);
                    (session.drain_outbox(), session.drain_events())
                };
                deliver(self.socket.as_ref(), peer, outbox, events, &self.event_tx).await;
            }
            return;
        }

        if kind != DatagramKind::Offline {
            trace!("Dropping framed packet without session: peer={}", peer);
            return;
        }

        if !has_magic(&bytes) {
            self.forward_raw(bytes, peer);
            return;
        }
        match Packet::decode(&mut bytes.clone()) {
            Ok(packet) => self.handle_offline(packet, peer, now).await,
            Err(WireError::UnknownPacket(_)) => self.forward_raw(bytes, peer),
            Err(e) => debug!("Dropping malformed offline packet: peer={}, error={}", peer, e),
        }
    }

    /// Hand an unrecognized packet to the application
    fn forward_raw(&self, payload: Bytes, peer: SocketAddr) {
        debug!(
            "Forwarding raw packet: peer={}, id={:#04x}, len={}",
            peer,
            payload.first().copied().unwrap_or_default(),
            payload.len()
        );
        if self.event_tx.send(SessionEvent::RawPacket { peer, payload }).is_err() {
            debug!("Event receiver dropped: peer={}", peer);
        }
    }

    async fn handle_offline(&self, packet: Packet, peer: SocketAddr, now: Instant) {
        match self.handshake.handle(packet, peer, now) {
            OfflineOutcome::Reply(reply) => self.send_raw(&reply, peer).await,
            OfflineOutcome::Open {
                mtu,
                client_id,
                reply,
            } => {
                self.sessions.entry(peer).or_insert_with(|| {
                    info!(
                        "Session created: peer={}, mtu={}, client_id={}",
                        peer, mtu, client_id
                    );
                    let mut session = Session::new(
                        peer,
                        Role::Server,
                        mtu,
                        client_id,
                        self.config.session_config(),
                        now,
                    );
                    session.remember_open_reply(reply.clone());
                    Arc::new(Mutex::new(session))
                });
                debug!("Sent OpenConnectionReply2: peer={}, mtu={}", peer, mtu);
                self.send_raw(&reply, peer).await;
            }
            OfflineOutcome::Ignore => {}
        }
    }

    async fn handle_offline_for_session(
        &self,
        session: &SharedSession,
        bytes: Bytes,
        peer: SocketAddr,
        now: Instant,
    ) {
        let packet = match Packet::decode(&mut bytes.clone()) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping offline packet for session: peer={}, error={}", peer, e);
                return;
            }
        };
        // Discovery pings are answered regardless of session state
        if matches!(packet, Packet::UnconnectedPing(_)) {
            self.handle_offline(packet, peer, now).await;
            return;
        }
        let (outbox, events) = {
            let mut session = session.lock().await;
            session.handle_offline(&packet, now);
            (session.drain_outbox(), session.drain_events())
        };
        deliver(self.socket.as_ref(), peer, outbox, events, &self.event_tx).await;
    }

    async fn send_raw(&self, bytes: &[u8], peer: SocketAddr) {
        if let Err(e) = self.socket.send_to(bytes, peer).await {
            warn!("Failed to send offline reply: peer={}, error={}", peer, e);
        }
    }

    /// Tick every session in address order and remove finished ones
    pub async fn tick(&self, now: Instant) {
        for peer in self.peers() {
            let Some(session) = self.session(&peer) else {
                continue;
            };
            let (outbox, events, gone) = {
                let mut session = session.lock().await;
                session.tick(now);
                (
                    session.drain_outbox(),
                    session.drain_events(),
                    session.state() == SessionState::Gone,
                )
            };
            deliver(self.socket.as_ref(), peer, outbox, events, &self.event_tx).await;
            if gone {
                self.sessions.remove(&peer);
                debug!("Session removed: peer={}", peer);
            }
        }

        let expired = self.handshake.expire(now);
        if expired > 0 {
            debug!("Expired pending handshakes: count={}", expired);
        }
    }

    /// Queue an application payload for `peer`
    pub async fn send(
        &self,
        peer: SocketAddr,
        payload: Bytes,
        reliability: Reliability,
        priority: Priority,
        channel: u8,
        now: Instant,
    ) -> Result<(), SessionError> {
        let session = self.session(&peer).ok_or(SessionError::NotFound(peer))?;
        let outbox = {
            let mut session = session.lock().await;
            session.send(payload, reliability, priority, channel, now)?;
            session.drain_outbox()
        };
        deliver(self.socket.as_ref(), peer, outbox, Vec::new(), &self.event_tx).await;
        Ok(())
    }

    /// Send a disconnect notification to `peer` and start closing its session
    pub async fn disconnect(&self, peer: SocketAddr, now: Instant) -> Result<(), SessionError> {
        let session = self.session(&peer).ok_or(SessionError::NotFound(peer))?;
        let outbox = {
            let mut session = session.lock().await;
            session.disconnect(now)?;
            session.drain_outbox()
        };
        deliver(self.socket.as_ref(), peer, outbox, Vec::new(), &self.event_tx).await;
        Ok(())
    }

    /// Disconnect every open session
    pub async fn disconnect_all(&self, now: Instant) {
        for peer in self.peers() {
            match self.disconnect(peer, now).await {
                Ok(()) | Err(SessionError::Closed) | Err(SessionError::NotFound(_)) => {}
                Err(e) => warn!("Failed to disconnect: peer={}, error={}", peer, e),
            }
        }
    }

    /// Sessions in the table, in any state
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions that completed the online handshake
    pub async fn connected_count(&self) -> usize {
        let mut count = 0;
        for peer in self.peers() {
            if let Some(session) = self.session(&peer) {
                if session.lock().await.is_connected() {
                    count += 1;
                }
            }
        }
        count
    }

    /// Whether a session exists for `peer`
    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.sessions.contains_key(peer)
    }

    /// Lifecycle state of `peer`, including the pre-session handshake states
    pub async fn session_state(&self, peer: &SocketAddr) -> SessionState {
        match self.session(peer) {
            Some(session) => session.lock().await.state(),
            None => self.handshake.state(peer),
        }
    }

    /// Counters of the session for `peer`
    pub async fn stats(&self, peer: &SocketAddr) -> Option<SessionStats> {
        let session = self.session(peer)?;
        let stats = session.lock().await.stats().clone();
        Some(stats)
    }

    /// Addresses with a session, sorted
    pub fn peers(&self) -> Vec<SocketAddr> {
        let mut peers: Vec<SocketAddr> = self.sessions.iter().map(|entry| *entry.key()).collect();
        peers.sort();
        peers
    }
}
