//! Offline handshake: discovery pings and MTU negotiation.
//!
//! These packets arrive before a session exists and are answered without
//! touching any session state. An open connection request 1 leaves a pending
//! entry recording the proposed MTU; request 2 consumes it and asks the
//! manager to create the session.

use crate::config::ServerConfig;
use crate::session::SessionState;
use bytes::Bytes;
use dashmap::DashMap;
use raknet_wire::{
    OpenConnectionReply1, OpenConnectionReply2, Packet, UnconnectedPong,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// What to do with an offline packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfflineOutcome {
    /// Send this reply and keep no state
    Reply(Bytes),
    /// Create a session with the negotiated MTU, then send the reply
    Open {
        /// Negotiated MTU
        mtu: u16,
        /// Identifier supplied by the client
        client_id: u64,
        /// Encoded open connection reply 2
        reply: Bytes,
    },
    /// Not a request the server answers
    Ignore,
}

#[derive(Debug, Clone, Copy)]
struct PendingHandshake {
    mtu: u16,
    started: Instant,
}

/// Server side of the offline handshake
#[derive(Debug)]
pub struct OfflineHandshake {
    config: Arc<ServerConfig>,
    pending: DashMap<SocketAddr, PendingHandshake>,
}

impl OfflineHandshake {
    /// Create a handler with no pending handshakes
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            config,
            pending: DashMap::new(),
        }
    }

    /// Answer one offline packet from `peer`
    pub fn handle(&self, packet: Packet, peer: SocketAddr, now: Instant) -> OfflineOutcome {
        match packet {
            Packet::UnconnectedPing(ping) => {
                debug!("Sent UnconnectedPong: peer={}", peer);
                OfflineOutcome::Reply(
                    Packet::UnconnectedPong(UnconnectedPong {
                        ping_time: ping.ping_time,
                        server_id: self.config.server_id as i64,
                        status: self.config.motd.clone(),
                    })
                    .to_bytes(),
                )
            }
            Packet::OpenConnectionRequest1(request) => {
                let mtu = self.config.clamp_mtu(request.mtu);
                self.pending.insert(peer, PendingHandshake { mtu, started: now });
                debug!(
                    "Sent OpenConnectionReply1: peer={}, protocol={}, requested_mtu={}, mtu={}",
                    peer, request.protocol, request.mtu, mtu
                );
                OfflineOutcome::Reply(
                    Packet::OpenConnectionReply1(OpenConnectionReply1 {
                        server_id: self.config.server_id as i64,
                        security: self.config.security,
                        mtu,
                    })
                    .to_bytes(),
                )
            }
            Packet::OpenConnectionRequest2(request) => {
                let mut mtu = self.config.clamp_mtu(request.mtu);
                match self.pending.remove(&peer) {
                    Some((_, pending)) => mtu = mtu.min(pending.mtu),
                    None => debug!("OpenConnectionRequest2 without request 1: peer={}", peer),
                }
                let reply = Packet::OpenConnectionReply2(OpenConnectionReply2 {
                    server_id: self.config.server_id as i64,
                    client_address: peer,
                    mtu,
                    encryption: self.config.encryption,
                })
                .to_bytes();
                OfflineOutcome::Open {
                    mtu,
                    client_id: request.client_id as u64,
                    reply,
                }
            }
            other => {
                debug!("Ignoring offline {:?}: peer={}", other.id(), peer);
                OfflineOutcome::Ignore
            }
        }
    }

    /// Handshake state of an address without a session
    pub fn state(&self, peer: &SocketAddr) -> SessionState {
        if self.pending.contains_key(peer) {
            SessionState::MtuDiscovering
        } else {
            SessionState::Unseen
        }
    }

    /// Forget pending handshakes older than the configured expiry
    pub fn expire(&self, now: Instant) -> usize {
        let before = self.pending.len();
        let expiry = self.config.handshake_expiry;
        self.pending
            .retain(|_, p| now.saturating_duration_since(p.started) < expiry);
        before - self.pending.len()
    }

    /// Number of pending handshakes
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raknet_wire::{OpenConnectionRequest1, OpenConnectionRequest2, UnconnectedPing};
    use std::time::Duration;

    fn handshake() -> OfflineHandshake {
        OfflineHandshake::new(Arc::new(ServerConfig {
            server_id: 4242,
            motd: "MCPE;test".into(),
            ..ServerConfig::default()
        }))
    }

    fn peer() -> SocketAddr {
        "10.1.1.1:40000".parse().unwrap()
    }

    fn decode(bytes: &Bytes) -> Packet {
        Packet::decode(&mut bytes.clone()).unwrap()
    }

    #[test]
    fn test_ping_pong() {
        let outcome = handshake().handle(
            Packet::UnconnectedPing(UnconnectedPing { ping_time: 99 }),
            peer(),
            Instant::now(),
        );
        let OfflineOutcome::Reply(reply) = outcome else {
            panic!("expected reply");
        };
        assert_eq!(
            decode(&reply),
            Packet::UnconnectedPong(UnconnectedPong {
                ping_time: 99,
                server_id: 4242,
                status: "MCPE;test".into()
            })
        );
    }

    #[test]
    fn test_mtu_negotiation() {
        let handshake = handshake();
        let now = Instant::now();
        let OfflineOutcome::Reply(reply) = handshake.handle(
            Packet::OpenConnectionRequest1(OpenConnectionRequest1 {
                protocol: 10,
                mtu: 1400,
            }),
            peer(),
            now,
        ) else {
            panic!("expected reply");
        };
        assert!(matches!(
            decode(&reply),
            Packet::OpenConnectionReply1(OpenConnectionReply1 { mtu: 1400, .. })
        ));
        assert_eq!(handshake.state(&peer()), SessionState::MtuDiscovering);

        // Request 2 may not raise the MTU agreed in request 1
        let outcome = handshake.handle(
            Packet::OpenConnectionRequest2(OpenConnectionRequest2 {
                server_address: "10.0.0.1:19132".parse().unwrap(),
                mtu: 1492,
                client_id: 7,
            }),
            peer(),
            now,
        );
        let OfflineOutcome::Open {
            mtu,
            client_id,
            reply,
        } = outcome
        else {
            panic!("expected open");
        };
        assert_eq!((mtu, client_id), (1400, 7));
        assert!(matches!(
            decode(&reply),
            Packet::OpenConnectionReply2(OpenConnectionReply2 { mtu: 1400, .. })
        ));
        assert_eq!(handshake.state(&peer()), SessionState::Unseen);
    }

    #[test]
    fn test_mtu_is_clamped() {
        let handshake = handshake();
        let OfflineOutcome::Reply(reply) = handshake.handle(
            Packet::OpenConnectionRequest1(OpenConnectionRequest1 {
                protocol: 10,
                mtu: 200,
            }),
            peer(),
            Instant::now(),
        ) else {
            panic!("expected reply");
        };
        assert!(matches!(
            decode(&reply),
            Packet::OpenConnectionReply1(OpenConnectionReply1 { mtu: 400, .. })
        ));
    }

    #[test]
    fn test_pending_expiry() {
        let handshake = handshake();
        let now = Instant::now();
        handshake.handle(
            Packet::OpenConnectionRequest1(OpenConnectionRequest1 {
                protocol: 10,
                mtu: 576,
            }),
            peer(),
            now,
        );
        assert_eq!(handshake.expire(now + Duration::from_secs(1)), 0);
        assert_eq!(handshake.expire(now + Duration::from_secs(11)), 1);
        assert_eq!(handshake.pending(), 0);
    }

    #[test]
    fn test_other_offline_packets_ignored() {
        let outcome = handshake().handle(Packet::DisconnectNotification, peer(), Instant::now());
        assert_eq!(outcome, OfflineOutcome::Ignore);
    }
}
