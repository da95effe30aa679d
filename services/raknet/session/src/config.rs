//! Server configuration.

use crate::session::SessionConfig;
use raknet_wire::{MAXIMUM_MTU, MINIMUM_MTU};
use std::net::SocketAddr;
use std::time::Duration;

/// Default RakNet port
pub const DEFAULT_PORT: u16 = 19132;

/// Configuration for a RakNet server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address the UDP socket binds to
    pub bind_addr: SocketAddr,
    /// Server identifier advertised in offline replies
    pub server_id: u64,
    /// Status string returned in unconnected pongs
    pub motd: String,
    /// Security flag in open connection reply 1
    pub security: bool,
    /// Encryption flag in open connection reply 2
    pub encryption: bool,
    /// Lowest negotiable MTU
    pub min_mtu: u16,
    /// Highest negotiable MTU
    pub max_mtu: u16,
    /// Session tick period
    pub tick_interval: Duration,
    /// Inactivity after which a session is dropped
    pub timeout: Duration,
    /// Ticks between connected pings
    pub ping_interval_ticks: u64,
    /// Incomplete split sets kept per session
    pub max_split_sets: usize,
    /// Largest accepted split count
    pub max_split_parts: u32,
    /// Age after which an incomplete split set is evicted
    pub split_timeout: Duration,
    /// Ticks a closing session waits for acknowledgements
    pub closing_drain_ticks: u32,
    /// Receive window size in datagrams
    pub window_limit: u32,
    /// Age after which a half-finished offline handshake is forgotten
    pub handshake_expiry: Duration,
    /// Whether receive window gaps are NAKed every tick
    pub nak_gaps: bool,
    /// Age after which an unacknowledged datagram is resent
    pub resend_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            server_id: rand::random(),
            motd: "RakNet server".to_string(),
            security: false,
            encryption: false,
            min_mtu: MINIMUM_MTU,
            max_mtu: MAXIMUM_MTU,
            tick_interval: Duration::from_millis(50),
            timeout: session.timeout,
            ping_interval_ticks: session.ping_interval_ticks,
            max_split_sets: session.max_split_sets,
            max_split_parts: session.max_split_parts,
            split_timeout: session.split_timeout,
            closing_drain_ticks: session.closing_drain_ticks,
            window_limit: session.window_limit,
            handshake_expiry: Duration::from_secs(10),
            nak_gaps: session.nak_gaps,
            resend_timeout: session.resend_timeout,
        }
    }
}

impl ServerConfig {
    /// Per-session subset
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            local_id: self.server_id,
            timeout: self.timeout,
            ping_interval_ticks: self.ping_interval_ticks,
            max_split_sets: self.max_split_sets,
            max_split_parts: self.max_split_parts,
            split_timeout: self.split_timeout,
            closing_drain_ticks: self.closing_drain_ticks,
            window_limit: self.window_limit,
            nak_gaps: self.nak_gaps,
            resend_timeout: self.resend_timeout,
        }
    }

    /// Clamp a requested MTU into the configured bounds
    pub fn clamp_mtu(&self, mtu: u16) -> u16 {
        let min = self.min_mtu.min(self.max_mtu);
        mtu.clamp(min, self.max_mtu)
    }
}
