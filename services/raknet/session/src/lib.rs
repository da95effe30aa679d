//! UDP sockets, session table, handshake, reliability, ordering and fragmentation for RakNet.
//!
//! This crate turns the packet codecs of `raknet-wire` into a working
//! transport: a server that accepts many peers over one UDP socket, and a
//! client connector for the other side.
//!
//! ## Features
//!
//! - **Offline handshake**: unconnected ping/pong and MTU negotiation
//! - **Session state machine**: sans-IO, driven by inbound datagrams and ticks
//! - **Reliability**: ACK/NAK, recovery buffer with NAK and timeout resends
//! - **Ordering**: receive window, per-channel ordering and sequencing
//! - **Fragmentation**: split and reassembly with stale-set eviction
//! - **Priority queues**: Immediate/High/Medium/Low flush schedule
//!
//! ## Example
//!
//! ```rust,no_run
//! use raknet_session::{RakServer, ServerConfig, SessionEvent, Priority};
//! use raknet_wire::Reliability;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ServerConfig {
//!     bind_addr: "0.0.0.0:19132".parse()?,
//!     motd: "My server".into(),
//!     ..ServerConfig::default()
//! };
//! let (server, mut events) = RakServer::bind(config).await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::Connected { peer, client_id } => {
//!             println!("Connected: {} ({})", peer, client_id);
//!         }
//!         SessionEvent::MessageReceived { peer, payload } => {
//!             server
//!                 .send(peer, payload, Reliability::ReliableOrdered, Priority::Medium, 0)
//!                 .await?;
//!         }
//!         SessionEvent::Disconnected { peer, reason } => {
//!             println!("Disconnected: {} ({})", peer, reason);
//!         }
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod fragment;
pub mod handshake;
pub mod keepalive;
pub mod manager;
pub mod ordering;
pub mod queue;
pub mod receive_window;
pub mod recovery;
pub mod server;
pub mod session;
pub mod transport;

// Re-export main types
pub use client::{ping, ClientConfig, RakClient};
pub use config::{ServerConfig, DEFAULT_PORT};
pub use error::{FragmentError, SessionError};
pub use fragment::FragmentAssembler;
pub use handshake::{OfflineHandshake, OfflineOutcome};
pub use manager::SessionManager;
pub use queue::Priority;
pub use receive_window::{ReceiveWindow, Submit};
pub use recovery::RecoveryBuffer;
pub use server::RakServer;
pub use session::{
    DisconnectReason, Role, Session, SessionConfig, SessionEvent, SessionState, SessionStats,
};
pub use transport::{bind_udp, DatagramSocket};
