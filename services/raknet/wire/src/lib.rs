//! RakNet wire protocol: framing and encoding/decoding of every packet kind.
//!
//! This crate is pure and synchronous. It knows nothing about sessions or
//! sockets; it only turns bytes into typed packets and back.
//!
//! ## Layers
//!
//! - **Binary codec** ([`binary`]): checked big/little-endian reads, triads,
//!   strings and system addresses over `bytes` buffers
//! - **Frames** ([`frame`]): encapsulated messages with reliability metadata
//!   and optional split header
//! - **Datagrams** ([`datagram`]): flag byte, sequence triad and frames
//! - **Acknowledgements** ([`ack`]): ACK/NAK with interval compression
//! - **Control packets** ([`packets`]): offline handshake and online control
//!   messages as one closed enum
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u8 flags             | 0x80 valid, 0x40 ack, ...  |
//! +----------------------+----------------------------+
//! | u24le sequence       | per-direction counter      |
//! +----------------------+----------------------------+
//! | frame...             | until end of datagram      |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ack;
pub mod binary;
pub mod datagram;
pub mod error;
pub mod frame;
pub mod packets;
pub mod reliability;

// Re-export main types
pub use ack::{AckKind, AckPacket, AckRecord, MAX_ACK_ENTRIES, MAX_RANGE_ENTRIES};
pub use binary::{BufExt, BufMutExt, MAGIC};
pub use datagram::{
    Datagram, DatagramFlags, DatagramKind, DATAGRAM_HEADER_SIZE, DATAGRAM_OVERHEAD, MAX_SEQUENCE,
};
pub use error::WireError;
pub use frame::{Frame, OrderInfo, SplitInfo, MAX_FRAME_PAYLOAD};
pub use packets::{
    has_magic, ConnectedPing, ConnectedPong, ConnectionAccept, ConnectionRequest,
    NewIncomingConnection, OpenConnectionReply1, OpenConnectionReply2, OpenConnectionRequest1,
    OpenConnectionRequest2, Packet, PacketId, UnconnectedPing, UnconnectedPong,
};
pub use reliability::Reliability;

/// Lowest MTU a session may negotiate
pub const MINIMUM_MTU: u16 = 400;

/// Highest MTU a session may negotiate
pub const MAXIMUM_MTU: u16 = 1492;

/// RakNet protocol version advertised by the client connector
pub const RAKNET_PROTOCOL_VERSION: u8 = 10;
