//! Offline handshake packets and online control packets.
//!
//! Every packet starts with a one-byte id. Decoding dispatches on that id into
//! the closed [`Packet`] enum, so an unhandled kind is a compile error rather
//! than a silent fallthrough.

use crate::binary::{unspecified_address, BufExt, BufMutExt, MAGIC};
use crate::error::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;

/// Number of system address slots in connection accept / new incoming
pub const SYSTEM_ADDRESS_SLOTS: usize = 20;

/// Bytes of an open connection request 1 before its padding (id + magic + protocol)
pub const OPEN_CONNECTION_REQUEST_1_HEADER: usize = 18;

/// Wire ids of the known packets
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketId {
    /// Online ping
    ConnectedPing = 0x00,
    /// Offline ping
    UnconnectedPing = 0x01,
    /// Online pong
    ConnectedPong = 0x03,
    /// MTU discovery request
    OpenConnectionRequest1 = 0x05,
    /// MTU discovery reply
    OpenConnectionReply1 = 0x06,
    /// Session creation request
    OpenConnectionRequest2 = 0x07,
    /// Session creation reply
    OpenConnectionReply2 = 0x08,
    /// First online request
    ConnectionRequest = 0x09,
    /// Reply to the connection request
    ConnectionAccept = 0x10,
    /// Client confirmation completing the handshake
    NewIncomingConnection = 0x13,
    /// Graceful close
    DisconnectNotification = 0x15,
    /// Offline pong with the status string
    UnconnectedPong = 0x1c,
}

impl TryFrom<u8> for PacketId {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => PacketId::ConnectedPing,
            0x01 => PacketId::UnconnectedPing,
            0x03 => PacketId::ConnectedPong,
            0x05 => PacketId::OpenConnectionRequest1,
            0x06 => PacketId::OpenConnectionReply1,
            0x07 => PacketId::OpenConnectionRequest2,
            0x08 => PacketId::OpenConnectionReply2,
            0x09 => PacketId::ConnectionRequest,
            0x10 => PacketId::ConnectionAccept,
            0x13 => PacketId::NewIncomingConnection,
            0x15 => PacketId::DisconnectNotification,
            0x1c => PacketId::UnconnectedPong,
            other => return Err(WireError::UnknownPacket(other)),
        })
    }
}

/// Whether a buffer carries the offline magic where handshake packets put it
///
/// Ping-style packets carry an 8-byte timestamp before the magic; the open
/// connection requests carry it straight after the id.
pub fn has_magic(buf: &[u8]) -> bool {
    [9usize, 1]
        .iter()
        .any(|&offset| buf.get(offset..offset + MAGIC.len()) == Some(&MAGIC[..]))
}

/// Offline discovery ping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconnectedPing {
    /// Sender timestamp, echoed back
    pub ping_time: i64,
}

/// Offline discovery pong
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnconnectedPong {
    /// Echoed ping timestamp
    pub ping_time: i64,
    /// Server identifier
    pub server_id: i64,
    /// Server status string (MOTD)
    pub status: String,
}

/// MTU discovery request; the MTU is the total encoded length
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionRequest1 {
    /// RakNet protocol version
    pub protocol: u8,
    /// Candidate MTU
    pub mtu: u16,
}

/// MTU discovery reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionReply1 {
    /// Server identifier
    pub server_id: i64,
    /// Security capability flag
    pub security: bool,
    /// Proposed MTU
    pub mtu: u16,
}

/// Session creation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionRequest2 {
    /// Address the client believes it is talking to
    pub server_address: SocketAddr,
    /// Final MTU
    pub mtu: u16,
    /// Client-chosen identifier
    pub client_id: i64,
}

/// Session creation reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenConnectionReply2 {
    /// Server identifier
    pub server_id: i64,
    /// Client address as seen by the server
    pub client_address: SocketAddr,
    /// Negotiated MTU
    pub mtu: u16,
    /// Encryption capability flag
    pub encryption: bool,
}

/// First online request, sent reliable ordered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Client identifier
    pub client_id: u64,
    /// Sender timestamp
    pub ping_time: u64,
}

/// Reply to [`ConnectionRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAccept {
    /// Client address as seen by the server
    pub client_address: SocketAddr,
    /// Index of the client in the server's system list
    pub system_index: u16,
    /// System address slots
    pub system_addresses: Vec<SocketAddr>,
    /// Echoed request timestamp
    pub ping_time: u64,
    /// Server timestamp
    pub pong_time: u64,
}

/// Client confirmation completing the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIncomingConnection {
    /// Server address as seen by the client
    pub server_address: SocketAddr,
    /// System address slots
    pub system_addresses: Vec<SocketAddr>,
    /// Echoed accept timestamp
    pub ping_time: u64,
    /// Client timestamp
    pub pong_time: u64,
}

/// Online latency probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPing {
    /// Sender timestamp
    pub ping_time: i64,
}

/// Online latency probe reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedPong {
    /// Echoed ping timestamp
    pub ping_time: i64,
    /// Responder timestamp
    pub pong_time: i64,
}

impl ConnectionAccept {
    /// Accept with all system address slots unspecified
    pub fn new(client_address: SocketAddr, ping_time: u64, pong_time: u64) -> Self {
        Self {
            client_address,
            system_index: 0,
            system_addresses: vec![unspecified_address(); SYSTEM_ADDRESS_SLOTS],
            ping_time,
            pong_time,
        }
    }
}

impl NewIncomingConnection {
    /// Confirmation with all system address slots unspecified
    pub fn new(server_address: SocketAddr, ping_time: u64, pong_time: u64) -> Self {
        Self {
            server_address,
            system_addresses: vec![unspecified_address(); SYSTEM_ADDRESS_SLOTS],
            ping_time,
            pong_time,
        }
    }
}

/// Every packet this crate understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// See [`UnconnectedPing`]
    UnconnectedPing(UnconnectedPing),
    /// See [`UnconnectedPong`]
    UnconnectedPong(UnconnectedPong),
    /// See [`OpenConnectionRequest1`]
    OpenConnectionRequest1(OpenConnectionRequest1),
    /// See [`OpenConnectionReply1`]
    OpenConnectionReply1(OpenConnectionReply1),
    /// See [`OpenConnectionRequest2`]
    OpenConnectionRequest2(OpenConnectionRequest2),
    /// See [`OpenConnectionReply2`]
    OpenConnectionReply2(OpenConnectionReply2),
    /// See [`ConnectionRequest`]
    ConnectionRequest(ConnectionRequest),
    /// See [`ConnectionAccept`]
    ConnectionAccept(ConnectionAccept),
    /// See [`NewIncomingConnection`]
    NewIncomingConnection(NewIncomingConnection),
    /// See [`ConnectedPing`]
    ConnectedPing(ConnectedPing),
    /// See [`ConnectedPong`]
    ConnectedPong(ConnectedPong),
    /// Graceful close, id only
    DisconnectNotification,
}

impl Packet {
    /// Wire id of this packet
    pub fn id(&self) -> PacketId {
        match self {
            Packet::UnconnectedPing(_) => PacketId::UnconnectedPing,
            Packet::UnconnectedPong(_) => PacketId::UnconnectedPong,
            Packet::OpenConnectionRequest1(_) => PacketId::OpenConnectionRequest1,
            Packet::OpenConnectionReply1(_) => PacketId::OpenConnectionReply1,
            Packet::OpenConnectionRequest2(_) => PacketId::OpenConnectionRequest2,
            Packet::OpenConnectionReply2(_) => PacketId::OpenConnectionReply2,
            Packet::ConnectionRequest(_) => PacketId::ConnectionRequest,
            Packet::ConnectionAccept(_) => PacketId::ConnectionAccept,
            Packet::NewIncomingConnection(_) => PacketId::NewIncomingConnection,
            Packet::ConnectedPing(_) => PacketId::ConnectedPing,
            Packet::ConnectedPong(_) => PacketId::ConnectedPong,
            Packet::DisconnectNotification => PacketId::DisconnectNotification,
        }
    }

    /// Encode the id and body
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.id() as u8);
        match self {
            Packet::UnconnectedPing(p) => {
                buf.put_i64(p.ping_time);
                buf.put_magic();
            }
            Packet::UnconnectedPong(p) => {
                buf.put_i64(p.ping_time);
                buf.put_i64(p.server_id);
                buf.put_magic();
                buf.put_string(&p.status);
            }
            Packet::OpenConnectionRequest1(p) => {
                buf.put_magic();
                buf.put_u8(p.protocol);
                let padding = (p.mtu as usize).saturating_sub(OPEN_CONNECTION_REQUEST_1_HEADER);
                buf.put_bytes(0, padding);
            }
            Packet::OpenConnectionReply1(p) => {
                buf.put_magic();
                buf.put_i64(p.server_id);
                buf.put_bool(p.security);
                buf.put_u16(p.mtu);
            }
            Packet::OpenConnectionRequest2(p) => {
                buf.put_magic();
                buf.put_address(&p.server_address);
                buf.put_u16(p.mtu);
                buf.put_i64(p.client_id);
            }
            Packet::OpenConnectionReply2(p) => {
                buf.put_magic();
                buf.put_i64(p.server_id);
                buf.put_address(&p.client_address);
                buf.put_u16(p.mtu);
                buf.put_bool(p.encryption);
            }
            Packet::ConnectionRequest(p) => {
                buf.put_u64(p.client_id);
                buf.put_u64(p.ping_time);
            }
            Packet::ConnectionAccept(p) => {
                buf.put_address(&p.client_address);
                buf.put_u16(p.system_index);
                put_system_addresses(buf, &p.system_addresses);
                buf.put_u64(p.ping_time);
                buf.put_u64(p.pong_time);
            }
            Packet::NewIncomingConnection(p) => {
                buf.put_address(&p.server_address);
                put_system_addresses(buf, &p.system_addresses);
                buf.put_u64(p.ping_time);
                buf.put_u64(p.pong_time);
            }
            Packet::ConnectedPing(p) => {
                buf.put_i64(p.ping_time);
            }
            Packet::ConnectedPong(p) => {
                buf.put_i64(p.ping_time);
                buf.put_i64(p.pong_time);
            }
            Packet::DisconnectNotification => {}
        }
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one packet, dispatching on the leading id.
    ///
    /// Trailing bytes after the known fields are ignored so that peers
    /// appending newer fields still interoperate.
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let total = buf.len();
        let id = PacketId::try_from(buf.read_u8()?)?;

        let packet = match id {
            PacketId::UnconnectedPing => {
                let ping_time = buf.read_i64()?;
                buf.read_magic()?;
                Packet::UnconnectedPing(UnconnectedPing { ping_time })
            }
            PacketId::UnconnectedPong => {
                let ping_time = buf.read_i64()?;
                let server_id = buf.read_i64()?;
                buf.read_magic()?;
                let status = buf.read_string()?;
                Packet::UnconnectedPong(UnconnectedPong {
                    ping_time,
                    server_id,
                    status,
                })
            }
            PacketId::OpenConnectionRequest1 => {
                buf.read_magic()?;
                let protocol = buf.read_u8()?;
                let mtu = total.min(u16::MAX as usize) as u16;
                // The rest is padding
                *buf = Bytes::new();
                Packet::OpenConnectionRequest1(OpenConnectionRequest1 { protocol, mtu })
            }
            PacketId::OpenConnectionReply1 => {
                buf.read_magic()?;
                Packet::OpenConnectionReply1(OpenConnectionReply1 {
                    server_id: buf.read_i64()?,
                    security: buf.read_bool()?,
                    mtu: buf.read_u16()?,
                })
            }
            PacketId::OpenConnectionRequest2 => {
                buf.read_magic()?;
                Packet::OpenConnectionRequest2(OpenConnectionRequest2 {
                    server_address: buf.read_address()?,
                    mtu: buf.read_u16()?,
                    client_id: buf.read_i64()?,
                })
            }
            PacketId::OpenConnectionReply2 => {
                buf.read_magic()?;
                Packet::OpenConnectionReply2(OpenConnectionReply2 {
                    server_id: buf.read_i64()?,
                    client_address: buf.read_address()?,
                    mtu: buf.read_u16()?,
                    encryption: buf.read_bool()?,
                })
            }
            PacketId::ConnectionRequest => Packet::ConnectionRequest(ConnectionRequest {
                client_id: buf.read_u64()?,
                ping_time: buf.read_u64()?,
            }),
            PacketId::ConnectionAccept => {
                let client_address = buf.read_address()?;
                let system_index = buf.read_u16()?;
                let system_addresses = get_system_addresses(buf)?;
                Packet::ConnectionAccept(ConnectionAccept {
                    client_address,
                    system_index,
                    system_addresses,
                    ping_time: buf.read_u64()?,
                    pong_time: buf.read_u64()?,
                })
            }
            PacketId::NewIncomingConnection => {
                let server_address = buf.read_address()?;
                let system_addresses = get_system_addresses(buf)?;
                Packet::NewIncomingConnection(NewIncomingConnection {
                    server_address,
                    system_addresses,
                    ping_time: buf.read_u64()?,
                    pong_time: buf.read_u64()?,
                })
            }
            PacketId::ConnectedPing => Packet::ConnectedPing(ConnectedPing {
                ping_time: buf.read_i64()?,
            }),
            PacketId::ConnectedPong => Packet::ConnectedPong(ConnectedPong {
                ping_time: buf.read_i64()?,
                pong_time: buf.read_i64()?,
            }),
            PacketId::DisconnectNotification => Packet::DisconnectNotification,
        };

        Ok(packet)
    }
}

fn put_system_addresses(buf: &mut BytesMut, addresses: &[SocketAddr]) {
    let unspecified = unspecified_address();
    for i in 0..SYSTEM_ADDRESS_SLOTS {
        buf.put_address(addresses.get(i).unwrap_or(&unspecified));
    }
}

/// Read address slots until only the two trailing timestamps remain.
///
/// Older peers send 10 slots instead of 20.
fn get_system_addresses(buf: &mut Bytes) -> Result<Vec<SocketAddr>, WireError> {
    let mut addresses = Vec::with_capacity(SYSTEM_ADDRESS_SLOTS);
    while addresses.len() < SYSTEM_ADDRESS_SLOTS && buf.len() > 16 {
        addresses.push(buf.read_address()?);
    }
    Ok(addresses)
}
