//! Checked primitive reads and writes over `bytes` buffers.
//!
//! Every getter here fails with [`WireError::Eof`] instead of panicking when
//! the buffer is short, so a truncated datagram can never take down the
//! receive path. Multi-byte integers are big-endian unless the name says
//! otherwise; triads are 24-bit integers.

use crate::error::WireError;
use bytes::{Buf, BufMut, Bytes};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

/// Offline message magic shared by every handshake packet
pub const MAGIC: [u8; 16] = [
    0x00, 0xFF, 0xFF, 0x00, 0xFE, 0xFE, 0xFE, 0xFE, 0xFD, 0xFD, 0xFD, 0xFD, 0x12, 0x34, 0x56, 0x78,
];

/// Address family tag written for IPv6 addresses
const AF_INET6: u16 = 23;

/// Encoded size of an IPv4 address entry
pub const IPV4_ADDRESS_SIZE: usize = 7;

macro_rules! read_impl {
    ($reader: ident, $ty:ty, $getter: ident) => {
        /// Checked read of a fixed-width value
        fn $reader(&mut self) -> Result<$ty, WireError> {
            self.ensure(std::mem::size_of::<$ty>())?;
            Ok(self.$getter())
        }
    };
}

/// Checked reads for the RakNet binary format
pub trait BufExt: Buf {
    /// Fail unless at least `needed` bytes remain
    fn ensure(&self, needed: usize) -> Result<(), WireError> {
        if self.remaining() < needed {
            return Err(WireError::Eof {
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    read_impl!(read_u8, u8, get_u8);
    read_impl!(read_u16, u16, get_u16);
    read_impl!(read_u16_le, u16, get_u16_le);
    read_impl!(read_u32, u32, get_u32);
    read_impl!(read_u64, u64, get_u64);
    read_impl!(read_i16, i16, get_i16);
    read_impl!(read_i32, i32, get_i32);
    read_impl!(read_i64, i64, get_i64);
    read_impl!(read_f32, f32, get_f32);
    read_impl!(read_f64, f64, get_f64);

    /// Read a 24-bit little-endian integer
    fn read_triad_le(&mut self) -> Result<u32, WireError> {
        self.ensure(3)?;
        Ok(self.get_uint_le(3) as u32)
    }

    /// Read a 24-bit big-endian integer
    fn read_triad_be(&mut self) -> Result<u32, WireError> {
        self.ensure(3)?;
        Ok(self.get_uint(3) as u32)
    }

    /// Read a single-byte boolean (any nonzero value is true)
    fn read_bool(&mut self) -> Result<bool, WireError> {
        Ok(self.read_u8()? != 0)
    }

    /// Read exactly `len` bytes
    fn read_bytes(&mut self, len: usize) -> Result<Bytes, WireError> {
        self.ensure(len)?;
        Ok(self.copy_to_bytes(len))
    }

    /// Read a u16-length-prefixed UTF-8 string
    fn read_string(&mut self) -> Result<String, WireError> {
        let len = self.read_u16()? as usize;
        let raw = self.read_bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::Utf8)
    }

    /// Read and verify the offline magic
    fn read_magic(&mut self) -> Result<(), WireError> {
        let raw = self.read_bytes(MAGIC.len())?;
        if raw.as_ref() != MAGIC {
            return Err(WireError::Magic);
        }
        Ok(())
    }

    /// Read a RakNet system address
    fn read_address(&mut self) -> Result<SocketAddr, WireError> {
        match self.read_u8()? {
            4 => {
                self.ensure(6)?;
                let mut octets = [0u8; 4];
                for octet in octets.iter_mut() {
                    *octet = !self.get_u8();
                }
                let port = self.get_u16();
                Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            6 => {
                self.ensure(28)?;
                let _family = self.get_u16_le();
                let port = self.get_u16();
                let flow_info = self.get_u32();
                let mut octets = [0u8; 16];
                self.copy_to_slice(&mut octets);
                let scope_id = self.get_u32();
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    flow_info,
                    scope_id,
                )))
            }
            other => Err(WireError::AddressVersion(other)),
        }
    }
}

impl<T: Buf> BufExt for T {}

/// Writers for the RakNet binary format
pub trait BufMutExt: BufMut {
    /// Write a 24-bit little-endian integer
    fn put_triad_le(&mut self, value: u32) {
        self.put_uint_le((value & 0x00FF_FFFF) as u64, 3);
    }

    /// Write a 24-bit big-endian integer
    fn put_triad_be(&mut self, value: u32) {
        self.put_uint((value & 0x00FF_FFFF) as u64, 3);
    }

    /// Write a single-byte boolean
    fn put_bool(&mut self, value: bool) {
        self.put_u8(value as u8);
    }

    /// Write a u16-length-prefixed string, truncating at `u16::MAX` bytes
    fn put_string(&mut self, value: &str) {
        let raw = value.as_bytes();
        let len = raw.len().min(u16::MAX as usize);
        self.put_u16(len as u16);
        self.put_slice(&raw[..len]);
    }

    /// Write the offline magic
    fn put_magic(&mut self) {
        self.put_slice(&MAGIC);
    }

    /// Write a RakNet system address
    fn put_address(&mut self, addr: &SocketAddr) {
        match addr {
            SocketAddr::V4(v4) => {
                self.put_u8(4);
                for octet in v4.ip().octets() {
                    self.put_u8(!octet);
                }
                self.put_u16(v4.port());
            }
            SocketAddr::V6(v6) => {
                self.put_u8(6);
                self.put_u16_le(AF_INET6);
                self.put_u16(v6.port());
                self.put_u32(0);
                self.put_slice(&v6.ip().octets());
                self.put_u32(0);
            }
        }
    }
}

impl<T: BufMut> BufMutExt for T {}

/// Size in bytes of an encoded address
pub fn address_size(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => IPV4_ADDRESS_SIZE,
        SocketAddr::V6(_) => 29,
    }
}

/// Placeholder written into unused system address slots
pub fn unspecified_address() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_triads() {
        let mut buf = BytesMut::new();
        buf.put_triad_le(0x123456);
        buf.put_triad_be(0x123456);
        assert_eq!(&buf[..], &[0x56, 0x34, 0x12, 0x12, 0x34, 0x56]);

        let mut bytes = buf.freeze();
        assert_eq!(bytes.read_triad_le().unwrap(), 0x123456);
        assert_eq!(bytes.read_triad_be().unwrap(), 0x123456);
        assert!(bytes.read_triad_le().is_err());
    }

    #[test]
    fn test_short_read_is_error() {
        let mut bytes = Bytes::from_static(&[0x01, 0x02]);
        assert_eq!(
            bytes.read_u32(),
            Err(WireError::Eof {
                needed: 4,
                remaining: 2
            })
        );
        // A failed read does not consume anything
        assert_eq!(bytes.read_u16().unwrap(), 0x0102);
    }

    #[test]
    fn test_checked_reads_coexist_with_buf_getters() {
        let mut bytes = Bytes::from_static(&[0x07, 0x00, 0x2A, 0x01]);
        assert_eq!(Buf::try_get_u8(&mut bytes).unwrap(), 0x07);
        assert_eq!(bytes.read_u16().unwrap(), 0x002A);
        assert!(bytes.read_bool().unwrap());
        assert!(Buf::try_get_u8(&mut bytes).is_err());
        assert_eq!(
            bytes.read_u8(),
            Err(WireError::Eof {
                needed: 1,
                remaining: 0
            })
        );
    }

    #[test]
    fn test_ipv4_address_is_inverted() {
        let addr: SocketAddr = "192.168.1.20:19132".parse().unwrap();
        let mut buf = BytesMut::new();
        buf.put_address(&addr);

        assert_eq!(buf.len(), IPV4_ADDRESS_SIZE);
        assert_eq!(buf[0], 4);
        assert_eq!(buf[1], !192u8);
        assert_eq!(buf[4], !20u8);

        let mut bytes = buf.freeze();
        assert_eq!(bytes.read_address().unwrap(), addr);
    }

    #[test]
    fn test_ipv6_address() {
        let addr: SocketAddr = "[::1]:19133".parse().unwrap();
        let mut buf = BytesMut::new();
        buf.put_address(&addr);
        assert_eq!(buf.len(), address_size(&addr));
        assert_eq!(&buf[1..3], &AF_INET6.to_le_bytes());

        let mut bytes = buf.freeze();
        assert_eq!(bytes.read_address().unwrap(), addr);
    }

    #[test]
    fn test_unknown_address_version() {
        let mut bytes = Bytes::from_static(&[9, 0, 0]);
        assert_eq!(bytes.read_address(), Err(WireError::AddressVersion(9)));
    }

    #[test]
    fn test_string_and_magic() {
        let mut buf = BytesMut::new();
        buf.put_magic();
        buf.put_string("MCPE;motd");

        let mut bytes = buf.freeze();
        bytes.read_magic().unwrap();
        assert_eq!(bytes.read_string().unwrap(), "MCPE;motd");

        let mut bad = Bytes::from_static(&[0u8; 16]);
        assert_eq!(bad.read_magic(), Err(WireError::Magic));
    }
}
