//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Cursor ran past the end of the buffer
    #[error("unexpected end of buffer: need {needed} bytes, {remaining} remaining")]
    Eof {
        /// Bytes the read required
        needed: usize,
        /// Bytes left in the buffer
        remaining: usize,
    },

    /// Encapsulated message declared a zero payload length
    #[error("empty encapsulated payload")]
    EmptyPayload,

    /// Payload does not fit the 16-bit length-in-bits field
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Offline message magic mismatch
    #[error("invalid offline magic")]
    Magic,

    /// Leading byte matches no registered packet
    #[error("unknown packet id {0:#04x}")]
    UnknownPacket(u8),

    /// Unsupported address family tag
    #[error("unsupported address version {0}")]
    AddressVersion(u8),

    /// String field is not valid UTF-8
    #[error("string is not valid utf-8")]
    Utf8,

    /// Structurally invalid packet
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}
