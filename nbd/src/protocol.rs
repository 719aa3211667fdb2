//! NBD protocol constants and fixed-size frames.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! Every multi-byte field is big-endian on the wire. Protocol constants are
//! defined for completeness even if not all are currently used.

#![allow(dead_code)]

use std::io;

use thiserror::Error;

// Magic values
pub const NBD_MAGIC: u64 = 0x4e42444d41474943;
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054;
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
pub const NBD_OPTION_REPLY_MAGIC: u64 = 0x0003e889045565a9;

// Handshake flags
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;

// Client flags
pub const NBD_FLAG_C_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_C_NO_ZEROES: u16 = 1 << 1;

// Transmission flags
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
pub const NBD_FLAG_SEND_FUA: u16 = 1 << 3;
pub const NBD_FLAG_ROTATIONAL: u16 = 1 << 4;
pub const NBD_FLAG_SEND_TRIM: u16 = 1 << 5;
pub const NBD_FLAG_SEND_WRITE_ZEROES: u16 = 1 << 6;
pub const NBD_FLAG_CAN_MULTI_CONN: u16 = 1 << 8;
pub const NBD_FLAG_SEND_CACHE: u16 = 1 << 10;

// Option types
pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_LIST: u32 = 3;
pub const NBD_OPT_STARTTLS: u32 = 5;
pub const NBD_OPT_INFO: u32 = 6;
pub const NBD_OPT_GO: u32 = 7;
pub const NBD_OPT_STRUCTURED_REPLY: u32 = 8;

// Option replies
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_SERVER: u32 = 2;
pub const NBD_REP_INFO: u32 = 3;
pub const NBD_REP_FLAG_ERROR: u32 = 1 << 31;
pub const NBD_REP_ERR_UNSUP: u32 = NBD_REP_FLAG_ERROR + 1;
pub const NBD_REP_ERR_POLICY: u32 = NBD_REP_FLAG_ERROR + 2;
pub const NBD_REP_ERR_INVALID: u32 = NBD_REP_FLAG_ERROR + 3;
pub const NBD_REP_ERR_PLATFORM: u32 = NBD_REP_FLAG_ERROR + 4;
pub const NBD_REP_ERR_TLS_REQD: u32 = NBD_REP_FLAG_ERROR + 5;
pub const NBD_REP_ERR_UNKNOWN: u32 = NBD_REP_FLAG_ERROR + 6;
pub const NBD_REP_ERR_SHUTDOWN: u32 = NBD_REP_FLAG_ERROR + 7;
pub const NBD_REP_ERR_BLOCK_SIZE_REQD: u32 = NBD_REP_FLAG_ERROR + 8;
pub const NBD_REP_ERR_TOO_BIG: u32 = NBD_REP_FLAG_ERROR + 9;
pub const NBD_REP_ERR_EXT_HEADER_REQD: u32 = NBD_REP_FLAG_ERROR + 10;

/// Whether an option reply code signals an error.
#[inline]
pub fn is_reply_error(reply: u32) -> bool {
    reply & NBD_REP_FLAG_ERROR != 0
}

// Info types
pub const NBD_INFO_EXPORT: u16 = 0;
pub const NBD_INFO_NAME: u16 = 1;
pub const NBD_INFO_DESCRIPTION: u16 = 2;
pub const NBD_INFO_BLOCK_SIZE: u16 = 3;

/// Maximum payload size per NBD protocol specification (32 MiB).
pub const NBD_MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024; // 32 MiB

// Commands
pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISC: u16 = 2;
pub const NBD_CMD_FLUSH: u16 = 3;
pub const NBD_CMD_TRIM: u16 = 4;
pub const NBD_CMD_CACHE: u16 = 5;
pub const NBD_CMD_WRITE_ZEROES: u16 = 6;

/// Command carried by a transmission request.
///
/// Unknown command types are preserved so the server can reject them with
/// `NBD_ENOTSUP` instead of dropping the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NbdCommand {
    Read,
    Write,
    Disconnect,
    Flush,
    Trim,
    Cache,
    WriteZeroes,
    Unknown(u16),
}

impl NbdCommand {
    pub fn from_u16(v: u16) -> Self {
        match v {
            NBD_CMD_READ => Self::Read,
            NBD_CMD_WRITE => Self::Write,
            NBD_CMD_DISC => Self::Disconnect,
            NBD_CMD_FLUSH => Self::Flush,
            NBD_CMD_TRIM => Self::Trim,
            NBD_CMD_CACHE => Self::Cache,
            NBD_CMD_WRITE_ZEROES => Self::WriteZeroes,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::Read => NBD_CMD_READ,
            Self::Write => NBD_CMD_WRITE,
            Self::Disconnect => NBD_CMD_DISC,
            Self::Flush => NBD_CMD_FLUSH,
            Self::Trim => NBD_CMD_TRIM,
            Self::Cache => NBD_CMD_CACHE,
            Self::WriteZeroes => NBD_CMD_WRITE_ZEROES,
            Self::Unknown(other) => other,
        }
    }

    /// Whether the request header is followed by `length` bytes of payload.
    pub fn has_payload(self) -> bool {
        matches!(self, Self::Write)
    }
}

pub const NBD_CMD_FLAG_FUA: u16 = 1 << 0;
pub const NBD_CMD_FLAG_NO_HOLE: u16 = 1 << 1;

// Error codes
pub const NBD_OK: u32 = 0;
pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_ENOMEM: u32 = 12;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOSPC: u32 = 28;
pub const NBD_EOVERFLOW: u32 = 75;
pub const NBD_ENOTSUP: u32 = 95;
pub const NBD_ESHUTDOWN: u32 = 108;

/// Human readable text for an error code carried in a reply header.
pub fn error_text(code: u32) -> &'static str {
    match code {
        NBD_OK => "Success",
        NBD_EPERM => "Operation not permitted",
        NBD_EIO => "Input/output error",
        NBD_ENOMEM => "Cannot allocate memory",
        NBD_EINVAL => "Invalid argument",
        NBD_ENOSPC => "No space left on device",
        NBD_EOVERFLOW => "Value too large",
        NBD_ENOTSUP => "Operation not supported",
        NBD_ESHUTDOWN => "Server is in the process of being shut down",
        _ => "Unknown error",
    }
}

/// Maximum length for option reply data during negotiation.
/// This prevents unbounded allocation from malicious servers.
pub const OPTION_REPLY_MAX_BYTES: usize = 64 * 1024; // 64 KiB

/// NBD protocol errors.
#[derive(Debug, Error)]
pub enum NbdError {
    #[error("invalid magic: expected 0x{expected:x}, got 0x{actual:x}")]
    InvalidMagic { expected: u64, actual: u64 },

    #[error("handshake rejected: {reason}")]
    HandshakeRejected { reason: String },

    #[error("protocol negotiation failed: {reason}")]
    NegotiationFailed { reason: &'static str },

    #[error("option {option} rejected by server: reply 0x{reply:08x}")]
    OptionRejected { option: u32, reply: u32 },

    #[error("client attempted non-fixed newstyle negotiation")]
    LegacyNegotiation,

    #[error("client desired to end the negotiation")]
    Aborted,

    #[error("client terminated connection")]
    ClientClosed,

    #[error("server is shutting down: {cause}")]
    Shutdown { cause: String },

    #[error("request too large: {length_bytes} bytes (max: {max_bytes})")]
    RequestTooLarge { length_bytes: u32, max_bytes: u32 },

    #[error("server error: {code}")]
    ServerError { code: u32 },

    #[error("handle mismatch: expected {expected}, got {actual}")]
    HandleMismatch { expected: u64, actual: u64 },

    #[error("transmission error: {0}")]
    Io(#[from] io::Error),
}

impl NbdError {
    /// Whether the error was caused by a server shutdown rather than by a
    /// failure of the connection itself.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown { .. })
    }
}

/// Initial server greeting (18 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHandshake {
    pub flags: u16,
}

impl ServerHandshake {
    pub const SIZE_BYTES: usize = 18;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(&NBD_MAGIC.to_be_bytes());
        buf[8..16].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
        buf[16..18].copy_from_slice(&self.flags.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        if magic != NBD_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_MAGIC,
                actual: magic,
            });
        }
        let opts_magic = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        if opts_magic != NBD_OPTS_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_OPTS_MAGIC,
                actual: opts_magic,
            });
        }
        Ok(Self {
            flags: u16::from_be_bytes([buf[16], buf[17]]),
        })
    }
}

/// Client reply to the greeting (4 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHandshake {
    pub padding: u16,
    pub flags: u16,
}

impl ClientHandshake {
    pub const SIZE_BYTES: usize = 4;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..2].copy_from_slice(&self.padding.to_be_bytes());
        buf[2..4].copy_from_slice(&self.flags.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Self {
        Self {
            padding: u16::from_be_bytes([buf[0], buf[1]]),
            flags: u16::from_be_bytes([buf[2], buf[3]]),
        }
    }
}

/// Option request header sent by the client (16 bytes on wire).
///
/// `length` bytes of option payload follow the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionHeader {
    pub option: u32,
    pub length: u32,
}

impl OptionHeader {
    pub const SIZE_BYTES: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
        buf[8..12].copy_from_slice(&self.option.to_be_bytes());
        buf[12..16].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        if magic != NBD_OPTS_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_OPTS_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            option: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            length: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

/// Option reply header sent by the server (20 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionReplyHeader {
    pub option: u32,
    pub reply: u32,
    pub length: u32,
}

impl OptionReplyHeader {
    pub const SIZE_BYTES: usize = 20;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..8].copy_from_slice(&NBD_OPTION_REPLY_MAGIC.to_be_bytes());
        buf[8..12].copy_from_slice(&self.option.to_be_bytes());
        buf[12..16].copy_from_slice(&self.reply.to_be_bytes());
        buf[16..20].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        if magic != NBD_OPTION_REPLY_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_OPTION_REPLY_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            option: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            reply: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            length: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
        })
    }
}

/// `NBD_INFO_EXPORT` information block (12 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoExport {
    pub size_bytes: u64,
    pub transmission_flags: u16,
}

impl InfoExport {
    pub const SIZE_BYTES: usize = 12;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..2].copy_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
        buf[2..10].copy_from_slice(&self.size_bytes.to_be_bytes());
        buf[10..12].copy_from_slice(&self.transmission_flags.to_be_bytes());
        buf
    }

    /// Parse an info block, returning `None` for other info types.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE_BYTES {
            return None;
        }
        let info = u16::from_be_bytes([buf[0], buf[1]]);
        if info != NBD_INFO_EXPORT {
            return None;
        }
        Some(Self {
            size_bytes: u64::from_be_bytes(buf[2..10].try_into().unwrap()),
            transmission_flags: u16::from_be_bytes([buf[10], buf[11]]),
        })
    }
}

/// NBD request (28 bytes on wire).
#[derive(Debug, Clone, Copy)]
pub struct NbdRequest {
    pub flags: u16,
    pub command: NbdCommand,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

impl NbdRequest {
    pub const SIZE_BYTES: usize = 28;

    /// Serialize an NBD request to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.flags.to_be_bytes());
        buf[6..8].copy_from_slice(&self.command.to_u16().to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Parse an NBD request header.
    ///
    /// Only the magic is validated here. Flags, command type and length are
    /// policy decisions left to the server.
    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != NBD_REQUEST_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_REQUEST_MAGIC as u64,
                actual: magic as u64,
            });
        }

        let flags = u16::from_be_bytes([buf[4], buf[5]]);
        let command = NbdCommand::from_u16(u16::from_be_bytes([buf[6], buf[7]]));
        let handle = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        let offset = u64::from_be_bytes(buf[16..24].try_into().unwrap());
        let length = u32::from_be_bytes(buf[24..28].try_into().unwrap());

        Ok(Self {
            flags,
            command,
            handle,
            offset,
            length,
        })
    }
}

/// NBD simple reply (16 bytes on wire).
#[derive(Debug, Clone, Copy)]
pub struct NbdReply {
    pub error: u32,
    pub handle: u64,
}

impl NbdReply {
    pub const SIZE_BYTES: usize = 16;

    pub fn ok(handle: u64) -> Self {
        Self {
            error: NBD_OK,
            handle,
        }
    }

    pub fn error(handle: u64, error: u32) -> Self {
        Self { error, handle }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_SIMPLE_REPLY_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.error.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != NBD_SIMPLE_REPLY_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_SIMPLE_REPLY_MAGIC as u64,
                actual: magic as u64,
            });
        }

        let error = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let handle = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        Ok(Self { error, handle })
    }
}

const _: () = {
    assert!(NbdRequest::SIZE_BYTES == 28);
    assert!(NbdReply::SIZE_BYTES == 16);
    assert!(OptionReplyHeader::SIZE_BYTES == 20);
    assert!(NBD_REP_ERR_TOO_BIG == 0x80000009);
};
