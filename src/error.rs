//! Error types.

use core::fmt;

/// Framing and payload validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame header does not start with the expected magic bytes.
    BadMagic { found: [u8; 2] },
    /// Payload length exceeds the configured maximum.
    PayloadTooLarge { len: usize, max: usize },
    /// Channel field outside the addressable range.
    ChannelOutOfRange { channel: u16 },
    /// Frame shorter than a complete header; cannot be rewritten in place.
    TruncatedFrame { len: usize, needed: usize },
    /// The codec cannot rewrite the channel of a pre-encoded frame.
    RecodingUnsupported,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic { found } => {
                write!(f, "bad frame magic: {:02x} {:02x}", found[0], found[1])
            }
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload {len} bytes exceeds max {max}")
            }
            Self::ChannelOutOfRange { channel } => {
                write!(f, "channel {channel} out of range")
            }
            Self::TruncatedFrame { len, needed } => {
                write!(f, "frame too short: {len} < {needed}")
            }
            Self::RecodingUnsupported => write!(f, "codec does not support recoding"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Errors surfaced on a caller's response future or by the supervisors.
#[derive(Debug)]
pub enum RpcError {
    /// The caller's deadline elapsed before a response arrived.
    TimedOut,
    /// The connection closed before a response arrived.
    Closed,
    /// Encoding the outgoing request failed.
    Encode(CodecError),
    /// An argument outside the supported range, rejected at construction.
    InvalidArgument(String),
    /// Socket-level failure while connecting or accepting.
    Io(std::io::Error),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => write!(f, "timed out waiting for response"),
            Self::Closed => write!(f, "connection closed"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Encode(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for RpcError {
    fn from(e: CodecError) -> Self {
        Self::Encode(e)
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
