//! Error types for the membership library.

use std::fmt;

/// Errors raised by the wire codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A length field extends past the end of the buffer.
    Truncated,

    /// The type byte, or an embedded tag such as a status byte, is not a
    /// known value.
    BadType(u8),

    /// A string field is not valid UTF-8.
    BadUtf8,

    /// The total datagram size exceeds the 64 KiB hard limit.
    TooLarge(usize),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Truncated => write!(f, "datagram truncated"),
            CodecError::BadType(b) => write!(f, "unknown tag byte: {:#04x}", b),
            CodecError::BadUtf8 => write!(f, "string field is not valid UTF-8"),
            CodecError::TooLarge(size) => {
                write!(f, "datagram of {} bytes exceeds the 64 KiB limit", size)
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Errors raised by a transport implementation.
#[derive(Debug)]
pub enum TransportError {
    /// A datagram could not be handed to the network.
    SendFailed(std::io::Error),

    /// The transport is shut down or was never usable.
    TransportUnavailable,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::SendFailed(err) => write!(f, "send failed: {}", err),
            TransportError::TransportUnavailable => write!(f, "transport unavailable"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::SendFailed(err) => Some(err),
            TransportError::TransportUnavailable => None,
        }
    }
}

/// Top-level error for engine operations.
///
/// In steady state nothing surfaces here: send failures are folded into
/// probe timeouts and codec failures drop the offending datagram. Only
/// `join` reports an error to the caller.
#[derive(Debug)]
pub enum SwimError {
    Codec(CodecError),
    Transport(TransportError),

    /// `join` was given no seeds, or every seed send failed.
    JoinFailed(String),
}

impl fmt::Display for SwimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwimError::Codec(err) => write!(f, "codec error: {}", err),
            SwimError::Transport(err) => write!(f, "transport error: {}", err),
            SwimError::JoinFailed(reason) => write!(f, "join failed: {}", reason),
        }
    }
}

impl std::error::Error for SwimError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SwimError::Codec(err) => Some(err),
            SwimError::Transport(err) => Some(err),
            SwimError::JoinFailed(_) => None,
        }
    }
}

impl From<CodecError> for SwimError {
    fn from(err: CodecError) -> Self {
        SwimError::Codec(err)
    }
}

impl From<TransportError> for SwimError {
    fn from(err: TransportError) -> Self {
        SwimError::Transport(err)
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, SwimError>;
