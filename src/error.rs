use smoltcp::{
    socket::udp::{BindError, RecvError, SendError},
    wire::IpEndpoint,
};
use thiserror::Error;

#[cfg(feature = "std")]
use std::io::Error as IoError;

use crate::packet::{ErrorCode, Opcode};

/// Everything that can end a transfer.
///
/// The `Display` text doubles as the message of the ERROR packet sent to the
/// peer, see [`Error::code`] for the matching error code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("bind failed: {0:?}")]
    Bind(BindError),
    #[error("send failed: {0:?}")]
    Send(SendError),
    #[error("receive failed: {0:?}")]
    Recv(RecvError),
    /// A datagram arrived from an address other than the transfer's TID.
    #[error("unknown transfer ID")]
    InvalidAddr(IpEndpoint),
    /// No response within the retry budget.
    #[error("connection timed out")]
    Timeout,
    /// Fewer bytes than the opcode or the fixed header needs.
    #[error("malformed packet: truncated")]
    Truncated,
    #[error("malformed packet: unknown opcode {0}")]
    UnknownOpcode(u16),
    /// A request body that is not exactly `filename\0mode\0`.
    #[error("malformed packet: bad request fields")]
    MalformedRequest,
    #[error("malformed packet: text is not valid UTF-8")]
    Utf8,
    #[error("packet does not fit in one datagram")]
    Oversized,
    /// A received datagram longer than any packet we accept.
    #[error("malformed packet: {0} bytes is too long")]
    Overlong(usize),
    /// A valid packet of a kind the current exchange does not accept.
    #[error("unexpected {0:?} packet")]
    UnexpectedPacket(Opcode),
    /// The peer sent an ERROR packet.
    #[error("transfer aborted by peer ({0:?})")]
    Remote(ErrorCode),
    #[error("file does not exist")]
    NotFound,
    #[error("access violation")]
    AccessViolation,
    #[error("unable to put file")]
    PutFailed,
    #[cfg(feature = "std")]
    #[error(transparent)]
    Io(#[from] IoError),
}

impl Error {
    /// The error code reported to the peer for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotFound => ErrorCode::FileNotFound,
            Error::AccessViolation => ErrorCode::AccessViolation,
            Error::InvalidAddr(_) => ErrorCode::UnknownTid,
            Error::Remote(code) => *code,
            _ => ErrorCode::NotDefined,
        }
    }
}

impl From<BindError> for Error {
    fn from(value: BindError) -> Self {
        Self::Bind(value)
    }
}

impl From<RecvError> for Error {
    fn from(value: RecvError) -> Self {
        Self::Recv(value)
    }
}

impl From<SendError> for Error {
    fn from(value: SendError) -> Self {
        Self::Send(value)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
