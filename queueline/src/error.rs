use std::io;

use protocol_sga::ParseError;
use thiserror::Error;

/// Errors returned by the queue runtime and its transports.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The operation is not supported by this queue kind.
    #[error("unsupported operation")]
    Unsupported,
    /// No queue with this descriptor exists.
    #[error("unknown queue descriptor: {0}")]
    UnknownDescriptor(crate::queue::Qd),
    /// No outstanding operation with this token exists on the queue.
    #[error("unknown token: {0:#x}")]
    UnknownToken(u64),
    /// The queue (or a slot on it) is occupied.
    #[error("queue busy")]
    Busy,
    /// The underlying endpoint is closed or poisoned.
    #[error("queue closed")]
    Closed,
    /// The peer violated the wire protocol; the connection is poisoned.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// The underlying transport reported an error.
    #[error("transport I/O: {0}")]
    TransportIo(#[from] io::Error),
    /// A receive-path allocation failed.
    #[error("out of memory")]
    OutOfMemory,
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::OutOfMemory => Error::OutOfMemory,
            ParseError::BadMagic(_) => Error::Protocol("bad frame magic"),
            ParseError::TooLarge => Error::Protocol("frame exceeds maximum length"),
            ParseError::Protocol(msg) => Error::Protocol(msg),
            // Incomplete never escapes the transports; a short read keeps
            // the task pending instead.
            ParseError::Incomplete => Error::Protocol("truncated frame"),
        }
    }
}
