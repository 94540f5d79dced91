//! # Error Definitions
//!
//! Channel-level failures. Failures raised *by remote code* are not here;
//! they travel back as `RemoteFailure` values inside a response.

use crate::export;
use crate::transport;

#[derive(Debug, Clone)]
pub enum Error {
    Transport(transport::Error),
    Wire(tether_wire::Error),
    Export(export::Error),
    /// A protocol invariant was broken by the offending operation.
    ProtocolViolation(String),
    /// The channel terminated while the operation was in flight.
    Abandoned(String),
    /// The channel is closed; nothing more can be sent.
    ChannelClosed,
    Timeout,
    Cancelled,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Wire(e) => write!(f, "Wire error: {}", e),
            Self::Export(e) => write!(f, "Export error: {}", e),
            Self::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            Self::Abandoned(msg) => write!(f, "Abandoned: {}", msg),
            Self::ChannelClosed => write!(f, "Channel is closed"),
            Self::Timeout => write!(f, "Request timed out"),
            Self::Cancelled => write!(f, "Request was cancelled"),
        }
    }
}

impl std::error::Error for Error {}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<tether_wire::Error> for Error {
    fn from(e: tether_wire::Error) -> Self {
        Self::Wire(e)
    }
}

impl From<export::Error> for Error {
    fn from(e: export::Error) -> Self {
        Self::Export(e)
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        let kind = match e {
            Error::ChannelClosed | Error::Abandoned(_) => std::io::ErrorKind::BrokenPipe,
            Error::Timeout => std::io::ErrorKind::TimedOut,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
