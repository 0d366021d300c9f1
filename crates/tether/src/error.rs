//! # Runtime Errors
//!
//! Failures a caller of the runtime can observe.
//!
//! Transport faults all collapse into [`Error::Disconnected`] once the pump
//! has shut down: callers that only want the zero value of a failed call can
//! use `unwrap_or_default()` on the result.

use tether_wire::RemoteError;
use tether_wire::WireError;

#[derive(Debug, Clone)]
pub enum Error {
    /// Malformed bytes on the wire, or a value the codec refused.
    Wire(WireError),
    /// Socket-level failure.
    Io(String),
    /// The connection is gone; pending and future calls fail with this.
    Disconnected,
    /// No response arrived within the configured call timeout.
    Timeout,
    /// The outbound queue hit its capacity; the session was disconnected.
    QueueOverflow { capacity: usize },
    /// The remote side answered with an exception frame.
    Remote(RemoteError),
    /// The proxy was disposed locally.
    Disposed,
    /// The peer answered with something the protocol does not allow here.
    Protocol(String),
    /// The authenticator refused the connection.
    Rejected(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wire(e) => write!(f, "Wire error: {}", e),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
            Self::Disconnected => write!(f, "Session disconnected"),
            Self::Timeout => write!(f, "Request timed out"),
            Self::QueueOverflow { capacity } => {
                write!(f, "Outbound queue exceeded {} frames", capacity)
            }
            Self::Remote(e) => write!(f, "Remote failure: {}", e),
            Self::Disposed => write!(f, "Proxy disposed"),
            Self::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Self::Rejected(reason) => write!(f, "Connection rejected: {}", reason),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Wire(e) => Some(e),
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        Self::Remote(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
