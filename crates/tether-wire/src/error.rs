//! # Error Definitions
//!
//! The central ledger of wire failures, split the same way failures are split
//! on the wire:
//!
//! - [`WireError`]: the bytes themselves are wrong (truncated, bad tag, bad
//!   version). These are transport faults; the connection cannot be trusted.
//! - [`RemoteError`]: the bytes are fine, but the *remote operation* failed.
//!   These travel inside exception frames and leave the session intact.

use uuid::Uuid;

/// Failures while encoding or decoding frames and payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer exhausted while reading.
    UnexpectedEnd,
    /// The length prefix disagrees with the number of bytes supplied.
    LengthMismatch { declared: usize, actual: usize },
    /// The version marker is not one this build understands.
    BadVersion([u8; 3]),
    /// Byte does not correspond to a known frame kind.
    UnknownFrameKind(u8),
    /// Byte does not correspond to a known value tag.
    InvalidTag(u8),
    /// String data is not valid UTF-8.
    InvalidUtf8,
    /// Member names are restricted to ASCII.
    NonAsciiMember(String),
    /// A frame or blob length does not fit the 32-bit length fields.
    FrameTooLarge(usize),
    /// The nested depth of a value exceeded the safety limit.
    RecursionLimitExceeded,
    /// A reference hook could not produce an object for this identity.
    UnresolvedReference(Uuid),
    /// The payload was well-formed but not what the protocol allows here.
    ProtocolViolation(String),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedEnd => write!(f, "unexpected end of buffer"),
            Self::LengthMismatch { declared, actual } => {
                write!(f, "length prefix says {} bytes, found {}", declared, actual)
            }
            Self::BadVersion(v) => write!(f, "unsupported version marker {:02x?}", v),
            Self::UnknownFrameKind(b) => write!(f, "unknown frame kind {:#04x}", b),
            Self::InvalidTag(b) => write!(f, "invalid value tag {:#04x}", b),
            Self::InvalidUtf8 => write!(f, "string data is not valid UTF-8"),
            Self::NonAsciiMember(name) => write!(f, "member name {:?} is not ASCII", name),
            Self::FrameTooLarge(len) => write!(f, "length {} exceeds the 32-bit limit", len),
            Self::RecursionLimitExceeded => write!(f, "value nesting exceeds the recursion limit"),
            Self::UnresolvedReference(id) => write!(f, "unresolved object reference {}", id),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for WireError {}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, WireError>;

/// Categories of remote failure carried by exception frames.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    /// The addressed object identity does not exist on the server.
    ObjectNotFound = 1,
    /// No member with that name and arity exists on the target.
    MemberNotFound = 2,
    /// Arguments could not be coerced to the member's declared types.
    BadArguments = 3,
    /// The target object has been disposed.
    ObjectDisposed = 4,
    /// The member itself failed.
    Application = 5,
    /// The request frame was not acceptable in this position.
    Protocol = 6,
}

impl RemoteErrorKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::ObjectNotFound),
            2 => Some(Self::MemberNotFound),
            3 => Some(Self::BadArguments),
            4 => Some(Self::ObjectDisposed),
            5 => Some(Self::Application),
            6 => Some(Self::Protocol),
            _ => None,
        }
    }
}

/// The error value that crosses the wire in place of a native panic or error.
///
/// Only one level of `inner` survives encoding; deeper causes are flattened
/// away by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
    pub inner: Option<Box<RemoteError>>,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), inner: None }
    }

    /// Wraps an application failure.
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Application, message)
    }

    pub fn object_not_found(id: Uuid) -> Self {
        Self::new(RemoteErrorKind::ObjectNotFound, format!("object {} not found", id))
    }

    pub fn member_not_found(type_name: &str, member: &str, arity: u32) -> Self {
        Self::new(
            RemoteErrorKind::MemberNotFound,
            format!("{} has no member '{}' taking {} parameter(s)", type_name, member, arity),
        )
    }

    pub fn bad_arguments(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::BadArguments, message)
    }

    pub fn with_inner(mut self, inner: RemoteError) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(inner) = &self.inner {
            write!(f, " (caused by {})", inner)?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.as_deref().map(|e| e as &(dyn std::error::Error + 'static))
    }
}
