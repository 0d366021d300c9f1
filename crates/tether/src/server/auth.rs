//! Connection admission.
//!
//! The listener asks an [`Authenticator`] about every accepted connection
//! before a session exists for it. A rejected connection is closed without
//! a single frame being read.

use std::net::SocketAddr;

/// Who is on the other end of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub peer: Option<SocketAddr>,
}

impl Principal {
    pub fn new(name: impl Into<String>, peer: Option<SocketAddr>) -> Self {
        Self { name: name.into(), peer }
    }

    /// Used for in-process sessions that never went through a listener.
    pub fn anonymous() -> Self {
        Self::new("anonymous", None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: String,
}

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection rejected: {}", self.reason)
    }
}

impl std::error::Error for Rejection {}

#[async_trait::async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Maps a freshly accepted connection to a principal, or refuses it.
    async fn authenticate(&self, peer: SocketAddr) -> Result<Principal, Rejection>;
}

/// Admits everyone, naming the principal after the peer address.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait::async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, peer: SocketAddr) -> Result<Principal, Rejection> {
        Ok(Principal::new(peer.to_string(), Some(peer)))
    }
}
