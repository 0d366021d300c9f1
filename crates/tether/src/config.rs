//! # Configuration
//!
//! Knobs for sessions and the listener, set through chained `with_*` calls.

use std::net::SocketAddr;
use std::time::Duration;

/// Per-connection settings, shared by client and server sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Label used in log fields.
    pub name: String,
    /// Frames allowed in the outbound queue before the session is dropped.
    pub outbound_capacity: usize,
    /// Largest frame body accepted from the peer.
    pub max_frame_len: usize,
    /// How long a call waits for its response.
    pub call_timeout: Duration,
    /// Event notifications buffered for the client event worker.
    pub event_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "session".to_string(),
            outbound_capacity: 4096,
            max_frame_len: 16 * 1024 * 1024,
            call_timeout: Duration::from_secs(30),
            event_queue_capacity: 1024,
        }
    }
}

impl SessionConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }
}

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Template for every accepted session; the name gets a connection suffix.
    pub session: SessionConfig,
}

impl ServerConfig {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            session: SessionConfig::default().with_name("server"),
        }
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 0)))
    }
}
