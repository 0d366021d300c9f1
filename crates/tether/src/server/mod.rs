//! The server half: real objects exposed to remote clients.
//!
//! - [`resolver`]: per-session table of objects the client references.
//! - [`session`]: the per-connection dispatcher.
//! - [`coerce`]: argument conversion to declared member types.
//! - [`listener`] and [`auth`]: accepting and admitting TCP connections.

pub mod auth;
pub mod coerce;
pub mod listener;
pub mod resolver;
pub mod session;

pub use auth::AllowAll;
pub use auth::Authenticator;
pub use auth::Principal;
pub use auth::Rejection;
pub use listener::ConnectionId;
pub use listener::Server;
pub use resolver::ServerResolver;
pub use session::ServerSession;
