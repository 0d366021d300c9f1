//! # Tether
//!
//! Remote objects over one TCP connection.
//!
//! A server exposes a graph of real objects behind a root. A client sees the
//! graph through [`Proxy`] handles: reading and writing properties, calling
//! methods and listening to events travel as frames over a single
//! bidirectional stream. Object identities cross the wire instead of copies,
//! and both sides agree on which identities are still in use, so the server
//! stops tracking an object once no client proxy for it is reachable.
//!
//! ## Layout
//!
//! - [`wire`]: frames and the value codec.
//! - [`transport`]: the pump that moves frames over a byte stream.
//! - [`object`] and [`dynamic`]: the server-side object model.
//! - [`server`]: per-connection dispatch, the listener and admission.
//! - [`client`]: proxies, the client resolver and the client session.

pub mod client;
pub mod config;
pub mod dynamic;
pub mod error;
pub mod logging;
pub mod object;
pub mod server;
pub mod transport;

pub use tether_wire as wire;
pub use tether_wire::FrameKind;
pub use tether_wire::PROPERTY_CHANGED;
pub use tether_wire::RemoteError;
pub use tether_wire::RemoteErrorKind;
pub use tether_wire::Value;

pub use client::ClientSession;
pub use client::ClientValue;
pub use client::Proxy;
pub use client::ProxyEvent;
pub use client::ReferenceState;
pub use config::ServerConfig;
pub use config::SessionConfig;
pub use dynamic::DynamicObject;
pub use error::Error;
pub use error::Result;
pub use object::DistributedObject;
pub use object::ObjectHandle;
pub use object::ObjectRegistry;
pub use object::ServerValue;
pub use object::ValueKind;
pub use server::AllowAll;
pub use server::Authenticator;
pub use server::Principal;
pub use server::Server;
pub use server::ServerSession;
