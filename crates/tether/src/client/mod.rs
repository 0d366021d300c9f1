//! The client half: proxies for remote objects and the session that feeds them.
//!
//! - [`proxy`]: the handles applications hold.
//! - [`resolver`]: identity tables and the finalize/resurrect protocol.
//! - [`session`]: call correlation and inbound routing.

pub mod proxy;
pub mod resolver;
pub mod session;

pub use proxy::ClientValue;
pub use proxy::DISPOSED;
pub use proxy::HandlerId;
pub use proxy::Proxy;
pub use proxy::ProxyEvent;
pub use resolver::ClientResolver;
pub use resolver::LifecycleListener;
pub use resolver::ReferenceState;
pub use session::ClientSession;
