//! # Listener
//!
//! Binds one TCP port, admits connections through the [`Authenticator`] one
//! at a time, and runs a [`ServerSession`] for each.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::object::ObjectHandle;
use crate::object::ObjectRegistry;
use crate::server::auth::Authenticator;
use crate::server::session::ServerSession;

/// Strong type for accepted connections.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

struct Shared {
    config: ServerConfig,
    root: ObjectHandle,
    registry: Arc<ObjectRegistry>,
    authenticator: Arc<dyn Authenticator>,
    sessions: DashMap<ConnectionId, Arc<ServerSession>>,
    next_id: AtomicU64,
}

pub struct Server {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Binds the configured address and starts accepting.
    pub async fn bind(
        config: ServerConfig,
        root: ObjectHandle,
        registry: Arc<ObjectRegistry>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Server> {
        let listener = TcpListener::bind(config.bind).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "listening");

        let shared = Arc::new(Shared {
            config,
            root,
            registry,
            authenticator,
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(shared.clone(), listener, stop_rx));

        Ok(Server {
            shared,
            local_addr,
            stop_tx,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sessions whose connection is still open.
    pub fn connection_count(&self) -> usize {
        self.shared.sessions.len()
    }

    pub fn sessions(&self) -> Vec<Arc<ServerSession>> {
        self.shared.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Stops accepting and disconnects every session.
    pub async fn shutdown(&self) {
        self.stop_tx.send_replace(true);
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let sessions: Vec<Arc<ServerSession>> = self.sessions();
        for session in &sessions {
            session.close();
        }
        self.shared.sessions.clear();
        info!(addr = %self.local_addr, closed = sessions.len(), "server shut down");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
        for entry in self.shared.sessions.iter() {
            entry.value().close();
        }
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, mut stop: watch::Receiver<bool>) {
    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = stop.wait_for(|stopped| *stopped) => break,
        };

        match accepted {
            Ok((stream, peer)) => admit(&shared, stream, peer).await,
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
    debug!("accept loop stopped");
}

async fn admit(shared: &Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    let principal = match shared.authenticator.authenticate(peer).await {
        Ok(principal) => principal,
        Err(rejection) => {
            warn!(peer = %peer, reason = %rejection.reason, "connection rejected");
            return;
        }
    };
    let _ = stream.set_nodelay(true);

    let id = ConnectionId(shared.next_id.fetch_add(1, Ordering::Relaxed));
    let config = shared.config.session.clone().with_name(format!("{}-{}", shared.config.session.name, id));
    let session = ServerSession::start(stream, shared.root.clone(), shared.registry.clone(), principal, &config);
    shared.sessions.insert(id, session.clone());

    // Forget the session once its connection is gone.
    let watcher = shared.clone();
    tokio::spawn(async move {
        session.closed().await;
        watcher.sessions.remove(&id);
        debug!(connection = %id, "connection closed");
    });
}
