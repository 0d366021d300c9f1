//! TCP listener: admission, connection tracking and shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tether::AllowAll;
use tether::Authenticator;
use tether::ClientSession;
use tether::DynamicObject;
use tether::Error;
use tether::ObjectRegistry;
use tether::Principal;
use tether::Server;
use tether::ServerConfig;
use tether::SessionConfig;
use tether::Value;
use tether::ValueKind;
use tether::server::Rejection;

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

struct DenyAll;

#[async_trait::async_trait]
impl Authenticator for DenyAll {
    async fn authenticate(&self, _peer: SocketAddr) -> Result<Principal, Rejection> {
        Err(Rejection::new("closed for maintenance"))
    }
}

async fn serve(authenticator: Arc<dyn Authenticator>) -> (Arc<ObjectRegistry>, Arc<DynamicObject>, Server) {
    let _ = tether::logging::try_init();
    let registry = Arc::new(ObjectRegistry::new());
    let root = DynamicObject::builder("Root")
        .property("Name", ValueKind::Str, "main")
        .build(&registry);
    let server = Server::bind(ServerConfig::default(), root.handle(), registry.clone(), authenticator)
        .await
        .expect("bind");
    (registry, root, server)
}

#[tokio::test]
async fn test_tcp_client_reaches_root() -> anyhow::Result<()> {
    let (_registry, _root, server) = serve(Arc::new(AllowAll)).await;
    let client = ClientSession::connect_tcp(server.local_addr(), SessionConfig::default()).await?;

    let root = client.root().await?;
    assert_eq!(root.get("Name").await?, Value::Str("main".into()));
    assert_eq!(server.connection_count(), 1);

    let sessions = server.sessions();
    let principal = sessions[0].principal();
    assert!(principal.peer.is_some());
    assert_eq!(principal.name, principal.peer.map(|p| p.to_string()).unwrap_or_default());
    Ok(())
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let (_registry, root_obj, server) = serve(Arc::new(AllowAll)).await;
    let a = ClientSession::connect_tcp(server.local_addr(), SessionConfig::default().with_name("a"))
        .await
        .expect("connect");
    let b = ClientSession::connect_tcp(server.local_addr(), SessionConfig::default().with_name("b"))
        .await
        .expect("connect");

    let root_a = a.root().await.expect("root query");
    let root_b = b.root().await.expect("root query");
    assert_eq!(server.connection_count(), 2);

    root_a.set("Name", "from-a").await.expect("set");
    assert_eq!(root_obj.get("Name"), Some(Value::Str("from-a".into())));
    assert_eq!(root_b.get("Name").await.expect("get"), Value::Str("from-a".into()));

    a.close();
    eventually("session removal", || server.connection_count() == 1).await;
    assert!(b.is_connected());
}

#[tokio::test]
async fn test_rejected_connection_gets_no_session() {
    let (_registry, _root, server) = serve(Arc::new(DenyAll)).await;
    let client = ClientSession::connect_tcp(server.local_addr(), SessionConfig::default())
        .await
        .expect("tcp connect still succeeds");

    assert!(matches!(client.root().await, Err(Error::Disconnected)));
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_shutdown_disconnects_everyone() {
    let (_registry, _root, server) = serve(Arc::new(AllowAll)).await;
    let addr = server.local_addr();
    let client = ClientSession::connect_tcp(addr, SessionConfig::default())
        .await
        .expect("connect");
    client.root().await.expect("root query");

    server.shutdown().await;
    assert_eq!(server.connection_count(), 0);
    tokio::time::timeout(Duration::from_secs(5), client.closed())
        .await
        .expect("client notices shutdown");

    let late = ClientSession::connect_tcp(addr, SessionConfig::default()).await;
    if let Ok(late) = late {
        assert!(late.root().await.is_err());
    }
}
