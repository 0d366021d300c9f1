//! Distributed collection: finalization, acknowledgement and resurrection.
//!
//! Some tests run against a scripted peer built from a bare [`Pump`], so the
//! exact frames and their timing are under the test's control.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use tether::ClientSession;
use tether::DistributedObject;
use tether::DynamicObject;
use tether::FrameKind;
use tether::ObjectRegistry;
use tether::Principal;
use tether::Proxy;
use tether::ReferenceState;
use tether::ServerSession;
use tether::SessionConfig;
use tether::Value;
use tether::ValueKind;
use tether::transport::Pump;
use tether::wire::Frame;
use tether::wire::NoReferences;
use tether::wire::ReferenceWriter;
use tether::wire::WireObject;
use tether::wire::encode_single;
use tether::wire::encode_state;

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

// --- Scripted peer ---

struct ScriptedServer {
    pump: Arc<Pump>,
    inbound: mpsc::UnboundedReceiver<Frame>,
}

impl ScriptedServer {
    async fn next(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), self.inbound.recv())
            .await
            .expect("frame in time")
            .expect("connection open")
    }

    async fn silent_for(&mut self, period: Duration) -> bool {
        tokio::time::timeout(period, self.inbound.recv()).await.is_err()
    }

    fn reply(&self, request: &Frame, kind: FrameKind, payload: Option<bytes::Bytes>) {
        let count = u32::from(payload.is_some());
        self.pump.send(&request.reply(kind, count, payload)).expect("send");
    }
}

/// Sends every object as a first transfer with the given name.
struct AsNew(&'static str);

impl ReferenceWriter<Uuid> for AsNew {
    fn write_reference(&self, id: &Uuid) -> tether::wire::Result<WireObject<Uuid>> {
        Ok(WireObject::New {
            id: *id,
            type_name: "Root".into(),
            state: vec![("Name".into(), Value::Str(self.0.into()))],
        })
    }
}

/// Sends every object as an identity the client supposedly tracks.
struct AsKnown;

impl ReferenceWriter<Uuid> for AsKnown {
    fn write_reference(&self, id: &Uuid) -> tether::wire::Result<WireObject<Uuid>> {
        Ok(WireObject::Known(*id))
    }
}

fn scripted() -> (ClientSession, ScriptedServer) {
    let _ = tether::logging::try_init();
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let client = ClientSession::connect(client_end, SessionConfig::default().with_name("client"));
    let (pump, inbound) = Pump::start(server_end, &SessionConfig::default().with_name("scripted"));
    (client, ScriptedServer { pump, inbound })
}

async fn root_as<W: ReferenceWriter<Uuid>>(client: &ClientSession, server: &mut ScriptedServer, id: Uuid, refs: &W) -> Proxy {
    let task = {
        let client = client.clone();
        tokio::spawn(async move { client.root().await })
    };
    let query = server.next().await;
    assert_eq!(query.kind, FrameKind::RootQuery);
    let payload = encode_single(&Value::Object(id), refs).expect("encode");
    server.reply(&query, FrameKind::RootQuery, Some(payload));
    task.await.expect("task").expect("root")
}

// --- Test 1: Finalization Handshake ---

#[tokio::test]
async fn test_finalization_carries_ticket_and_ack_releases() {
    let (client, mut server) = scripted();
    let id = Uuid::new_v4();
    let root = root_as(&client, &mut server, id, &AsNew("first")).await;
    assert_eq!(client.resolver().state(id), ReferenceState::Live);

    drop(root);
    let finalized = server.next().await;
    assert_eq!(finalized.kind, FrameKind::ProxyFinalized);
    assert_eq!(finalized.object_id, id);
    assert_eq!(client.resolver().state(id), ReferenceState::FinalizePending);

    server.reply(&finalized, FrameKind::ProxyFinalized, None);
    eventually("release", || client.resolver().state(id) == ReferenceState::Untracked).await;
    assert_eq!(client.resolver().pending_len(), 0);
}

// --- Test 2: Resurrection ---

#[tokio::test]
async fn test_late_ack_does_not_release_resurrected_proxy() {
    let (client, mut server) = scripted();
    let id = Uuid::new_v4();
    let root = root_as(&client, &mut server, id, &AsNew("first")).await;

    drop(root);
    let finalized = server.next().await;
    assert_eq!(finalized.kind, FrameKind::ProxyFinalized);

    let back = client.resolve(id).await.expect("resolve").expect("still held");
    assert_eq!(back.cached("Name"), Some(Value::Str("first".into())));
    let resurrected = server.next().await;
    assert_eq!(resurrected.kind, FrameKind::ProxyResurrected);
    assert_eq!(resurrected.object_id, id);

    // The acknowledgement for the first finalization arrives after the resurrection.
    server.reply(&finalized, FrameKind::ProxyFinalized, None);
    let again = root_as(&client, &mut server, id, &AsKnown).await;
    assert!(again.same_instance(&back));
    assert_eq!(client.resolver().state(id), ReferenceState::Live);

    // Dropping the resurrected proxy starts a fresh handshake.
    drop(again);
    drop(back);
    let second = server.next().await;
    assert_eq!(second.kind, FrameKind::ProxyFinalized);
    assert_ne!(second.call_id, finalized.call_id);
}

#[tokio::test]
async fn test_first_transfer_onto_pending_proxy_resurrects_it() {
    let (client, mut server) = scripted();
    let id = Uuid::new_v4();
    let root = root_as(&client, &mut server, id, &AsNew("first")).await;
    let first_name = root.cached("Name");
    drop(root);
    assert_eq!(server.next().await.kind, FrameKind::ProxyFinalized);

    let root = root_as(&client, &mut server, id, &AsNew("second")).await;
    assert_ne!(root.cached("Name"), first_name);
    assert_eq!(root.cached("Name"), Some(Value::Str("second".into())));
    assert_eq!(server.next().await.kind, FrameKind::ProxyResurrected);
    assert_eq!(client.resolver().duplicate_binds(), 0);
}

// --- Test 3: Hollow and Duplicate Instances ---

#[tokio::test]
async fn test_unknown_identity_gets_hollow_proxy_then_state() {
    let (client, mut server) = scripted();
    let id = Uuid::new_v4();
    let root = root_as(&client, &mut server, id, &AsKnown).await;
    assert_eq!(root.id(), id);

    let lookup = server.next().await;
    assert_eq!(lookup.kind, FrameKind::UnresolvedReference);
    assert_eq!(lookup.object_id, id);
    let state = vec![("Name".to_string(), Value::<Uuid>::Str("filled".into()))];
    let payload = encode_state("Root", &state, &NoReferences).expect("encode");
    server.reply(&lookup, FrameKind::UnresolvedReference, Some(payload));

    eventually("population", || root.cached("Name") == Some(Value::Str("filled".into()))).await;
    assert_eq!(root.type_name(), "Root");
}

#[tokio::test]
async fn test_duplicate_instance_is_untracked_and_repopulated() {
    let (client, mut server) = scripted();
    let id = Uuid::new_v4();
    let first = root_as(&client, &mut server, id, &AsNew("first")).await;
    let second = root_as(&client, &mut server, id, &AsNew("second")).await;

    assert_eq!(first, second);
    assert!(!first.same_instance(&second));
    assert_eq!(client.resolver().duplicate_binds(), 1);
    assert_eq!(client.resolver().known_len(), 1);

    let lookup = server.next().await;
    assert_eq!(lookup.kind, FrameKind::UnresolvedReference);
    let state = vec![("Name".to_string(), Value::<Uuid>::Str("third".into()))];
    let payload = encode_state("Root", &state, &NoReferences).expect("encode");
    server.reply(&lookup, FrameKind::UnresolvedReference, Some(payload));

    eventually("repopulation", || second.cached("Name") == Some(Value::Str("third".into()))).await;
    assert_eq!(first.cached("Name"), Some(Value::Str("first".into())));

    // Nothing tracks the duplicate, so dropping it is silent.
    drop(second);
    assert!(server.silent_for(Duration::from_millis(100)).await);
    assert_eq!(client.resolver().state(id), ReferenceState::Live);
}

// --- Test 4: Against a Real Server ---

struct Served {
    _registry: Arc<ObjectRegistry>,
    child: Arc<DynamicObject>,
    server: Arc<ServerSession>,
    client: ClientSession,
}

fn served() -> Served {
    let _ = tether::logging::try_init();
    let registry = Arc::new(ObjectRegistry::new());
    let child = DynamicObject::builder("Child")
        .property("Name", ValueKind::Str, "leaf")
        .build(&registry);
    let returned = child.clone();
    let root = DynamicObject::builder("Root")
        .method("Child", vec![], ValueKind::Object, move |_, _| Ok(Value::Object(returned.handle())))
        .build(&registry);

    let (server_end, client_end) = tokio::io::duplex(64 * 1024);
    let server = ServerSession::start(
        server_end,
        root.handle(),
        registry.clone(),
        Principal::anonymous(),
        &SessionConfig::default().with_name("server"),
    );
    let client = ClientSession::connect(client_end, SessionConfig::default().with_name("client"));
    Served { _registry: registry, child, server, client }
}

async fn fetch_child(root: &Proxy) -> Proxy {
    root.query("Child", vec![])
        .await
        .expect("child")
        .into_object()
        .expect("an object")
}

#[tokio::test]
async fn test_dropped_proxy_is_forgotten_by_server() {
    let s = served();
    let root = s.client.root().await.expect("root query");
    let id = s.child.id();

    let child = fetch_child(&root).await;
    assert!(s.server.knows(id));

    drop(child);
    eventually("server release", || !s.server.knows(id)).await;
    eventually("client release", || s.client.resolver().state(id) == ReferenceState::Untracked).await;
    assert!(s.server.knows(root.id()));
}

#[tokio::test]
async fn test_churn_settles_consistently() {
    let s = served();
    let root = s.client.root().await.expect("root query");
    let id = s.child.id();

    for _ in 0..25 {
        let child = fetch_child(&root).await;
        assert_eq!(child.id(), id);
    }

    let kept = fetch_child(&root).await;
    eventually("settled", || s.client.resolver().pending_len() == 0).await;
    assert!(s.server.knows(id));
    assert_eq!(s.client.resolver().state(id), ReferenceState::Live);
    assert_eq!(kept.get("Name").await.expect("get"), Value::Str("leaf".into()));

    drop(kept);
    eventually("server release", || !s.server.knows(id)).await;
    eventually("client release", || s.client.resolver().state(id) == ReferenceState::Untracked).await;
}
