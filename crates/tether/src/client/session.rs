//! # Client Session Dispatcher
//!
//! Correlates requests with responses and routes server-initiated frames.
//!
//! ## Philosophy
//!
//! The inbound router never runs user code and never waits on the network.
//! Responses go straight to the waiting caller; event notifications go to a
//! bounded queue drained by a separate worker, so a slow handler cannot stall
//! replies. Proxies that need state from the server (hollow proxies and
//! duplicates) are filled in by a third task, because the decoder that
//! creates them cannot await.
//!
//! ## Invariants
//!
//! - Background tasks hold only the pieces they need or a weak reference to
//!   the session, so dropping every [`ClientSession`] handle shuts it down.
//! - When the connection ends, every pending call fails with
//!   [`Error::Disconnected`].

use std::sync::Arc;
use std::sync::Weak;

use dashmap::DashMap;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::net::ToSocketAddrs;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;
use uuid::Uuid;

use tether_wire::Frame;
use tether_wire::FrameKind;
use tether_wire::ReferenceReader;
use tether_wire::ReferenceWriter;
use tether_wire::Value;
use tether_wire::WireObject;
use tether_wire::decode_error;
use tether_wire::decode_single;
use tether_wire::decode_state;
use tether_wire::decode_values;

use crate::client::proxy::ClientValue;
use crate::client::proxy::Proxy;
use crate::client::proxy::ProxyCore;
use crate::client::proxy::ProxyEvent;
use crate::client::resolver::ClientResolver;
use crate::client::resolver::LifecycleListener;
use crate::config::SessionConfig;
use crate::error::Error;
use crate::error::Result;
use crate::transport::Pump;

type Pending = DashMap<Uuid, oneshot::Sender<Result<Frame>>>;

pub(crate) struct ClientInner {
    name: String,
    config: SessionConfig,
    pump: Arc<Pump>,
    pending: Arc<Pending>,
    resolver: Arc<ClientResolver>,
    populate: Arc<Notify>,
    this: Weak<ClientInner>,
}

/// A connection to a server, as seen by the client.
///
/// Cheap to clone. Proxies hold only a weak link back, so once every handle
/// is dropped the connection closes and proxy calls fail with
/// [`Error::Disconnected`].
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<ClientInner>,
}

impl ClientSession {
    /// Starts a session over an already connected stream.
    pub fn connect<S>(stream: S, config: SessionConfig) -> ClientSession
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (pump, inbound) = Pump::start(stream, &config);
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let name = config.name.clone();

        let inner = Arc::new_cyclic(|this: &Weak<ClientInner>| {
            let listener: Weak<dyn LifecycleListener> = this.clone();
            ClientInner {
                name: name.clone(),
                config,
                pump,
                pending: Arc::new(DashMap::new()),
                resolver: ClientResolver::new(name.clone(), listener),
                populate: Arc::new(Notify::new()),
                this: this.clone(),
            }
        });

        tokio::spawn(route_inbound(
            name.clone(),
            inner.pump.clone(),
            inbound,
            inner.pending.clone(),
            inner.resolver.clone(),
            events_tx,
        ));
        tokio::spawn(deliver_events(Arc::downgrade(&inner), events_rx));
        tokio::spawn(populate_proxies(Arc::downgrade(&inner), inner.populate.clone(), inner.pump.clone()));

        info!(session = %name, "client session started");
        ClientSession { inner }
    }

    /// Connects over TCP.
    pub async fn connect_tcp(addr: impl ToSocketAddrs, config: SessionConfig) -> Result<ClientSession> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::connect(stream, config))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The object the server exposes as its entry point.
    pub async fn root(&self) -> Result<Proxy> {
        let frame = Frame::request(FrameKind::RootQuery, Uuid::nil(), "", 0, None);
        let reply = self.inner.call(frame).await?;
        match decode_single(reply.payload, &*self.inner)? {
            Value::Object(proxy) => Ok(proxy),
            other => Err(Error::Protocol(format!("root query returned {}", other.kind_name()))),
        }
    }

    /// Finds a proxy by identity, asking the server if it is not held locally.
    ///
    /// `Ok(None)` means the server has no such object.
    pub async fn resolve(&self, id: Uuid) -> Result<Option<Proxy>> {
        if let Some(proxy) = self.inner.resolver.resolve(id) {
            return Ok(Some(proxy));
        }
        let frame = Frame::request(FrameKind::UnresolvedReference, id, "", 0, None);
        let reply = self.inner.call(frame).await?;
        let Some((type_name, state)) = decode_state(reply.payload, &*self.inner)? else {
            return Ok(None);
        };
        let core = ProxyCore::with_state(id, type_name, state, self.inner.this.clone());
        Ok(Some(self.inner.resolver.bind(core)))
    }

    pub fn resolver(&self) -> &ClientResolver {
        &self.inner.resolver
    }

    pub fn pump(&self) -> &Arc<Pump> {
        &self.inner.pump
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.pump.is_closed()
    }

    /// Disconnects. Pending calls fail with [`Error::Disconnected`].
    pub fn close(&self) {
        self.inner.pump.close();
    }

    pub async fn closed(&self) {
        self.inner.pump.closed().await;
    }
}

impl ClientInner {
    /// Sends a request and waits for its response.
    ///
    /// Exception replies come back as [`Error::Remote`].
    pub(crate) async fn call(&self, frame: Frame) -> Result<Frame> {
        let call_id = frame.call_id;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id, tx);

        if let Err(e) = self.pump.send(&frame) {
            self.pending.remove(&call_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.pending.remove(&call_id);
                Err(Error::Disconnected)
            }
            Err(_) => {
                self.pending.remove(&call_id);
                warn!(session = %self.name, call = %call_id, kind = %frame.kind, "call timed out");
                Err(Error::Timeout)
            }
        }
    }

    fn deliver_event(&self, frame: Frame) {
        let args: Vec<ClientValue> = match decode_values(frame.payload, self) {
            Ok(args) => args,
            Err(e) => {
                warn!(session = %self.name, object = %frame.object_id, error = %e, "undecodable notification");
                return;
            }
        };
        let Some(proxy) = self.resolver.resolve(frame.object_id) else {
            debug!(session = %self.name, object = %frame.object_id, "notification for untracked object");
            return;
        };
        proxy.core().on_notification(ProxyEvent { name: frame.member, args });
    }

    async fn populate(&self, proxy: &Proxy) {
        let frame = Frame::request(FrameKind::UnresolvedReference, proxy.id(), "", 0, None);
        let state = match self.call(frame).await {
            Ok(reply) => decode_state(reply.payload, self).map_err(Error::from),
            Err(e) => Err(e),
        };
        match state {
            Ok(Some((type_name, state))) => {
                proxy.core().apply_state(&type_name, state);
                trace!(session = %self.name, object = %proxy.id(), "proxy populated");
            }
            Ok(None) => debug!(session = %self.name, object = %proxy.id(), "object gone before population"),
            Err(e) => debug!(session = %self.name, object = %proxy.id(), error = %e, "population failed"),
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.pump.close();
    }
}

impl LifecycleListener for ClientInner {
    fn finalized(&self, id: Uuid, ticket: Uuid) {
        // The ticket rides in the call id so the acknowledgement can be matched.
        let frame = Frame {
            kind: FrameKind::ProxyFinalized,
            call_id: ticket,
            object_id: id,
            member: String::new(),
            param_count: 0,
            payload: None,
        };
        if let Err(e) = self.pump.send(&frame) {
            debug!(session = %self.name, object = %id, error = %e, "finalization not sent");
        }
    }

    fn resurrected(&self, id: Uuid) {
        let frame = Frame::request(FrameKind::ProxyResurrected, id, "", 0, None);
        if let Err(e) = self.pump.send(&frame) {
            debug!(session = %self.name, object = %id, error = %e, "resurrection not sent");
        }
    }
}

impl ReferenceWriter<Proxy> for ClientInner {
    fn write_reference(&self, proxy: &Proxy) -> tether_wire::Result<WireObject<Proxy>> {
        Ok(WireObject::Known(proxy.id()))
    }
}

impl ReferenceReader<Proxy> for ClientInner {
    fn read_known(&self, id: Uuid) -> tether_wire::Result<Proxy> {
        if let Some(proxy) = self.resolver.resolve(id) {
            return Ok(proxy);
        }
        // Released locally while the server was sending: start hollow, fill in later.
        debug!(session = %self.name, object = %id, "hollow proxy created");
        let proxy = self.resolver.bind(ProxyCore::new(id, "", self.this.clone()));
        self.resolver.queue_population(proxy.clone());
        self.populate.notify_one();
        Ok(proxy)
    }

    fn read_new(&self, id: Uuid, type_name: String, state: Vec<(String, ClientValue)>) -> tether_wire::Result<Proxy> {
        let proxy = self.resolver.bind(ProxyCore::with_state(id, type_name, state, self.this.clone()));
        if self.resolver.repopulation_len() > 0 {
            self.populate.notify_one();
        }
        Ok(proxy)
    }
}

async fn route_inbound(
    name: String,
    pump: Arc<Pump>,
    mut inbound: mpsc::UnboundedReceiver<Frame>,
    pending: Arc<Pending>,
    resolver: Arc<ClientResolver>,
    events: mpsc::Sender<Frame>,
) {
    while let Some(frame) = inbound.recv().await {
        match frame.kind {
            FrameKind::EventNotification => match events.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(frame)) => {
                    warn!(session = %name, object = %frame.object_id, event = %frame.member, "event queue full, notification dropped");
                }
                Err(TrySendError::Closed(_)) => {}
            },
            FrameKind::ProxyFinalized => {
                resolver.acknowledge_finalized(frame.object_id, frame.call_id);
            }
            FrameKind::ProxyResurrected => {
                debug!(session = %name, object = %frame.object_id, "resurrection acknowledged");
            }
            _ => match pending.remove(&frame.call_id) {
                Some((_, tx)) => {
                    let result = match frame.kind {
                        FrameKind::Exception => match decode_error(frame.payload) {
                            Ok(remote) => Err(Error::Remote(remote)),
                            Err(e) => Err(Error::Wire(e)),
                        },
                        _ => Ok(frame),
                    };
                    let _ = tx.send(result);
                }
                None => {
                    warn!(session = %name, call = %frame.call_id, kind = %frame.kind, "response for unknown call dropped");
                }
            },
        }
    }

    pump.close();
    notify_all_pending(&pending, Error::Disconnected);
    // No acknowledgement can arrive any more.
    resolver.dispose();
    info!(session = %name, "client session ended");
}

fn notify_all_pending(pending: &Pending, error: Error) {
    let keys: Vec<Uuid> = pending.iter().map(|e| *e.key()).collect();
    for key in keys {
        if let Some((_, tx)) = pending.remove(&key) {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

async fn deliver_events(session: Weak<ClientInner>, mut events: mpsc::Receiver<Frame>) {
    while let Some(frame) = events.recv().await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        inner.deliver_event(frame);
    }
}

async fn populate_proxies(session: Weak<ClientInner>, wake: Arc<Notify>, pump: Arc<Pump>) {
    loop {
        tokio::select! {
            _ = wake.notified() => {}
            _ = pump.closed() => break,
        }
        let Some(inner) = session.upgrade() else {
            break;
        };
        for proxy in inner.resolver.take_repopulation() {
            inner.populate(&proxy).await;
        }
    }
}
