//! # Proxies
//!
//! Client-side stand-ins for real objects.
//!
//! A [`Proxy`] is a cheap, clonable handle. All clones share one anchor;
//! when the last clone goes away the anchor's `Drop` is the finalization
//! hook that hands the proxy to the [`ClientResolver`]. The resolver keeps
//! the shared core alive while the server is told, and can hand out a new
//! anchor for the same core if the identity shows up again before the
//! server acknowledges (resurrection).
//!
//! ## Invariants
//!
//! - Replaced cache values and removed handlers are dropped outside the
//!   locks that guarded them: they may hold the last clone of another proxy.
//! - A disposed proxy never talks to the server again. Reads return `Null`,
//!   writes are ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use parking_lot::RwLock;
use uuid::Uuid;

use tether_wire::Frame;
use tether_wire::FrameKind;
use tether_wire::PROPERTY_CHANGED;
use tether_wire::Value;
use tether_wire::decode_single;
use tether_wire::encode_single;
use tether_wire::encode_values;

use crate::client::resolver::ClientResolver;
use crate::client::session::ClientInner;
use crate::error::Error;
use crate::error::Result;

/// Values as the client sees them: objects are proxies.
pub type ClientValue = Value<Proxy>;

/// Local event raised when a proxy is disposed.
pub const DISPOSED: &str = "Disposed";

pub type EventHandler = Arc<dyn Fn(&ProxyEvent) + Send + Sync>;

/// An event delivered to local handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyEvent {
    pub name: String,
    pub args: Vec<ClientValue>,
}

/// Token returned when a handler is added.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct HandlerId(u64);

/// State shared by every anchor a proxy identity ever had.
pub(crate) struct ProxyCore {
    id: Uuid,
    type_name: RwLock<String>,
    cache: Mutex<HashMap<String, ClientValue>>,
    handlers: Mutex<HashMap<String, Vec<(HandlerId, EventHandler)>>>,
    next_handler: AtomicU64,
    disposed: AtomicBool,
    session: RwLock<Weak<ClientInner>>,
    /// Set when finalization hands the core to the pending table, cleared on resurrection.
    pub(crate) finalize_requested: AtomicBool,
}

impl ProxyCore {
    pub(crate) fn new(id: Uuid, type_name: impl Into<String>, session: Weak<ClientInner>) -> Arc<Self> {
        Arc::new(Self {
            id,
            type_name: RwLock::new(type_name.into()),
            cache: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            next_handler: AtomicU64::new(1),
            disposed: AtomicBool::new(false),
            session: RwLock::new(session),
            finalize_requested: AtomicBool::new(false),
        })
    }

    pub(crate) fn with_state(
        id: Uuid,
        type_name: impl Into<String>,
        state: Vec<(String, ClientValue)>,
        session: Weak<ClientInner>,
    ) -> Arc<Self> {
        let core = Self::new(id, type_name, session);
        core.cache.lock().extend(state);
        core
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    fn session(&self) -> Result<Arc<ClientInner>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        self.session.read().upgrade().ok_or(Error::Disconnected)
    }

    fn cached(&self, name: &str) -> Option<ClientValue> {
        self.cache.lock().get(name).cloned()
    }

    /// Returns the replaced value so the caller drops it after the lock.
    fn store(&self, name: &str, value: ClientValue) -> Option<ClientValue> {
        self.cache.lock().insert(name.to_string(), value)
    }

    /// Overwrites cached members with fresh values from the server.
    pub(crate) fn apply_state(&self, type_name: &str, state: Vec<(String, ClientValue)>) {
        if !type_name.is_empty() && *self.type_name.read() != type_name {
            *self.type_name.write() = type_name.to_string();
        }
        let replaced: Vec<ClientValue> = {
            let mut cache = self.cache.lock();
            state.into_iter().filter_map(|(name, value)| cache.insert(name, value)).collect()
        };
        drop(replaced);
    }

    /// Takes over the cached state of a second instance for the same identity.
    pub(crate) fn adopt(&self, other: &ProxyCore) {
        let state: Vec<(String, ClientValue)> = other.cache.lock().drain().collect();
        let type_name = other.type_name.read().clone();
        self.apply_state(&type_name, state);
    }

    /// Applies an inbound event notification.
    pub(crate) fn on_notification(&self, event: ProxyEvent) {
        if event.name == PROPERTY_CHANGED {
            if let [Value::Str(name), value] = event.args.as_slice() {
                let _replaced = self.store(name, value.clone());
            }
        }
        self.raise(&event);
    }

    fn raise(&self, event: &ProxyEvent) {
        let handlers: Vec<EventHandler> = self
            .handlers
            .lock()
            .get(&event.name)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(event);
        }
    }

    /// Returns the new handler's id and whether it is the first for `event`.
    fn add_handler(&self, event: &str, handler: EventHandler) -> (HandlerId, bool) {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.lock();
        let list = handlers.entry(event.to_string()).or_default();
        let first = list.is_empty();
        list.push((id, handler));
        (id, first)
    }

    /// Returns the removed handler and whether it was the last for `event`.
    fn remove_handler(&self, event: &str, id: HandlerId) -> (Option<EventHandler>, bool) {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(event) else {
            return (None, false);
        };
        let Some(pos) = list.iter().position(|(hid, _)| *hid == id) else {
            return (None, false);
        };
        let (_, removed) = list.remove(pos);
        let last = list.is_empty();
        if last {
            handlers.remove(event);
        }
        (Some(removed), last)
    }
}

/// Holds a core on behalf of every clone of one [`Proxy`].
pub(crate) struct Anchor {
    core: Arc<ProxyCore>,
    generation: u64,
    resolver: Weak<ClientResolver>,
}

impl Drop for Anchor {
    fn drop(&mut self) {
        if let Some(resolver) = self.resolver.upgrade() {
            resolver.on_unreachable(&self.core, self.generation);
        }
    }
}

/// A client-side handle to a remote object.
///
/// Clones share identity. Once every clone is dropped the server is told the
/// client no longer needs the object.
#[derive(Clone)]
pub struct Proxy {
    anchor: Arc<Anchor>,
}

impl Proxy {
    /// A proxy whose unreachability is reported to `resolver`.
    pub(crate) fn tracked(core: Arc<ProxyCore>, generation: u64, resolver: Weak<ClientResolver>) -> Self {
        Self { anchor: Arc::new(Anchor { core, generation, resolver }) }
    }

    /// A proxy nothing tracks; dropping it has no distributed effect.
    pub(crate) fn untracked(core: Arc<ProxyCore>) -> Self {
        Self::tracked(core, 0, Weak::new())
    }

    pub(crate) fn from_anchor(anchor: Arc<Anchor>) -> Self {
        Self { anchor }
    }

    pub(crate) fn downgrade(&self) -> Weak<Anchor> {
        Arc::downgrade(&self.anchor)
    }

    pub(crate) fn core(&self) -> &Arc<ProxyCore> {
        &self.anchor.core
    }

    pub(crate) fn generation(&self) -> u64 {
        self.anchor.generation
    }

    pub fn id(&self) -> Uuid {
        self.anchor.core.id
    }

    pub fn type_name(&self) -> String {
        self.anchor.core.type_name.read().clone()
    }

    /// Whether both handles share one underlying instance, not just identity.
    pub fn same_instance(&self, other: &Proxy) -> bool {
        Arc::ptr_eq(self.core(), other.core())
    }

    pub fn is_disposed(&self) -> bool {
        self.core().disposed.load(Ordering::SeqCst)
    }

    /// Last known value of a member, without a round trip.
    pub fn cached(&self, name: &str) -> Option<ClientValue> {
        self.core().cached(name)
    }

    /// Reads a property from the server and caches it.
    pub async fn get(&self, name: &str) -> Result<ClientValue> {
        if self.is_disposed() {
            return Ok(Value::Null);
        }
        let session = self.core().session()?;
        let frame = Frame::request(FrameKind::PropertyGet, self.id(), name, 0, None);
        let reply = session.call(frame).await?;
        let value = decode_single(reply.payload, &*session)?;
        let _replaced = self.core().store(name, value.clone());
        Ok(value)
    }

    /// Writes a property. Nothing is sent if the cached value already matches.
    pub async fn set(&self, name: &str, value: impl Into<ClientValue>) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        let value = value.into();
        if self.cached(name).as_ref() == Some(&value) {
            return Ok(());
        }
        let session = self.core().session()?;
        let payload = encode_single(&value, &*session)?;
        let frame = Frame::request(FrameKind::PropertySet, self.id(), name, 1, Some(payload));
        session.call(frame).await?;
        let _replaced = self.core().store(name, value);
        Ok(())
    }

    /// Calls a method and waits for it to finish, discarding the result.
    pub async fn invoke(&self, name: &str, args: Vec<ClientValue>) -> Result<()> {
        self.query(name, args).await.map(|_| ())
    }

    /// Calls a method and returns its result.
    pub async fn query(&self, name: &str, args: Vec<ClientValue>) -> Result<ClientValue> {
        let session = self.core().session()?;
        let payload = encode_values(&args, &*session)?;
        let frame = Frame::request(FrameKind::MethodCall, self.id(), name, args.len() as u32, Some(payload));
        let reply = session.call(frame).await?;
        Ok(decode_single(reply.payload, &*session)?)
    }

    /// Adds a local handler. Only the first handler for an event subscribes on the server.
    pub async fn add_event_handler<F>(&self, event: &str, handler: F) -> Result<HandlerId>
    where
        F: Fn(&ProxyEvent) + Send + Sync + 'static,
    {
        let (id, first) = self.core().add_handler(event, Arc::new(handler));
        if first {
            if let Err(e) = self.subscription(FrameKind::EventSubscribe, event).await {
                let (removed, _) = self.core().remove_handler(event, id);
                drop(removed);
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Removes a local handler. Only the last removal unsubscribes on the server.
    pub async fn remove_event_handler(&self, event: &str, id: HandlerId) -> Result<bool> {
        let (removed, last) = self.core().remove_handler(event, id);
        let found = removed.is_some();
        drop(removed);
        if last && event != DISPOSED && !self.is_disposed() {
            self.subscription(FrameKind::EventUnsubscribe, event).await?;
        }
        Ok(found)
    }

    /// Watches property changes pushed by the server.
    pub async fn on_property_changed<F>(&self, handler: F) -> Result<HandlerId>
    where
        F: Fn(&str, &ClientValue) + Send + Sync + 'static,
    {
        self.add_event_handler(PROPERTY_CHANGED, move |event: &ProxyEvent| {
            if let [Value::Str(name), value] = event.args.as_slice() {
                handler(name, value);
            }
        })
        .await
    }

    /// Runs `handler` when this proxy is disposed. Purely local.
    pub fn on_disposed<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ProxyEvent) + Send + Sync + 'static,
    {
        self.core().add_handler(DISPOSED, Arc::new(handler)).0
    }

    /// Detaches from the session and raises the local disposed event.
    ///
    /// This ends local use only. The server forgets the object when the
    /// proxy becomes unreachable, not when it is disposed.
    pub fn dispose(&self) {
        let core = self.core();
        if core.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        *core.session.write() = Weak::new();
        core.raise(&ProxyEvent { name: DISPOSED.to_string(), args: Vec::new() });
    }

    async fn subscription(&self, kind: FrameKind, event: &str) -> Result<()> {
        let session = self.core().session()?;
        let frame = Frame::request(kind, self.id(), event, 0, None);
        session.call(frame).await?;
        Ok(())
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Proxy {}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Proxy({} {})", self.type_name(), self.id())
    }
}
