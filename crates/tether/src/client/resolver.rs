//! # Client Reference Resolver
//!
//! Maps server identities to the proxies of one client session and runs the
//! client half of the distributed collection protocol.
//!
//! ## Philosophy
//!
//! Every identity is in one of three states:
//!
//! - **Live**: some [`Proxy`] clone is reachable. The table holds only weak
//!   references, so it never keeps a proxy alive.
//! - **Finalize pending**: the last clone was dropped. The core is held
//!   strongly under a fresh ticket while the server is told. If the identity
//!   comes back before the server acknowledges that ticket, the same core
//!   gets a new anchor (resurrection) and the server is told again.
//! - **Untracked**: neither of the above.
//!
//! Anchors carry a generation. A finalization whose generation no longer
//! matches the table was overtaken by a resurrection and is ignored, which
//! is what lets a resurrected proxy finalize again later.
//!
//! ## Invariants
//!
//! - An identity is never live and pending at the same time.
//! - Pending entries leave the table only on an acknowledgement carrying
//!   their own ticket.
//! - No proxy, anchor or core is dropped while the table lock is held:
//!   their drops can re-enter this resolver. Listener calls happen after
//!   the lock is released for the same reason.
//! - Finalized and resurrected notices reach the listener in the order of
//!   the table transitions that caused them. The send-order lock is taken
//!   before the table lock is released and held across the listener call,
//!   so the server never sees a resurrection overtake its finalization.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use parking_lot::MutexGuard;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::client::proxy::Anchor;
use crate::client::proxy::Proxy;
use crate::client::proxy::ProxyCore;

/// Told about finalization and resurrection once the table is consistent.
pub trait LifecycleListener: Send + Sync {
    fn finalized(&self, id: Uuid, ticket: Uuid);
    fn resurrected(&self, id: Uuid);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReferenceState {
    Live,
    FinalizePending,
    Untracked,
}

struct KnownEntry {
    anchor: Weak<Anchor>,
    core: Weak<ProxyCore>,
    generation: u64,
}

struct PendingEntry {
    core: Arc<ProxyCore>,
    ticket: Uuid,
}

#[derive(Default)]
struct Tables {
    known: HashMap<Uuid, KnownEntry>,
    pending: HashMap<Uuid, PendingEntry>,
    /// Duplicate instances waiting for fresh state from the server.
    repopulate: Vec<Proxy>,
}

enum Bound<'a> {
    Existing(Proxy),
    Inserted { proxy: Proxy, stale: Option<Arc<ProxyCore>> },
    Duplicate { tracked: Proxy, fresh: Proxy },
    Resurrected { proxy: Proxy, incoming: Arc<ProxyCore>, order: MutexGuard<'a, ()> },
}

enum Found<'a> {
    Live(Proxy),
    Revived(Proxy),
    Resurrected(Proxy, MutexGuard<'a, ()>),
    Miss,
}

pub struct ClientResolver {
    session: String,
    tables: Mutex<Tables>,
    /// Orders listener calls. Always taken while `tables` is held, never the other way round.
    send_order: Mutex<()>,
    listener: Weak<dyn LifecycleListener>,
    next_generation: AtomicU64,
    duplicate_binds: AtomicU64,
    this: Weak<ClientResolver>,
}

impl ClientResolver {
    pub fn new(session: impl Into<String>, listener: Weak<dyn LifecycleListener>) -> Arc<Self> {
        let session = session.into();
        Arc::new_cyclic(|this| Self {
            session,
            tables: Mutex::new(Tables::default()),
            send_order: Mutex::new(()),
            listener,
            next_generation: AtomicU64::new(1),
            duplicate_binds: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    /// Finds the proxy for `id` without talking to the server.
    ///
    /// A finalize-pending identity is resurrected.
    pub fn resolve(&self, id: Uuid) -> Option<Proxy> {
        let found = {
            let mut tables = self.tables.lock();
            let anchor = tables.known.get(&id).and_then(|e| e.anchor.upgrade());
            if let Some(anchor) = anchor {
                Found::Live(Proxy::from_anchor(anchor))
            } else if tables.known.contains_key(&id) {
                // The last clone is on its way out; its finalization will see a new generation.
                let core = tables.known.get(&id).and_then(|e| e.core.upgrade());
                match core {
                    Some(core) => Found::Revived(self.anchor(&mut tables, core)),
                    None => {
                        tables.known.remove(&id);
                        Found::Miss
                    }
                }
            } else if let Some(pending) = tables.pending.remove(&id) {
                let proxy = self.anchor(&mut tables, pending.core);
                Found::Resurrected(proxy, self.send_order.lock())
            } else {
                Found::Miss
            }
        };

        match found {
            Found::Live(proxy) | Found::Revived(proxy) => Some(proxy),
            Found::Resurrected(proxy, order) => {
                debug!(session = %self.session, object = %id, "proxy resurrected");
                self.announce(order, |listener| listener.resurrected(id));
                Some(proxy)
            }
            Found::Miss => None,
        }
    }

    /// Records a freshly built core and returns the proxy callers should use.
    ///
    /// If a different live instance already exists for the identity, the new
    /// one is returned untracked and queued for repopulation.
    pub(crate) fn bind(&self, core: Arc<ProxyCore>) -> Proxy {
        let id = core.id();
        let bound = {
            let mut tables = self.tables.lock();
            let anchor = tables.known.get(&id).and_then(|e| e.anchor.upgrade());
            if let Some(anchor) = anchor {
                let tracked = Proxy::from_anchor(anchor);
                if Arc::ptr_eq(tracked.core(), &core) {
                    Bound::Existing(tracked)
                } else {
                    let fresh = Proxy::untracked(core);
                    tables.repopulate.push(fresh.clone());
                    Bound::Duplicate { tracked, fresh }
                }
            } else if let Some(pending) = tables.pending.remove(&id) {
                let proxy = self.anchor(&mut tables, pending.core);
                Bound::Resurrected { proxy, incoming: core, order: self.send_order.lock() }
            } else {
                let stale = tables.known.remove(&id).and_then(|e| e.core.upgrade());
                let proxy = self.anchor(&mut tables, core);
                Bound::Inserted { proxy, stale }
            }
        };

        match bound {
            Bound::Existing(proxy) => proxy,
            Bound::Inserted { proxy, stale } => {
                drop(stale);
                proxy
            }
            Bound::Duplicate { tracked, fresh } => {
                let total = self.duplicate_binds.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(session = %self.session, object = %id, total, "second live instance for identity");
                drop(tracked);
                fresh
            }
            Bound::Resurrected { proxy, incoming, order } => {
                debug!(session = %self.session, object = %id, "pending proxy rebound");
                self.announce(order, |listener| listener.resurrected(id));
                // Adopting may drop cached proxies, so it waits until the send order is released.
                proxy.core().adopt(&incoming);
                drop(incoming);
                proxy
            }
        }
    }

    /// Finalization hook, called when the last clone of an anchor drops.
    pub(crate) fn on_unreachable(&self, core: &Arc<ProxyCore>, generation: u64) {
        let id = core.id();
        let (ticket, displaced, order) = {
            let mut tables = self.tables.lock();
            let current = tables
                .known
                .get(&id)
                .is_some_and(|e| e.generation == generation && std::ptr::eq(e.core.as_ptr(), Arc::as_ptr(core)));
            if !current || core.finalize_requested.swap(true, Ordering::SeqCst) {
                return;
            }
            tables.known.remove(&id);
            let ticket = Uuid::new_v4();
            let displaced = tables.pending.insert(id, PendingEntry { core: core.clone(), ticket });
            (ticket, displaced, self.send_order.lock())
        };

        debug!(session = %self.session, object = %id, ticket = %ticket, "proxy finalized");
        self.announce(order, |listener| listener.finalized(id, ticket));
        drop(displaced);
    }

    /// The server processed a finalization. Stale tickets are ignored.
    pub fn acknowledge_finalized(&self, id: Uuid, ticket: Uuid) -> bool {
        let released = {
            let mut tables = self.tables.lock();
            match tables.pending.get(&id) {
                Some(entry) if entry.ticket == ticket => tables.pending.remove(&id),
                _ => None,
            }
        };
        match released {
            Some(entry) => {
                drop(entry);
                debug!(session = %self.session, object = %id, "proxy released");
                true
            }
            None => {
                debug!(session = %self.session, object = %id, ticket = %ticket, "finalize ack for resurrected or unknown proxy");
                false
            }
        }
    }

    pub fn state(&self, id: Uuid) -> ReferenceState {
        let tables = self.tables.lock();
        if tables.pending.contains_key(&id) {
            ReferenceState::FinalizePending
        } else if tables.known.get(&id).is_some_and(|e| e.anchor.strong_count() > 0) {
            ReferenceState::Live
        } else {
            ReferenceState::Untracked
        }
    }

    /// Identities with a live proxy.
    pub fn known_len(&self) -> usize {
        self.tables.lock().known.values().filter(|e| e.anchor.strong_count() > 0).count()
    }

    pub fn pending_len(&self) -> usize {
        self.tables.lock().pending.len()
    }

    /// How many times a second live instance was bound for an identity.
    pub fn duplicate_binds(&self) -> u64 {
        self.duplicate_binds.load(Ordering::Relaxed)
    }

    pub(crate) fn queue_population(&self, proxy: Proxy) {
        self.tables.lock().repopulate.push(proxy);
    }

    pub(crate) fn take_repopulation(&self) -> Vec<Proxy> {
        std::mem::take(&mut self.tables.lock().repopulate)
    }

    pub fn repopulation_len(&self) -> usize {
        self.tables.lock().repopulate.len()
    }

    /// Forgets every identity. Proxies still alive keep working locally.
    pub fn dispose(&self) {
        let (known, pending, repopulate) = {
            let mut tables = self.tables.lock();
            (
                std::mem::take(&mut tables.known),
                std::mem::take(&mut tables.pending),
                std::mem::take(&mut tables.repopulate),
            )
        };
        debug!(session = %self.session, known = known.len(), pending = pending.len(), "resolver disposed");
        drop(repopulate);
        drop(pending);
    }

    /// Gives `core` a new anchor and generation and marks it live.
    fn anchor(&self, tables: &mut Tables, core: Arc<ProxyCore>) -> Proxy {
        let id = core.id();
        core.finalize_requested.store(false, Ordering::SeqCst);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let proxy = Proxy::tracked(core, generation, self.this.clone());
        let entry = KnownEntry {
            anchor: proxy.downgrade(),
            core: Arc::downgrade(proxy.core()),
            generation,
        };
        tables.known.insert(id, entry);
        proxy
    }

    /// Calls the listener, then releases the send order taken with the table transition.
    fn announce(&self, order: MutexGuard<'_, ()>, notify: impl FnOnce(&dyn LifecycleListener)) {
        let listener = self.listener.upgrade();
        if let Some(listener) = &listener {
            notify(listener.as_ref());
        }
        drop(order);
        drop(listener);
    }
}

#[cfg(test)]
mod tests {
    use tether_wire::Value;

    use super::*;
    use crate::client::session::ClientInner;
    use crate::dynamic::DynamicObject;
    use crate::object::ObjectRegistry;
    use crate::server::resolver::ServerResolver;

    #[derive(Debug, Clone, PartialEq)]
    enum Lifecycle {
        Finalized(Uuid, Uuid),
        Resurrected(Uuid),
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Lifecycle>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<Lifecycle> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl LifecycleListener for Recorder {
        fn finalized(&self, id: Uuid, ticket: Uuid) {
            self.events.lock().push(Lifecycle::Finalized(id, ticket));
        }

        fn resurrected(&self, id: Uuid) {
            self.events.lock().push(Lifecycle::Resurrected(id));
        }
    }

    fn setup() -> (Arc<Recorder>, Arc<ClientResolver>) {
        let recorder = Arc::new(Recorder::default());
        let listener: Weak<dyn LifecycleListener> = Arc::downgrade(&recorder) as Weak<dyn LifecycleListener>;
        (recorder, ClientResolver::new("test", listener))
    }

    fn core(id: Uuid) -> Arc<ProxyCore> {
        ProxyCore::new(id, "Thing", Weak::<ClientInner>::new())
    }

    fn ticket_of(events: &[Lifecycle]) -> Uuid {
        match events {
            [Lifecycle::Finalized(_, ticket)] => *ticket,
            other => panic!("expected one finalization, got {:?}", other),
        }
    }

    #[test]
    fn test_drop_finalizes_once() {
        let (recorder, resolver) = setup();
        let id = Uuid::new_v4();
        let proxy = resolver.bind(core(id));
        let clone = proxy.clone();
        assert_eq!(resolver.state(id), ReferenceState::Live);

        drop(proxy);
        assert!(recorder.take().is_empty());
        drop(clone);

        let events = recorder.take();
        assert!(matches!(events.as_slice(), [Lifecycle::Finalized(fid, _)] if *fid == id));
        assert_eq!(resolver.state(id), ReferenceState::FinalizePending);
        assert_eq!(resolver.known_len(), 0);
        assert_eq!(resolver.pending_len(), 1);
    }

    #[test]
    fn test_ack_releases_only_matching_ticket() {
        let (recorder, resolver) = setup();
        let id = Uuid::new_v4();
        drop(resolver.bind(core(id)));
        let ticket = ticket_of(&recorder.take());

        assert!(!resolver.acknowledge_finalized(id, Uuid::new_v4()));
        assert_eq!(resolver.state(id), ReferenceState::FinalizePending);
        assert!(resolver.acknowledge_finalized(id, ticket));
        assert_eq!(resolver.state(id), ReferenceState::Untracked);
        assert!(resolver.resolve(id).is_none());
    }

    #[test]
    fn test_resurrected_proxy_finalizes_again() {
        let (recorder, resolver) = setup();
        let id = Uuid::new_v4();
        let original = core(id);
        drop(resolver.bind(original.clone()));
        let first = ticket_of(&recorder.take());

        let back = resolver.resolve(id).expect("pending proxy resurrects");
        assert!(Arc::ptr_eq(back.core(), &original));
        assert_eq!(recorder.take(), vec![Lifecycle::Resurrected(id)]);
        assert_eq!(resolver.state(id), ReferenceState::Live);

        // The server's ack for the first finalization arrives late.
        assert!(!resolver.acknowledge_finalized(id, first));
        assert_eq!(resolver.state(id), ReferenceState::Live);

        drop(back);
        let second = ticket_of(&recorder.take());
        assert_ne!(first, second);
        assert!(resolver.acknowledge_finalized(id, second));
        assert_eq!(resolver.state(id), ReferenceState::Untracked);
    }

    #[test]
    fn test_duplicate_bind_is_counted_and_queued() {
        let (recorder, resolver) = setup();
        let id = Uuid::new_v4();
        let first = resolver.bind(core(id));
        let second = resolver.bind(core(id));

        assert_eq!(first, second);
        assert!(!first.same_instance(&second));
        assert_eq!(resolver.known_len(), 1);
        assert_eq!(resolver.duplicate_binds(), 1);
        assert_eq!(resolver.repopulation_len(), 1);

        // The duplicate is untracked: dropping it says nothing to the server.
        drop(second);
        drop(resolver.take_repopulation());
        assert!(recorder.take().is_empty());
        assert_eq!(resolver.state(id), ReferenceState::Live);
        drop(first);
    }

    #[test]
    fn test_bind_onto_pending_keeps_instance_and_takes_new_state() {
        let (recorder, resolver) = setup();
        let id = Uuid::new_v4();
        let original = ProxyCore::with_state(
            id,
            "Thing",
            vec![("Name".to_string(), Value::Str("old".into()))],
            Weak::<ClientInner>::new(),
        );
        drop(resolver.bind(original.clone()));
        recorder.take();

        let incoming = ProxyCore::with_state(
            id,
            "Thing",
            vec![("Name".to_string(), Value::Str("new".into()))],
            Weak::<ClientInner>::new(),
        );
        let proxy = resolver.bind(incoming);
        assert!(Arc::ptr_eq(proxy.core(), &original));
        assert_eq!(proxy.cached("Name"), Some(Value::Str("new".into())));
        assert_eq!(recorder.take(), vec![Lifecycle::Resurrected(id)]);
        assert_eq!(resolver.duplicate_binds(), 0);
    }

    #[test]
    fn test_bind_same_core_returns_existing() {
        let (_recorder, resolver) = setup();
        let id = Uuid::new_v4();
        let shared = core(id);
        let a = resolver.bind(shared.clone());
        let b = resolver.bind(shared);
        assert!(a.same_instance(&b));
        assert_eq!(a.generation(), b.generation());
        assert_eq!(resolver.duplicate_binds(), 0);
    }

    #[test]
    fn test_untracked_drop_is_silent() {
        let (recorder, resolver) = setup();
        let proxy = Proxy::untracked(core(Uuid::new_v4()));
        drop(proxy);
        assert!(recorder.take().is_empty());
        assert_eq!(resolver.pending_len(), 0);
    }

    /// Holds the first finalization open so another thread can race it.
    struct SlowFinalize {
        entered: Mutex<Option<std::sync::mpsc::Sender<()>>>,
        events: Mutex<Vec<Lifecycle>>,
    }

    impl LifecycleListener for SlowFinalize {
        fn finalized(&self, id: Uuid, ticket: Uuid) {
            if let Some(entered) = self.entered.lock().take() {
                let _ = entered.send(());
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            self.events.lock().push(Lifecycle::Finalized(id, ticket));
        }

        fn resurrected(&self, id: Uuid) {
            self.events.lock().push(Lifecycle::Resurrected(id));
        }
    }

    #[test]
    fn test_resurrection_never_overtakes_finalization() {
        let registry = Arc::new(ObjectRegistry::new());
        let object = DynamicObject::builder("Thing").build(&registry);
        let (changes, _rx) = tokio::sync::mpsc::unbounded_channel();
        let server = ServerResolver::new("server", registry.clone(), changes);
        let (id, _) = server.get_or_assign(&object.handle());

        let (entered, started) = std::sync::mpsc::channel();
        let listener = Arc::new(SlowFinalize {
            entered: Mutex::new(Some(entered)),
            events: Mutex::new(Vec::new()),
        });
        let resolver = ClientResolver::new("client", Arc::downgrade(&listener) as Weak<dyn LifecycleListener>);

        let proxy = resolver.bind(core(id));
        let dropper = std::thread::spawn(move || drop(proxy));
        started.recv().expect("finalization started");
        let back = resolver.resolve(id).expect("pending proxy resurrects");
        dropper.join().expect("dropper thread");

        let events = std::mem::take(&mut *listener.events.lock());
        let ticket = match events.as_slice() {
            [Lifecycle::Finalized(fid, ticket), Lifecycle::Resurrected(rid)] if *fid == id && *rid == id => *ticket,
            other => panic!("notices out of order: {:?}", other),
        };

        // Replay in wire order: the server must end up knowing the object.
        server.remove_on_finalized_ack(id);
        server.restore_on_resurrected_ack(id);
        assert!(!resolver.acknowledge_finalized(id, ticket));
        assert_eq!(resolver.state(id), ReferenceState::Live);
        assert!(server.knows(id));
        drop(back);
    }

    #[test]
    fn test_dispose_forgets_everything() {
        let (recorder, resolver) = setup();
        let id = Uuid::new_v4();
        let live = resolver.bind(core(id));
        drop(resolver.bind(core(Uuid::new_v4())));
        recorder.take();

        resolver.dispose();
        assert_eq!(resolver.pending_len(), 0);
        assert_eq!(resolver.state(id), ReferenceState::Untracked);

        // Not tracked any more, so nothing is reported.
        drop(live);
        assert!(recorder.take().is_empty());
    }
}
