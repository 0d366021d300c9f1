//! # Server Reference Resolver
//!
//! Tracks which real objects one client session currently references.
//!
//! ## Invariants
//!
//! - An identity is in the known-set exactly while the client holds a live or
//!   finalize-pending proxy for it (give or take one in-flight frame).
//! - Every known object has exactly one change subscription owned by this
//!   resolver; removing the entry removes the subscription.
//! - Change callbacks never take the known-set lock. They only forward
//!   `(identity, change)` pairs to the session's dispatcher.
//! - Objects leaving the known-set are dropped after the lock is released.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use tether_wire::ReferenceReader;
use tether_wire::ReferenceWriter;
use tether_wire::WireError;
use tether_wire::WireObject;

use crate::object::Change;
use crate::object::ObjectHandle;
use crate::object::ObjectRegistry;
use crate::object::ServerValue;
use crate::object::SubscriptionId;

struct KnownObject {
    object: ObjectHandle,
    subscription: SubscriptionId,
}

pub struct ServerResolver {
    session: String,
    registry: Arc<ObjectRegistry>,
    known: Mutex<HashMap<Uuid, KnownObject>>,
    changes: mpsc::UnboundedSender<(Uuid, Change)>,
}

impl ServerResolver {
    pub fn new(
        session: impl Into<String>,
        registry: Arc<ObjectRegistry>,
        changes: mpsc::UnboundedSender<(Uuid, Change)>,
    ) -> Self {
        Self {
            session: session.into(),
            registry,
            known: Mutex::new(HashMap::new()),
            changes,
        }
    }

    /// Returns the object's identity, adding it to the known-set if needed.
    ///
    /// The flag is `true` when this call added it, meaning the client has not
    /// seen the object yet and must receive its state.
    pub fn get_or_assign(&self, object: &ObjectHandle) -> (Uuid, bool) {
        let id = object.id();
        let mut known = self.known.lock();
        if known.contains_key(&id) {
            return (id, false);
        }
        let subscription = self.subscribe(object);
        known.insert(id, KnownObject { object: object.clone(), subscription });
        (id, true)
    }

    /// Known-set first, then the registry. A registry hit is not added.
    pub fn resolve(&self, id: Uuid) -> Option<ObjectHandle> {
        let known = self.known.lock().get(&id).map(|k| k.object.clone());
        known.or_else(|| self.registry.lookup(id))
    }

    pub fn knows(&self, id: Uuid) -> bool {
        self.known.lock().contains_key(&id)
    }

    pub fn known_len(&self) -> usize {
        self.known.lock().len()
    }

    /// The client finalized its proxy. Safe for identities no longer present.
    pub fn remove_on_finalized_ack(&self, id: Uuid) -> bool {
        let removed = self.known.lock().remove(&id);
        match removed {
            Some(entry) => {
                entry.object.changes().unsubscribe(entry.subscription);
                debug!(session = %self.session, object = %id, "client released object");
                true
            }
            None => {
                debug!(session = %self.session, object = %id, "finalized identity was not known");
                false
            }
        }
    }

    /// The client resurrected its proxy. Re-adds from the registry if needed.
    pub fn restore_on_resurrected_ack(&self, id: Uuid) -> bool {
        if self.knows(id) {
            return true;
        }
        match self.registry.lookup(id) {
            Some(object) => {
                self.get_or_assign(&object);
                debug!(session = %self.session, object = %id, "client resurrected object");
                true
            }
            None => {
                warn!(session = %self.session, object = %id, "resurrected object no longer exists");
                false
            }
        }
    }

    /// Drops every entry and its subscription.
    pub fn dispose(&self) {
        let drained: Vec<KnownObject> = self.known.lock().drain().map(|(_, k)| k).collect();
        for entry in &drained {
            entry.object.changes().unsubscribe(entry.subscription);
        }
        debug!(session = %self.session, released = drained.len(), "resolver disposed");
    }

    fn subscribe(&self, object: &ObjectHandle) -> SubscriptionId {
        let id = object.id();
        let tx = self.changes.clone();
        object.changes().subscribe(Arc::new(move |change: &Change| {
            let _ = tx.send((id, change.clone()));
        }))
    }
}

impl ReferenceWriter<ObjectHandle> for ServerResolver {
    fn write_reference(&self, object: &ObjectHandle) -> tether_wire::Result<WireObject<ObjectHandle>> {
        let (id, added) = self.get_or_assign(object);
        if !added {
            return Ok(WireObject::Known(id));
        }
        // Already in the known-set, so a cycle back to this object encodes as Known.
        Ok(WireObject::New {
            id,
            type_name: object.type_name().to_string(),
            state: object.snapshot(),
        })
    }
}

impl ReferenceReader<ObjectHandle> for ServerResolver {
    fn read_known(&self, id: Uuid) -> tether_wire::Result<ObjectHandle> {
        self.resolve(id).ok_or(WireError::UnresolvedReference(id))
    }

    fn read_new(&self, id: Uuid, _type_name: String, _state: Vec<(String, ServerValue)>) -> tether_wire::Result<ObjectHandle> {
        Err(WireError::ProtocolViolation(format!("client cannot create object {}", id)))
    }
}

impl Drop for ServerResolver {
    fn drop(&mut self) {
        self.dispose();
    }
}
