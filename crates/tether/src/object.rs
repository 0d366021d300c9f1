//! # Real Objects
//!
//! The server-side object model: the capability every remotely reachable
//! object implements, the change notifications sessions listen to, and the
//! registry that makes any live object findable by identity.
//!
//! ## Philosophy
//!
//! - **Capabilities, not reflection**: an object describes its members once
//!   through [`DistributedObject::members`] and answers `get_property`,
//!   `set_property` and `invoke` by name. Dispatch never inspects types at
//!   runtime beyond those descriptors.
//! - **Weak registry**: the [`ObjectRegistry`] never keeps an object alive.
//!   An object is findable exactly as long as something in the process holds it.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use tether_wire::RemoteError;
use tether_wire::Value;

/// Values as the server sees them: objects are handles to real objects.
pub type ServerValue = Value<ObjectHandle>;

/// Declared type of a property, parameter or return value.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    Any,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    Uuid,
    Duration,
    /// Carried as an `Int` index into these names.
    Enum(Vec<String>),
    List,
    Map,
    Object,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MemberKind {
    Property { ty: ValueKind, writable: bool },
    Method { params: Vec<ValueKind>, returns: ValueKind },
    Event,
}

/// One entry in an object's member table.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub name: String,
    pub kind: MemberKind,
}

impl Member {
    pub fn property(name: impl Into<String>, ty: ValueKind, writable: bool) -> Self {
        Self { name: name.into(), kind: MemberKind::Property { ty, writable } }
    }

    pub fn method(name: impl Into<String>, params: Vec<ValueKind>, returns: ValueKind) -> Self {
        Self { name: name.into(), kind: MemberKind::Method { params, returns } }
    }

    pub fn event(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: MemberKind::Event }
    }

    pub fn is_property(&self) -> bool {
        matches!(self.kind, MemberKind::Property { .. })
    }
}

/// Something observable happened on a real object.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// A property now has a different value. The value itself is read by
    /// whoever forwards the change, at forwarding time.
    Property { name: String },
    /// A declared event fired.
    Event { name: String, args: Vec<ServerValue> },
}

impl Change {
    pub fn name(&self) -> &str {
        match self {
            Change::Property { name } => name,
            Change::Event { name, .. } => name,
        }
    }
}

pub type ChangeCallback = Arc<dyn Fn(&Change) + Send + Sync>;

/// Token returned by [`ChangeNotifier::subscribe`].
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct SubscriptionId(pub u64);

/// Multicast change event owned by each real object.
///
/// Callbacks are invoked outside the subscriber lock, so a callback may
/// subscribe or unsubscribe without deadlocking.
#[derive(Default)]
pub struct ChangeNotifier {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, ChangeCallback)>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: ChangeCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().push((id, callback));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn notify(&self, change: &Change) {
        let snapshot: Vec<ChangeCallback> = self.subscribers.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in snapshot {
            callback(change);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The capability a real object exposes to remote clients.
pub trait DistributedObject: Send + Sync {
    /// Stable identity, assigned at creation.
    fn id(&self) -> Uuid;

    fn type_name(&self) -> &str;

    fn members(&self) -> &[Member];

    fn changes(&self) -> &ChangeNotifier;

    fn get_property(&self, name: &str) -> Result<ServerValue, RemoteError>;

    fn set_property(&self, name: &str, value: ServerValue) -> Result<(), RemoteError>;

    fn invoke(&self, name: &str, args: Vec<ServerValue>) -> Result<ServerValue, RemoteError>;

    fn member(&self, name: &str) -> Option<&Member> {
        self.members().iter().find(|m| m.name == name)
    }

    /// Current values of every readable property, in declaration order.
    fn snapshot(&self) -> Vec<(String, ServerValue)> {
        self.members()
            .iter()
            .filter(|m| m.is_property())
            .filter_map(|m| self.get_property(&m.name).ok().map(|v| (m.name.clone(), v)))
            .collect()
    }

    fn is_disposed(&self) -> bool {
        false
    }

    fn dispose(&self) {}
}

/// Shared handle to a real object. Equality is identity.
#[derive(Clone)]
pub struct ObjectHandle(Arc<dyn DistributedObject>);

impl ObjectHandle {
    pub fn new(object: Arc<dyn DistributedObject>) -> Self {
        Self(object)
    }

    pub fn id(&self) -> Uuid {
        self.0.id()
    }

    pub fn downgrade(&self) -> Weak<dyn DistributedObject> {
        Arc::downgrade(&self.0)
    }

    pub fn as_arc(&self) -> &Arc<dyn DistributedObject> {
        &self.0
    }
}

impl<T: DistributedObject + 'static> From<Arc<T>> for ObjectHandle {
    fn from(object: Arc<T>) -> Self {
        Self(object)
    }
}

impl std::ops::Deref for ObjectHandle {
    type Target = dyn DistributedObject;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl PartialEq for ObjectHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for ObjectHandle {}

impl std::fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.0.type_name(), self.0.id())
    }
}

/// Process-wide lookup of real objects by identity.
///
/// Spans the whole server object graph, not just what some client knows
/// about, so navigation from the root can reach objects no session has seen.
#[derive(Default)]
pub struct ObjectRegistry {
    objects: DashMap<Uuid, Weak<dyn DistributedObject>>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, object: &ObjectHandle) {
        self.objects.insert(object.id(), object.downgrade());
    }

    /// Finds a live object. Dead entries found along the way are dropped.
    pub fn lookup(&self, id: Uuid) -> Option<ObjectHandle> {
        let found = self.objects.get(&id).and_then(|weak| weak.upgrade());
        match found {
            Some(object) => Some(ObjectHandle(object)),
            None => {
                self.objects.remove_if(&id, |_, weak| weak.strong_count() == 0);
                None
            }
        }
    }

    /// Removes every entry whose object is gone. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.objects.len();
        self.objects.retain(|_, weak| weak.strong_count() > 0);
        before - self.objects.len()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
