//! # Dynamic Objects
//!
//! A [`DistributedObject`] assembled from a member table at registration time.
//!
//! Properties live in a value map, methods are closures, and events are
//! names that [`DynamicObject::raise`] fires. Applications with their own
//! types implement the trait directly; this is the quick way to stand up an
//! object graph.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use uuid::Uuid;

use tether_wire::RemoteError;

use crate::object::Change;
use crate::object::ChangeNotifier;
use crate::object::DistributedObject;
use crate::object::Member;
use crate::object::ObjectHandle;
use crate::object::ObjectRegistry;
use crate::object::ServerValue;
use crate::object::ValueKind;

pub type MethodFn = Arc<dyn Fn(&DynamicObject, Vec<ServerValue>) -> Result<ServerValue, RemoteError> + Send + Sync>;

pub struct DynamicObject {
    id: Uuid,
    type_name: String,
    members: Vec<Member>,
    values: Mutex<HashMap<String, ServerValue>>,
    methods: HashMap<String, MethodFn>,
    changes: ChangeNotifier,
    disposed: AtomicBool,
}

impl DynamicObject {
    pub fn builder(type_name: impl Into<String>) -> DynamicBuilder {
        DynamicBuilder {
            id: Uuid::new_v4(),
            type_name: type_name.into(),
            members: Vec::new(),
            values: HashMap::new(),
            methods: HashMap::new(),
        }
    }

    /// Current value of a property, if it exists.
    pub fn get(&self, name: &str) -> Option<ServerValue> {
        self.values.lock().get(name).cloned()
    }

    /// Stores a property value, announcing a change only if the value differs.
    ///
    /// Returns whether a change was announced.
    pub fn set(&self, name: &str, value: impl Into<ServerValue>) -> bool {
        let value = value.into();
        let previous = {
            let mut values = self.values.lock();
            if values.get(name) == Some(&value) {
                return false;
            }
            values.insert(name.to_string(), value)
        };
        // The old value may hold the last reference to another object.
        drop(previous);
        self.changes.notify(&Change::Property { name: name.to_string() });
        true
    }

    /// Fires a declared event.
    pub fn raise(&self, event: &str, args: Vec<ServerValue>) {
        self.changes.notify(&Change::Event { name: event.to_string(), args });
    }

    pub fn handle(self: &Arc<Self>) -> ObjectHandle {
        ObjectHandle::from(self.clone())
    }
}

impl DistributedObject for DynamicObject {
    fn id(&self) -> Uuid {
        self.id
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn members(&self) -> &[Member] {
        &self.members
    }

    fn changes(&self) -> &ChangeNotifier {
        &self.changes
    }

    fn get_property(&self, name: &str) -> Result<ServerValue, RemoteError> {
        self.get(name)
            .ok_or_else(|| RemoteError::member_not_found(&self.type_name, name, 0))
    }

    fn set_property(&self, name: &str, value: ServerValue) -> Result<(), RemoteError> {
        if !self.values.lock().contains_key(name) {
            return Err(RemoteError::member_not_found(&self.type_name, name, 1));
        }
        self.set(name, value);
        Ok(())
    }

    fn invoke(&self, name: &str, args: Vec<ServerValue>) -> Result<ServerValue, RemoteError> {
        let method = self
            .methods
            .get(name)
            .ok_or_else(|| RemoteError::member_not_found(&self.type_name, name, args.len() as u32))?;
        method(self, args)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.raise("Disposed", Vec::new());
        }
    }
}

/// Collects the member table for a [`DynamicObject`].
pub struct DynamicBuilder {
    id: Uuid,
    type_name: String,
    members: Vec<Member>,
    values: HashMap<String, ServerValue>,
    methods: HashMap<String, MethodFn>,
}

impl DynamicBuilder {
    /// Overrides the generated identity.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// A readable and writable property.
    pub fn property(mut self, name: &str, ty: ValueKind, initial: impl Into<ServerValue>) -> Self {
        self.members.push(Member::property(name, ty, true));
        self.values.insert(name.to_string(), initial.into());
        self
    }

    /// A property clients can read but not write.
    pub fn read_only(mut self, name: &str, ty: ValueKind, initial: impl Into<ServerValue>) -> Self {
        self.members.push(Member::property(name, ty, false));
        self.values.insert(name.to_string(), initial.into());
        self
    }

    pub fn method<F>(mut self, name: &str, params: Vec<ValueKind>, returns: ValueKind, f: F) -> Self
    where
        F: Fn(&DynamicObject, Vec<ServerValue>) -> Result<ServerValue, RemoteError> + Send + Sync + 'static,
    {
        self.members.push(Member::method(name, params, returns));
        self.methods.insert(name.to_string(), Arc::new(f));
        self
    }

    pub fn event(mut self, name: &str) -> Self {
        self.members.push(Member::event(name));
        self
    }

    /// Finishes the object and registers it so it is findable by identity.
    pub fn build(self, registry: &ObjectRegistry) -> Arc<DynamicObject> {
        let object = Arc::new(DynamicObject {
            id: self.id,
            type_name: self.type_name,
            members: self.members,
            values: Mutex::new(self.values),
            methods: self.methods,
            changes: ChangeNotifier::new(),
            disposed: AtomicBool::new(false),
        });
        registry.register(&object.handle());
        object
    }
}
