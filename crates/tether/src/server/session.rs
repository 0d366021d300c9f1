//! # Server Session Dispatcher
//!
//! One task per connection that answers the client's requests and forwards
//! change notifications for objects the client subscribed to.
//!
//! ## Invariants
//!
//! - Inbound frames are handled strictly in arrival order, one at a time.
//! - Every request frame gets exactly one reply: the matching kind on
//!   success, an exception frame otherwise. A failed call never ends the session.
//! - Event forwarding requires both a subscription and the identity being in
//!   the known-set. Subscriptions survive finalization, so a resurrected
//!   proxy resumes receiving events without subscribing again.
//! - Property-change notifications carry the value read when the
//!   notification is built, not when the change was raised.

use std::any::Any;
use std::collections::HashSet;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;
use uuid::Uuid;

use tether_wire::Frame;
use tether_wire::FrameKind;
use tether_wire::PROPERTY_CHANGED;
use tether_wire::RemoteError;
use tether_wire::RemoteErrorKind;
use tether_wire::Value;
use tether_wire::WireError;
use tether_wire::decode_single;
use tether_wire::decode_values;
use tether_wire::encode_single;
use tether_wire::encode_state;
use tether_wire::encode_values;

use crate::config::SessionConfig;
use crate::object::Change;
use crate::object::MemberKind;
use crate::object::ObjectHandle;
use crate::object::ObjectRegistry;
use crate::server::auth::Principal;
use crate::server::coerce::coerce;
use crate::server::coerce::coerce_args;
use crate::server::resolver::ServerResolver;
use crate::transport::Pump;

type Reply = Result<Frame, RemoteError>;

pub struct ServerSession {
    name: String,
    principal: Principal,
    root: ObjectHandle,
    pump: Arc<Pump>,
    resolver: ServerResolver,
    subscriptions: Mutex<HashSet<(Uuid, String)>>,
}

impl ServerSession {
    /// Starts serving `root` over `stream`.
    pub fn start<S>(
        stream: S,
        root: ObjectHandle,
        registry: Arc<ObjectRegistry>,
        principal: Principal,
        config: &SessionConfig,
    ) -> Arc<ServerSession>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (pump, inbound) = Pump::start(stream, config);
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();

        let session = Arc::new(ServerSession {
            name: config.name.clone(),
            principal,
            root,
            pump,
            resolver: ServerResolver::new(config.name.clone(), registry, changes_tx),
            subscriptions: Mutex::new(HashSet::new()),
        });

        info!(session = %session.name, principal = %session.principal.name, "session started");
        tokio::spawn(session.clone().run(inbound, changes_rx));
        session
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn pump(&self) -> &Arc<Pump> {
        &self.pump
    }

    /// Whether the client currently holds a reference to `id`.
    pub fn knows(&self, id: Uuid) -> bool {
        self.resolver.knows(id)
    }

    pub fn known_len(&self) -> usize {
        self.resolver.known_len()
    }

    pub fn is_subscribed(&self, id: Uuid, event: &str) -> bool {
        self.subscriptions.lock().contains(&(id, event.to_string()))
    }

    pub fn is_connected(&self) -> bool {
        !self.pump.is_closed()
    }

    /// Disconnects the client. Idempotent.
    pub fn close(&self) {
        self.pump.close();
    }

    /// Resolves once the connection is gone.
    pub async fn closed(&self) {
        self.pump.closed().await;
    }

    async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<Frame>,
        mut changes: mpsc::UnboundedReceiver<(Uuid, Change)>,
    ) {
        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(frame) => self.dispatch(frame),
                    None => break,
                },
                Some((id, change)) = changes.recv() => self.forward(id, &change),
            }
        }

        self.pump.close();
        self.subscriptions.lock().clear();
        self.resolver.dispose();
        info!(session = %self.name, "session ended");
    }

    fn dispatch(&self, frame: Frame) {
        trace!(session = %self.name, kind = %frame.kind, object = %frame.object_id, member = %frame.member, "dispatch");

        let outcome = match frame.kind {
            FrameKind::RootQuery => self.root_query(&frame),
            FrameKind::MethodCall => self.method_call(&frame),
            FrameKind::PropertyGet => self.property_get(&frame),
            FrameKind::PropertySet => self.property_set(&frame),
            FrameKind::EventSubscribe => self.subscribe(&frame),
            FrameKind::EventUnsubscribe => self.unsubscribe(&frame),
            FrameKind::ProxyFinalized => {
                self.resolver.remove_on_finalized_ack(frame.object_id);
                Ok(frame.reply(FrameKind::ProxyFinalized, 0, None))
            }
            FrameKind::ProxyResurrected => {
                self.resolver.restore_on_resurrected_ack(frame.object_id);
                Ok(frame.reply(FrameKind::ProxyResurrected, 0, None))
            }
            FrameKind::UnresolvedReference => self.unresolved_reference(&frame),
            FrameKind::EventNotification | FrameKind::Exception => {
                warn!(session = %self.name, kind = %frame.kind, "client sent a server-only frame");
                Err(RemoteError::new(RemoteErrorKind::Protocol, format!("{} is not a request", frame.kind)))
            }
        };

        let reply = match outcome {
            Ok(reply) => reply,
            Err(error) => {
                debug!(session = %self.name, call = %frame.call_id, error = %error, "call failed");
                match frame.exception(&error) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(session = %self.name, error = %e, "could not encode exception");
                        return;
                    }
                }
            }
        };

        if let Err(e) = self.pump.send(&reply) {
            debug!(session = %self.name, error = %e, "reply not sent");
        }
    }

    fn target(&self, frame: &Frame) -> Result<ObjectHandle, RemoteError> {
        let object = self
            .resolver
            .resolve(frame.object_id)
            .ok_or_else(|| RemoteError::object_not_found(frame.object_id))?;
        if object.is_disposed() {
            return Err(RemoteError::new(
                RemoteErrorKind::ObjectDisposed,
                format!("{} {} is disposed", object.type_name(), object.id()),
            ));
        }
        Ok(object)
    }

    fn root_query(&self, frame: &Frame) -> Reply {
        let payload = encode_single(&Value::Object(self.root.clone()), &self.resolver).map_err(encode_failure)?;
        Ok(frame.reply(FrameKind::RootQuery, 1, Some(payload)))
    }

    fn method_call(&self, frame: &Frame) -> Reply {
        let object = self.target(frame)?;
        let params = object
            .members()
            .iter()
            .find_map(|m| match &m.kind {
                MemberKind::Method { params, .. }
                    if m.name == frame.member && params.len() == frame.param_count as usize =>
                {
                    Some(params.clone())
                }
                _ => None,
            })
            .ok_or_else(|| RemoteError::member_not_found(object.type_name(), &frame.member, frame.param_count))?;

        let args = decode_values(frame.payload.clone(), &self.resolver).map_err(decode_failure)?;
        let args = coerce_args(args, &params)?;

        let invoked = panic::catch_unwind(AssertUnwindSafe(|| object.invoke(&frame.member, args)))
            .unwrap_or_else(|payload| Err(RemoteError::application(panic_message(payload.as_ref()))));
        let result = invoked.map_err(|e| match e.kind {
            RemoteErrorKind::Application => RemoteError::application(format!(
                "{}.{} failed",
                object.type_name(),
                frame.member
            ))
            .with_inner(e),
            _ => e,
        })?;

        let payload = encode_single(&result, &self.resolver).map_err(encode_failure)?;
        Ok(frame.reply(FrameKind::MethodCall, 1, Some(payload)))
    }

    fn property_get(&self, frame: &Frame) -> Reply {
        let object = self.target(frame)?;
        if !object.member(&frame.member).is_some_and(|m| m.is_property()) {
            return Err(RemoteError::member_not_found(object.type_name(), &frame.member, 0));
        }
        let value = object.get_property(&frame.member)?;
        let payload = encode_single(&value, &self.resolver).map_err(encode_failure)?;
        Ok(frame.reply(FrameKind::PropertyGet, 1, Some(payload)))
    }

    fn property_set(&self, frame: &Frame) -> Reply {
        let object = self.target(frame)?;
        let ty = match object.member(&frame.member).map(|m| &m.kind) {
            Some(MemberKind::Property { ty, writable: true }) => ty.clone(),
            _ => return Err(RemoteError::member_not_found(object.type_name(), &frame.member, 1)),
        };
        let value = decode_single(frame.payload.clone(), &self.resolver).map_err(decode_failure)?;
        let value = coerce(value, &ty)?;
        object.set_property(&frame.member, value)?;
        Ok(frame.reply(FrameKind::PropertySet, 0, None))
    }

    fn subscribe(&self, frame: &Frame) -> Reply {
        let object = self.target(frame)?;
        let declared = frame.member == PROPERTY_CHANGED
            || object.member(&frame.member).is_some_and(|m| matches!(m.kind, MemberKind::Event));
        if !declared {
            return Err(RemoteError::member_not_found(object.type_name(), &frame.member, 0));
        }

        if self.subscriptions.lock().insert((frame.object_id, frame.member.clone())) {
            debug!(session = %self.name, object = %frame.object_id, event = %frame.member, "subscribed");
        }
        Ok(frame.reply(FrameKind::EventSubscribe, 0, None))
    }

    fn unsubscribe(&self, frame: &Frame) -> Reply {
        if self.subscriptions.lock().remove(&(frame.object_id, frame.member.clone())) {
            debug!(session = %self.name, object = %frame.object_id, event = %frame.member, "unsubscribed");
        }
        Ok(frame.reply(FrameKind::EventUnsubscribe, 0, None))
    }

    fn unresolved_reference(&self, frame: &Frame) -> Reply {
        let Some(object) = self.resolver.resolve(frame.object_id) else {
            debug!(session = %self.name, object = %frame.object_id, "unresolved reference has no object");
            return Ok(frame.reply(FrameKind::UnresolvedReference, 0, None));
        };

        // The client is about to hold a proxy for it.
        self.resolver.get_or_assign(&object);
        let state = object.snapshot();
        let payload = encode_state(object.type_name(), &state, &self.resolver).map_err(encode_failure)?;
        Ok(frame.reply(FrameKind::UnresolvedReference, 1, Some(payload)))
    }

    fn forward(&self, id: Uuid, change: &Change) {
        let event = match change {
            Change::Property { .. } => PROPERTY_CHANGED,
            Change::Event { name, .. } => name.as_str(),
        };
        if !self.is_subscribed(id, event) || !self.resolver.knows(id) {
            return;
        }

        let args = match change {
            Change::Property { name } => {
                let Some(object) = self.resolver.resolve(id) else {
                    return;
                };
                match object.get_property(name) {
                    Ok(value) => vec![Value::Str(name.clone()), value],
                    Err(e) => {
                        debug!(session = %self.name, object = %id, error = %e, "changed property unreadable");
                        return;
                    }
                }
            }
            Change::Event { args, .. } => args.clone(),
        };

        let payload = match encode_values(&args, &self.resolver) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(session = %self.name, object = %id, error = %e, "could not encode notification");
                return;
            }
        };

        let frame = Frame::request(FrameKind::EventNotification, id, event, args.len() as u32, Some(payload));
        if let Err(e) = self.pump.send(&frame) {
            debug!(session = %self.name, error = %e, "notification not sent");
        }
    }
}

fn decode_failure(e: WireError) -> RemoteError {
    match e {
        WireError::UnresolvedReference(id) => RemoteError::object_not_found(id),
        other => RemoteError::bad_arguments(other.to_string()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {}", msg)
    } else {
        "panicked".to_string()
    }
}

fn encode_failure(e: WireError) -> RemoteError {
    RemoteError::new(RemoteErrorKind::Protocol, e.to_string())
}
