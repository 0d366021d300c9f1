//! # Values
//!
//! The dynamically typed data carried by payloads.
//!
//! `Value` is generic over `O`, the handle each side uses for distributed
//! objects: the server carries handles to real objects, the client carries
//! proxies. Everything else is plain data and identical on both sides.

use std::time::Duration;

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum Value<O> {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Duration(Duration),
    List(Vec<Value<O>>),
    /// Ordered key/value pairs; keys are unique by convention, not enforced.
    Map(Vec<(String, Value<O>)>),
    Object(O),
}

impl<O> Default for Value<O> {
    fn default() -> Self {
        Value::Null
    }
}

impl<O> Value<O> {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Floats, and ints widened to floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&O> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<O> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Looks up a key in a `Map` value.
    pub fn get(&self, key: &str) -> Option<&Value<O>> {
        match self {
            Value::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Short name of the variant, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Uuid(_) => "uuid",
            Value::Duration(_) => "duration",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
        }
    }

    /// Rebuilds the value with a different object handle type.
    pub fn try_map_objects<P, E>(self, f: &mut impl FnMut(O) -> Result<P, E>) -> Result<Value<P>, E> {
        Ok(match self {
            Value::Null => Value::Null,
            Value::Bool(b) => Value::Bool(b),
            Value::Int(i) => Value::Int(i),
            Value::Float(x) => Value::Float(x),
            Value::Str(s) => Value::Str(s),
            Value::Bytes(b) => Value::Bytes(b),
            Value::Uuid(u) => Value::Uuid(u),
            Value::Duration(d) => Value::Duration(d),
            Value::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|v| v.try_map_objects(f))
                    .collect::<Result<_, E>>()?,
            ),
            Value::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| v.try_map_objects(f).map(|v| (k, v)))
                    .collect::<Result<_, E>>()?,
            ),
            Value::Object(o) => Value::Object(f(o)?),
        })
    }
}

impl<O> From<bool> for Value<O> {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl<O> From<i64> for Value<O> {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl<O> From<i32> for Value<O> {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl<O> From<f64> for Value<O> {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl<O> From<&str> for Value<O> {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl<O> From<String> for Value<O> {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl<O> From<Uuid> for Value<O> {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl<O> From<Duration> for Value<O> {
    fn from(v: Duration) -> Self {
        Value::Duration(v)
    }
}

impl<O> From<Vec<u8>> for Value<O> {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}
