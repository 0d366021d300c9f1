//! # Codec
//!
//! The translation layer between [`Value`] and payload bytes.
//!
//! Objects are the only values the codec cannot encode on its own. When it
//! meets one it asks a [`ReferenceWriter`] how the object should travel, and
//! when it decodes one it asks a [`ReferenceReader`] for a local handle. The
//! server and client reference resolvers are those hooks; the codec never
//! keeps identity state of its own.
//!
//! ## Format
//!
//! - **Scalars**: `[Tag: 1b][Data: N]`
//! - **Blobs**: `[Tag: 1b][Len: 4b][Data: Len]`
//! - **Containers**: `[Tag: 1b][Count: 4b][Items..]`
//! - **Objects**: `[Tag][Id: 16b]` when already known to the peer, otherwise
//!   `[Tag][Id: 16b][TypeName][Count: 4b][(Name, Value)..]`
//!
//! ## Invariants
//! - **Recursion Safety**: all recursive operations are bounded by `MAX_RECURSION_DEPTH`.
//! - **Absent Payload**: an absent payload decodes as `Null` or as an empty list.

use std::time::Duration;

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use uuid::Uuid;

use crate::cursor::len_u32;
use crate::cursor::Reader;
use crate::error::RemoteError;
use crate::error::RemoteErrorKind;
use crate::error::Result;
use crate::error::WireError;
use crate::value::Value;

/// The maximum nesting depth for values before decoding is refused.
const MAX_RECURSION_DEPTH: usize = 64;

mod tag {
    pub const NULL: u8 = 0x00;
    pub const TRUE: u8 = 0x01;
    pub const FALSE: u8 = 0x02;
    pub const INT: u8 = 0x03;
    pub const FLOAT: u8 = 0x04;
    pub const STR: u8 = 0x10;
    pub const BYTES: u8 = 0x11;
    pub const UUID: u8 = 0x12;
    pub const DURATION: u8 = 0x13;
    pub const LIST: u8 = 0x20;
    pub const MAP: u8 = 0x21;
    pub const OBJECT_KNOWN: u8 = 0x30;
    pub const OBJECT_NEW: u8 = 0x31;
}

/// How an object crosses the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum WireObject<O> {
    /// The peer already tracks this identity; only the identity is sent.
    Known(Uuid),
    /// First transfer to this peer: identity, type and current member values.
    New {
        id: Uuid,
        type_name: String,
        state: Vec<(String, Value<O>)>,
    },
}

/// Encode-side reference hook.
///
/// Implementations decide whether the peer already knows `obj` and, if not,
/// record it as transferred before returning its state, so that cycles in the
/// state come back as `Known`.
pub trait ReferenceWriter<O> {
    fn write_reference(&self, obj: &O) -> Result<WireObject<O>>;
}

/// Decode-side reference hook.
pub trait ReferenceReader<O> {
    /// An identity the sender believes we already track.
    fn read_known(&self, id: Uuid) -> Result<O>;

    /// A first transfer carrying the object's state.
    fn read_new(&self, id: Uuid, type_name: String, state: Vec<(String, Value<O>)>) -> Result<O>;
}

/// Hooks for payloads that must not contain objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReferences;

impl<O> ReferenceWriter<O> for NoReferences {
    fn write_reference(&self, _obj: &O) -> Result<WireObject<O>> {
        Err(WireError::ProtocolViolation("object reference in a plain-data payload".into()))
    }
}

impl<O> ReferenceReader<O> for NoReferences {
    fn read_known(&self, id: Uuid) -> Result<O> {
        Err(WireError::UnresolvedReference(id))
    }

    fn read_new(&self, id: Uuid, _type_name: String, _state: Vec<(String, Value<O>)>) -> Result<O> {
        Err(WireError::UnresolvedReference(id))
    }
}

// ============================================================================
//  ENCODING
// ============================================================================

/// Encodes a single value as a whole payload.
pub fn encode_single<O, W>(val: &Value<O>, refs: &W) -> Result<Bytes>
where
    W: ReferenceWriter<O> + ?Sized,
{
    let mut buf = BytesMut::new();
    encode_value(&mut buf, val, refs, 0)?;
    Ok(buf.freeze())
}

/// Encodes an argument list as a whole payload: `[Count: 4b][Values..]`.
pub fn encode_values<O, W>(vals: &[Value<O>], refs: &W) -> Result<Bytes>
where
    W: ReferenceWriter<O> + ?Sized,
{
    let mut buf = BytesMut::new();
    buf.put_u32_le(len_u32(vals.len())?);
    for val in vals {
        encode_value(&mut buf, val, refs, 0)?;
    }
    Ok(buf.freeze())
}

/// Encodes a type name and member values: the reply to an unresolved-reference query.
pub fn encode_state<O, W>(type_name: &str, state: &[(String, Value<O>)], refs: &W) -> Result<Bytes>
where
    W: ReferenceWriter<O> + ?Sized,
{
    let mut buf = BytesMut::new();
    put_str(&mut buf, type_name)?;
    put_entries(&mut buf, state, refs, 0)?;
    Ok(buf.freeze())
}

/// Encodes an exception payload, keeping one level of inner cause.
pub fn encode_error(err: &RemoteError) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    put_error_head(&mut buf, err)?;
    match &err.inner {
        Some(inner) => {
            buf.put_u8(1);
            put_error_head(&mut buf, inner)?;
        }
        None => buf.put_u8(0),
    }
    Ok(buf.freeze())
}

fn put_error_head(buf: &mut BytesMut, err: &RemoteError) -> Result<()> {
    buf.put_u8(err.kind as u8);
    put_str(buf, &err.message)
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    buf.put_u32_le(len_u32(s.len())?);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_entries<O, W>(buf: &mut BytesMut, entries: &[(String, Value<O>)], refs: &W, depth: usize) -> Result<()>
where
    W: ReferenceWriter<O> + ?Sized,
{
    buf.put_u32_le(len_u32(entries.len())?);
    for (key, value) in entries {
        put_str(buf, key)?;
        encode_value(buf, value, refs, depth + 1)?;
    }
    Ok(())
}

fn encode_value<O, W>(buf: &mut BytesMut, val: &Value<O>, refs: &W, depth: usize) -> Result<()>
where
    W: ReferenceWriter<O> + ?Sized,
{
    if depth > MAX_RECURSION_DEPTH {
        return Err(WireError::RecursionLimitExceeded);
    }

    match val {
        Value::Null => buf.put_u8(tag::NULL),
        Value::Bool(true) => buf.put_u8(tag::TRUE),
        Value::Bool(false) => buf.put_u8(tag::FALSE),
        Value::Int(i) => {
            buf.put_u8(tag::INT);
            buf.put_i64_le(*i);
        }
        Value::Float(f) => {
            buf.put_u8(tag::FLOAT);
            buf.put_f64_le(*f);
        }
        Value::Str(s) => {
            buf.put_u8(tag::STR);
            put_str(buf, s)?;
        }
        Value::Bytes(b) => {
            buf.put_u8(tag::BYTES);
            buf.put_u32_le(len_u32(b.len())?);
            buf.put_slice(b);
        }
        Value::Uuid(u) => {
            buf.put_u8(tag::UUID);
            buf.put_slice(u.as_bytes());
        }
        Value::Duration(d) => {
            buf.put_u8(tag::DURATION);
            buf.put_u64_le(d.as_secs());
            buf.put_u32_le(d.subsec_nanos());
        }
        Value::List(items) => {
            buf.put_u8(tag::LIST);
            buf.put_u32_le(len_u32(items.len())?);
            for item in items {
                encode_value(buf, item, refs, depth + 1)?;
            }
        }
        Value::Map(entries) => {
            buf.put_u8(tag::MAP);
            put_entries(buf, entries, refs, depth)?;
        }
        Value::Object(obj) => match refs.write_reference(obj)? {
            WireObject::Known(id) => {
                buf.put_u8(tag::OBJECT_KNOWN);
                buf.put_slice(id.as_bytes());
            }
            WireObject::New { id, type_name, state } => {
                buf.put_u8(tag::OBJECT_NEW);
                buf.put_slice(id.as_bytes());
                put_str(buf, &type_name)?;
                put_entries(buf, &state, refs, depth)?;
            }
        },
    }
    Ok(())
}

// ============================================================================
//  DECODING
// ============================================================================

/// Decodes a whole payload holding a single value. An absent payload is `Null`.
pub fn decode_single<O, R>(payload: Option<Bytes>, refs: &R) -> Result<Value<O>>
where
    R: ReferenceReader<O> + ?Sized,
{
    let Some(payload) = payload else {
        return Ok(Value::Null);
    };
    let mut reader = Reader::new(payload);
    let val = decode_value(&mut reader, refs, 0)?;
    expect_consumed(&reader)?;
    Ok(val)
}

/// Decodes an argument list. An absent payload is an empty list.
pub fn decode_values<O, R>(payload: Option<Bytes>, refs: &R) -> Result<Vec<Value<O>>>
where
    R: ReferenceReader<O> + ?Sized,
{
    let Some(payload) = payload else {
        return Ok(Vec::new());
    };
    let mut reader = Reader::new(payload);
    let count = reader.u32()? as usize;
    // Every value takes at least one byte, so this bounds the allocation.
    let mut vals = Vec::with_capacity(count.min(reader.remaining()));
    for _ in 0..count {
        vals.push(decode_value(&mut reader, refs, 0)?);
    }
    expect_consumed(&reader)?;
    Ok(vals)
}

/// Decodes an unresolved-reference reply. An absent payload means the object is gone.
pub fn decode_state<O, R>(payload: Option<Bytes>, refs: &R) -> Result<Option<(String, Vec<(String, Value<O>)>)>>
where
    R: ReferenceReader<O> + ?Sized,
{
    let Some(payload) = payload else {
        return Ok(None);
    };
    let mut reader = Reader::new(payload);
    let type_name = reader.string()?;
    let state = decode_entries(&mut reader, refs, 0)?;
    expect_consumed(&reader)?;
    Ok(Some((type_name, state)))
}

/// Decodes an exception payload.
pub fn decode_error(payload: Option<Bytes>) -> Result<RemoteError> {
    let payload = payload.ok_or_else(|| WireError::ProtocolViolation("exception frame without payload".into()))?;
    let mut reader = Reader::new(payload);
    let mut err = read_error_head(&mut reader)?;
    if reader.u8()? == 1 {
        err.inner = Some(Box::new(read_error_head(&mut reader)?));
    }
    expect_consumed(&reader)?;
    Ok(err)
}

fn read_error_head(reader: &mut Reader) -> Result<RemoteError> {
    let raw_kind = reader.u8()?;
    let kind = RemoteErrorKind::from_u8(raw_kind).ok_or(WireError::InvalidTag(raw_kind))?;
    let message = reader.string()?;
    Ok(RemoteError::new(kind, message))
}

fn expect_consumed(reader: &Reader) -> Result<()> {
    if reader.remaining() != 0 {
        return Err(WireError::ProtocolViolation(format!(
            "{} trailing bytes after payload",
            reader.remaining()
        )));
    }
    Ok(())
}

fn decode_entries<O, R>(reader: &mut Reader, refs: &R, depth: usize) -> Result<Vec<(String, Value<O>)>>
where
    R: ReferenceReader<O> + ?Sized,
{
    let count = reader.u32()? as usize;
    let mut entries = Vec::with_capacity(count.min(reader.remaining()));
    for _ in 0..count {
        let key = reader.string()?;
        let value = decode_value(reader, refs, depth + 1)?;
        entries.push((key, value));
    }
    Ok(entries)
}

fn decode_value<O, R>(reader: &mut Reader, refs: &R, depth: usize) -> Result<Value<O>>
where
    R: ReferenceReader<O> + ?Sized,
{
    if depth > MAX_RECURSION_DEPTH {
        return Err(WireError::RecursionLimitExceeded);
    }

    let t = reader.u8()?;
    Ok(match t {
        tag::NULL => Value::Null,
        tag::TRUE => Value::Bool(true),
        tag::FALSE => Value::Bool(false),
        tag::INT => Value::Int(reader.i64()?),
        tag::FLOAT => Value::Float(reader.f64()?),
        tag::STR => Value::Str(reader.string()?),
        tag::BYTES => Value::Bytes(reader.blob()?.to_vec()),
        tag::UUID => Value::Uuid(reader.uuid()?),
        tag::DURATION => {
            let secs = reader.u64()?;
            let nanos = reader.u32()?;
            if nanos >= 1_000_000_000 {
                return Err(WireError::ProtocolViolation("duration nanos out of range".into()));
            }
            Value::Duration(Duration::new(secs, nanos))
        }
        tag::LIST => {
            let count = reader.u32()? as usize;
            let mut items = Vec::with_capacity(count.min(reader.remaining()));
            for _ in 0..count {
                items.push(decode_value(reader, refs, depth + 1)?);
            }
            Value::List(items)
        }
        tag::MAP => Value::Map(decode_entries(reader, refs, depth)?),
        tag::OBJECT_KNOWN => Value::Object(refs.read_known(reader.uuid()?)?),
        tag::OBJECT_NEW => {
            let id = reader.uuid()?;
            let type_name = reader.string()?;
            let state = decode_entries(reader, refs, depth)?;
            Value::Object(refs.read_new(id, type_name, state)?)
        }
        other => return Err(WireError::InvalidTag(other)),
    })
}
