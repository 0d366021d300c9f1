//! # Protocol Frames
//!
//! Defines the fixed envelope every message travels in.
//!
//! ## Layout
//!
//! All integers are little-endian.
//!
//! ```text
//! length      u32    bytes that follow, excluding this field
//! version     [u8;3] protocol major, minor, build marker ('D' debug / 'R' release)
//! kind        u8     FrameKind
//! call_id     [u8;16]
//! object_id   [u8;16]
//! member_len  u32    followed by member_len bytes of ASCII
//! params      u32    declared parameter count
//! payload     ..     the rest of the frame, possibly empty
//! ```
//!
//! ## Invariants
//! - **Panic Safety**: decoding returns `Result` on every malformed input.
//! - **Absent Payload**: an empty payload and no payload are the same thing;
//!   both decode as `None`.

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use uuid::Uuid;

use crate::cursor::len_u32;
use crate::cursor::Reader;
use crate::error::RemoteError;
use crate::error::Result;
use crate::error::WireError;

/// Protocol major and minor version.
pub const VERSION: [u8; 2] = [1, 0];

/// Third version byte: which kind of build produced the frame.
pub const BUILD_MARKER: u8 = if cfg!(debug_assertions) { b'D' } else { b'R' };

/// Bytes in the length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Bytes in the fixed part of the body (everything except the member name and payload).
pub const FIXED_BODY: usize = 3 + 1 + 16 + 16 + 4 + 4;

/// Event name under which property changes are announced.
pub const PROPERTY_CHANGED: &str = "PropertyChanged";

/// What a frame is asking for or announcing.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    RootQuery = 1,
    MethodCall = 2,
    PropertyGet = 3,
    PropertySet = 4,
    EventSubscribe = 5,
    EventUnsubscribe = 6,
    EventNotification = 7,
    ProxyFinalized = 8,
    ProxyResurrected = 9,
    UnresolvedReference = 10,
    Exception = 11,
}

impl FrameKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::RootQuery),
            2 => Some(Self::MethodCall),
            3 => Some(Self::PropertyGet),
            4 => Some(Self::PropertySet),
            5 => Some(Self::EventSubscribe),
            6 => Some(Self::EventUnsubscribe),
            7 => Some(Self::EventNotification),
            8 => Some(Self::ProxyFinalized),
            9 => Some(Self::ProxyResurrected),
            10 => Some(Self::UnresolvedReference),
            11 => Some(Self::Exception),
            _ => None,
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// One unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Correlates a response with its request.
    pub call_id: Uuid,
    /// The object the frame is addressed to or about; nil for root queries.
    pub object_id: Uuid,
    /// Property, method or event name; may be empty.
    pub member: String,
    pub param_count: u32,
    pub payload: Option<Bytes>,
}

impl Frame {
    /// A new request with a fresh call identifier.
    pub fn request(
        kind: FrameKind,
        object_id: Uuid,
        member: impl Into<String>,
        param_count: u32,
        payload: Option<Bytes>,
    ) -> Self {
        Self {
            kind,
            call_id: Uuid::new_v4(),
            object_id,
            member: member.into(),
            param_count,
            payload: normalize(payload),
        }
    }

    /// A response to this frame: same call identifier, object and member.
    pub fn reply(&self, kind: FrameKind, param_count: u32, payload: Option<Bytes>) -> Self {
        Self {
            kind,
            call_id: self.call_id,
            object_id: self.object_id,
            member: self.member.clone(),
            param_count,
            payload: normalize(payload),
        }
    }

    /// An exception response to this frame.
    pub fn exception(&self, error: &RemoteError) -> Result<Self> {
        let payload = crate::codec::encode_error(error)?;
        Ok(self.reply(FrameKind::Exception, 0, Some(payload)))
    }

    /// Encodes the frame including its length prefix.
    pub fn encode(&self) -> Result<Bytes> {
        if !self.member.is_ascii() {
            return Err(WireError::NonAsciiMember(self.member.clone()));
        }
        let payload_len = self.payload.as_ref().map_or(0, |p| p.len());
        let body_len = FIXED_BODY + self.member.len() + payload_len;
        let declared = len_u32(body_len)?;

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + body_len);
        buf.put_u32_le(declared);
        buf.put_slice(&VERSION);
        buf.put_u8(BUILD_MARKER);
        buf.put_u8(self.kind as u8);
        buf.put_slice(self.call_id.as_bytes());
        buf.put_slice(self.object_id.as_bytes());
        buf.put_u32_le(len_u32(self.member.len())?);
        buf.put_slice(self.member.as_bytes());
        buf.put_u32_le(self.param_count);
        if let Some(payload) = &self.payload {
            buf.put_slice(payload);
        }
        Ok(buf.freeze())
    }

    /// Decodes a frame including its length prefix. Exact inverse of [`Frame::encode`].
    pub fn decode(bytes: Bytes) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let declared = reader.u32()? as usize;
        if reader.remaining() != declared {
            return Err(WireError::LengthMismatch { declared, actual: reader.remaining() });
        }
        Self::decode_reader(reader)
    }

    /// Decodes a frame body whose length prefix was already consumed by the reader loop.
    pub fn decode_body(body: Bytes) -> Result<Self> {
        Self::decode_reader(Reader::new(body))
    }

    fn decode_reader(mut reader: Reader) -> Result<Self> {
        let version = reader.array::<3>()?;
        if version[..2] != VERSION || !matches!(version[2], b'D' | b'R') {
            return Err(WireError::BadVersion(version));
        }

        let kind_byte = reader.u8()?;
        let kind = FrameKind::from_u8(kind_byte).ok_or(WireError::UnknownFrameKind(kind_byte))?;
        let call_id = reader.uuid()?;
        let object_id = reader.uuid()?;

        let member_raw = reader.blob()?;
        if !member_raw.is_ascii() {
            return Err(WireError::NonAsciiMember(String::from_utf8_lossy(&member_raw).into_owned()));
        }
        let member = String::from_utf8(member_raw.to_vec()).map_err(|_| WireError::InvalidUtf8)?;
        let param_count = reader.u32()?;

        Ok(Frame {
            kind,
            call_id,
            object_id,
            member,
            param_count,
            payload: reader.rest(),
        })
    }

    /// Encoded size including the length prefix.
    pub fn encoded_len(&self) -> usize {
        LENGTH_PREFIX + FIXED_BODY + self.member.len() + self.payload.as_ref().map_or(0, |p| p.len())
    }
}

fn normalize(payload: Option<Bytes>) -> Option<Bytes> {
    payload.filter(|p| !p.is_empty())
}
