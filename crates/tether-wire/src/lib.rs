//! # Tether Wire
//!
//! The byte-level protocol spoken between a tether client and server.
//!
//! ## Architecture
//!
//! - **Frames** ([`frame`]): one fixed-layout envelope per request, response or
//!   notification. Frames know nothing about values; the payload is opaque.
//! - **Values** ([`value`]): the dynamically typed data model carried inside
//!   payloads, generic over the handle type each side uses for objects.
//! - **Codec** ([`codec`]): translates values to and from payload bytes.
//!   Objects are never serialized directly; they pass through a pair of
//!   reference hooks supplied by whoever owns the identity tables.

pub mod codec;
pub mod cursor;
pub mod error;
pub mod frame;
pub mod value;


pub use codec::NoReferences;
pub use codec::ReferenceReader;
pub use codec::ReferenceWriter;
pub use codec::WireObject;
pub use codec::decode_error;
pub use codec::decode_single;
pub use codec::decode_state;
pub use codec::decode_values;
pub use codec::encode_error;
pub use codec::encode_single;
pub use codec::encode_state;
pub use codec::encode_values;
pub use error::RemoteError;
pub use error::RemoteErrorKind;
pub use error::Result;
pub use error::WireError;
pub use frame::Frame;
pub use frame::FrameKind;
pub use frame::PROPERTY_CHANGED;
pub use value::Value;
