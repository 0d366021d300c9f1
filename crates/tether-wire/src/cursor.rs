//! # Cursor
//!
//! A bounds-checked read cursor over a shared byte buffer.
//!
//! `bytes::Buf` panics when asked for more than it holds; every read here
//! checks first and returns [`WireError::UnexpectedEnd`] instead, so decoding
//! hostile input never panics.

use bytes::Buf;
use bytes::Bytes;
use uuid::Uuid;

use crate::error::Result;
use crate::error::WireError;

/// Zero-copy reader. Slices handed out share the underlying allocation.
#[derive(Debug, Clone)]
pub struct Reader {
    buf: Bytes,
}

impl Reader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Returns the number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.len() < n {
            return Err(WireError::UnexpectedEnd);
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn f64(&mut self) -> Result<f64> {
        self.need(8)?;
        Ok(self.buf.get_f64_le())
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.need(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    pub fn uuid(&mut self) -> Result<Uuid> {
        Ok(Uuid::from_bytes(self.array::<16>()?))
    }

    /// Splits off the next `n` bytes without copying.
    pub fn take(&mut self, n: usize) -> Result<Bytes> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    /// A `u32` length followed by that many bytes.
    pub fn blob(&mut self) -> Result<Bytes> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    /// A `u32` length followed by that many bytes of UTF-8.
    pub fn string(&mut self) -> Result<String> {
        let raw = self.blob()?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    /// Everything that has not been read yet, or `None` if nothing is left.
    pub fn rest(self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf)
        }
    }
}

/// Checks that a length fits the 32-bit length fields used everywhere on the wire.
pub fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| WireError::FrameTooLarge(len))
}
