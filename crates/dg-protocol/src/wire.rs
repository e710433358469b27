//! Primitive SSH wire types
//!
//! Channel-request payloads are built from two primitives:
//! - uint32: 4 bytes, big-endian
//! - string: uint32 length followed by that many bytes
//!
//! Every read is bounds-checked against the bytes that remain, so a length
//! prefix that overruns the payload is reported instead of panicking.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;

/// Cursor over a request payload
#[derive(Debug)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    /// Create a reader over the full payload
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Whether the payload has been fully consumed
    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    /// Read a big-endian uint32
    pub fn read_u32(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        self.ensure(field, 4)?;
        Ok(self.buf.get_u32())
    }

    /// Read a length-prefixed byte string
    pub fn read_bytes(&mut self, field: &'static str) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_u32(field)? as usize;
        self.ensure(field, len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Read a length-prefixed UTF-8 string
    pub fn read_string(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let raw = self.read_bytes(field)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8 { field })
    }

    fn ensure(&self, field: &'static str, needed: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::Truncated {
                field,
                needed,
                available: self.buf.remaining(),
            });
        }
        Ok(())
    }
}

/// Builder for request payloads
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a big-endian uint32
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    /// Append a length-prefixed byte string
    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.reserve(4 + value.len());
        self.buf.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
        self
    }

    /// Append a length-prefixed UTF-8 string
    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.put_bytes(value.as_bytes())
    }

    /// Finish and return the encoded payload
    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}
