//! Checked big-endian reader over replication payloads.

use bytes::{Buf, Bytes};

use crate::{Error, Result};

/// Reads protocol fields out of a [`Bytes`] buffer, failing with
/// [`Error::InvalidMessage`] instead of panicking when the buffer runs short.
pub struct ByteReader {
    data: Bytes,
    context: &'static str,
}

impl ByteReader {
    /// `context` names the message being parsed and appears in every error.
    pub fn new(data: Bytes, context: &'static str) -> Self {
        Self { data, context }
    }

    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn ensure(&self, count: usize) -> Result<()> {
        if self.data.remaining() < count {
            return Err(Error::invalid_message(format!(
                "{}: need {} more bytes, have {}",
                self.context,
                count,
                self.data.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.data.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.data.get_u16())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.data.get_u32())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.data.get_i32())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.data.get_u64())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure(8)?;
        Ok(self.data.get_i64())
    }

    /// Read `len` bytes without copying.
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        self.ensure(len)?;
        Ok(self.data.split_to(len))
    }

    /// Read a null-terminated string, consuming the terminator.
    pub fn read_cstring(&mut self) -> Result<String> {
        let end = self.data.iter().position(|&b| b == 0).ok_or_else(|| {
            Error::invalid_message(format!("{}: unterminated string", self.context))
        })?;
        let raw = self.data.split_to(end);
        self.data.advance(1);
        String::from_utf8(raw.to_vec()).map_err(|_| {
            Error::invalid_message(format!("{}: string is not valid UTF-8", self.context))
        })
    }

    /// Everything that has not been read yet.
    pub fn rest(self) -> Bytes {
        self.data
    }
}
