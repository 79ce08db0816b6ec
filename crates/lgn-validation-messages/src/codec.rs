use byteorder::{ByteOrder, LittleEndian};

use crate::{MessageError, Result};

/// Append-only encoder for message payloads.
#[derive(Default)]
pub struct MessageWriter {
    bytes: Vec<u8>,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Length-prefixed byte array.
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_u32(value.len() as u32);
        self.bytes.extend_from_slice(value);
    }

    /// Length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }
}

/// Bounds-checked cursor over a message payload.
pub struct MessageReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> MessageReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.position + count > self.bytes.len() {
            return Err(MessageError::Truncated(self.position));
        }
        let slice = &self.bytes[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    /// # Errors
    ///
    /// Fails with [`MessageError::Truncated`] past the payload end.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// # Errors
    ///
    /// Fails with [`MessageError::Truncated`] past the payload end.
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    /// # Errors
    ///
    /// Fails with [`MessageError::Truncated`] past the payload end.
    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    /// # Errors
    ///
    /// Fails with [`MessageError::Truncated`] past the payload end.
    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let length = self.read_u32()? as usize;
        self.take(length)
    }

    /// # Errors
    ///
    /// Fails with [`MessageError::Truncated`] past the payload end or
    /// [`MessageError::InvalidString`] on malformed UTF-8.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| MessageError::InvalidString)
    }
}
