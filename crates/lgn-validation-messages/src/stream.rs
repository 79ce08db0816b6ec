use crate::{MessageError, MessageReader, MessageWriter, Result};

/// A message kind carried in streams.
pub trait Message: Sized {
    const ID: u32;

    fn encode(&self, writer: &mut MessageWriter);

    /// # Errors
    ///
    /// Decoding is total: malformed payloads fail, they never panic.
    fn decode(reader: &mut MessageReader<'_>) -> Result<Self>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSchemaKind {
    /// Homogeneous stream of one message id, no per-message framing.
    Typed,
    /// Heterogeneous stream with per-message framing; append order is the
    /// delivery order.
    Ordered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSchema {
    pub kind: MessageSchemaKind,
    /// Message id of typed streams; zero for ordered streams.
    pub message_id: u32,
}

impl MessageSchema {
    pub fn typed(message_id: u32) -> Self {
        Self {
            kind: MessageSchemaKind::Typed,
            message_id,
        }
    }

    pub fn ordered() -> Self {
        Self {
            kind: MessageSchemaKind::Ordered,
            message_id: 0,
        }
    }

    /// Wire encoding: the ordered flag rides the high bit.
    pub fn pack(&self) -> u32 {
        match self.kind {
            MessageSchemaKind::Typed => self.message_id,
            MessageSchemaKind::Ordered => 1 << 31,
        }
    }

    pub fn unpack(raw: u32) -> Self {
        if raw & (1 << 31) != 0 {
            Self::ordered()
        } else {
            Self::typed(raw)
        }
    }
}

/// A typed blob of messages.
#[derive(Debug, Clone)]
pub struct MessageStream {
    schema: MessageSchema,
    version_id: u32,
    count: u32,
    data: Vec<u8>,
}

impl MessageStream {
    pub fn typed<T: Message>() -> Self {
        Self {
            schema: MessageSchema::typed(T::ID),
            version_id: 0,
            count: 0,
            data: Vec::new(),
        }
    }

    pub fn ordered() -> Self {
        Self {
            schema: MessageSchema::ordered(),
            version_id: 0,
            count: 0,
            data: Vec::new(),
        }
    }

    /// Reassemble a stream received off the wire.
    pub fn from_parts(schema: MessageSchema, version_id: u32, count: u32, data: Vec<u8>) -> Self {
        Self {
            schema,
            version_id,
            count,
            data,
        }
    }

    pub fn schema(&self) -> MessageSchema {
        self.schema
    }

    pub fn version_id(&self) -> u32 {
        self.version_id
    }

    pub fn set_version_id(&mut self, version_id: u32) {
        self.version_id = version_id;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Reset to an empty stream of the same schema. The backing storage is
    /// handed back to the caller, matching the swap idiom of the transport.
    pub fn swap_out(&mut self) -> MessageStream {
        let swapped = MessageStream {
            schema: self.schema,
            version_id: self.version_id,
            count: self.count,
            data: std::mem::take(&mut self.data),
        };
        self.count = 0;
        swapped
    }

    /// Append a message to a typed stream.
    ///
    /// # Panics
    ///
    /// The stream must be typed to `T`; mixing ids is a programming error.
    pub fn add<T: Message>(&mut self, message: &T) {
        assert_eq!(
            self.schema,
            MessageSchema::typed(T::ID),
            "message id does not match the stream schema"
        );

        let mut writer = MessageWriter::new();
        message.encode(&mut writer);
        self.data.extend_from_slice(&writer.into_bytes());
        self.count += 1;
    }

    /// Append a message to an ordered stream.
    ///
    /// # Panics
    ///
    /// The stream must be ordered.
    pub fn add_ordered<T: Message>(&mut self, message: &T) {
        assert_eq!(
            self.schema.kind,
            MessageSchemaKind::Ordered,
            "stream is not ordered"
        );

        let mut writer = MessageWriter::new();
        message.encode(&mut writer);
        let payload = writer.into_bytes();

        let mut framing = MessageWriter::new();
        framing.write_u32(T::ID);
        framing.write_bytes(&payload);
        self.data.extend_from_slice(&framing.into_bytes());
        self.count += 1;
    }

    /// Decode a typed stream.
    ///
    /// # Errors
    ///
    /// Fails on schema mismatch or a truncated payload.
    pub fn decode_all<T: Message>(&self) -> Result<Vec<T>> {
        if self.schema != MessageSchema::typed(T::ID) {
            return Err(MessageError::SchemaMismatch {
                expected: T::ID,
                found: self.schema.message_id,
            });
        }

        let mut reader = MessageReader::new(&self.data);
        let mut messages = Vec::with_capacity(self.count as usize);
        for _ in 0..self.count {
            messages.push(T::decode(&mut reader)?);
        }
        Ok(messages)
    }

    /// Iterate an ordered stream's framed messages in append order.
    pub fn iter_ordered(&self) -> OrderedIter<'_> {
        OrderedIter {
            reader: MessageReader::new(&self.data),
            remaining: self.count,
        }
    }
}

/// One framed entry of an ordered stream.
#[derive(Debug, Clone, Copy)]
pub struct OrderedMessageRef<'a> {
    pub message_id: u32,
    pub payload: &'a [u8],
}

impl OrderedMessageRef<'_> {
    /// Decode the entry as a concrete message kind.
    ///
    /// # Errors
    ///
    /// Fails on id mismatch or a truncated payload.
    pub fn decode<T: Message>(&self) -> Result<T> {
        if self.message_id != T::ID {
            return Err(MessageError::SchemaMismatch {
                expected: T::ID,
                found: self.message_id,
            });
        }
        T::decode(&mut MessageReader::new(self.payload))
    }
}

pub struct OrderedIter<'a> {
    reader: MessageReader<'a>,
    remaining: u32,
}

impl<'a> Iterator for OrderedIter<'a> {
    type Item = Result<OrderedMessageRef<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let entry = (|| {
            let message_id = self.reader.read_u32()?;
            let payload = self.reader.read_bytes()?;
            Ok(OrderedMessageRef {
                message_id,
                payload,
            })
        })();

        if entry.is_err() {
            self.remaining = 0;
        }
        Some(entry)
    }
}
