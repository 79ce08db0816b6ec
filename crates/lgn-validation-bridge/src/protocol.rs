//! Wire framing: `magic | schema | version | size | payload`.

use byteorder::{ByteOrder, LittleEndian};
use lgn_validation_messages::{MessageSchema, MessageStream};

use crate::{Result, TransportError};

/// Frame sentinel; a mismatch aborts the connection.
pub const MAGIC: u32 = 0x4C47_4E42;

/// Byte size of the frame header.
pub const HEADER_SIZE: usize = 16;

/// Serialize one stream as a frame.
pub fn encode_frame(stream: &MessageStream) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + stream.byte_size());
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&stream.schema().pack().to_le_bytes());
    out.extend_from_slice(&stream.version_id().to_le_bytes());
    // Message count leads the payload so the stream reassembles exactly.
    out.extend_from_slice(&((stream.byte_size() + 4) as u32).to_le_bytes());
    out.extend_from_slice(&stream.count().to_le_bytes());
    out.extend_from_slice(stream.data());
    out
}

/// Attempt to pull one whole frame off the accumulation buffer.
///
/// Returns `Ok(None)` until a full frame is buffered; on success the
/// consumed byte count accompanies the stream.
///
/// # Errors
///
/// A magic mismatch is a framing violation; the caller aborts the
/// connection.
pub fn try_decode_frame(buffer: &[u8]) -> Result<Option<(MessageStream, usize)>> {
    if buffer.len() < HEADER_SIZE {
        return Ok(None);
    }

    let magic = LittleEndian::read_u32(&buffer[0..4]);
    if magic != MAGIC {
        return Err(TransportError::Framing(format!(
            "unexpected frame magic {:#010x}",
            magic
        )));
    }

    let schema = MessageSchema::unpack(LittleEndian::read_u32(&buffer[4..8]));
    let version_id = LittleEndian::read_u32(&buffer[8..12]);
    let size = LittleEndian::read_u32(&buffer[12..16]) as usize;

    if size < 4 {
        return Err(TransportError::Framing(format!(
            "frame payload of {} bytes below the count header",
            size
        )));
    }

    if buffer.len() < HEADER_SIZE + size {
        return Ok(None);
    }

    let count = LittleEndian::read_u32(&buffer[16..20]);
    let data = buffer[20..HEADER_SIZE + size].to_vec();

    let stream = MessageStream::from_parts(schema, version_id, count, data);
    Ok(Some((stream, HEADER_SIZE + size)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lgn_validation_messages::diagnostic::VersionBranchMessage;

    #[test]
    fn test_frame_roundtrip() {
        let mut stream = MessageStream::typed::<VersionBranchMessage>();
        stream.set_version_id(5);
        stream.add(&VersionBranchMessage { head: 7 });

        let frame = encode_frame(&stream);
        let (decoded, consumed) = try_decode_frame(&frame).unwrap().unwrap();

        assert_eq!(consumed, frame.len());
        assert_eq!(decoded.schema(), stream.schema());
        assert_eq!(decoded.version_id(), 5);
        assert_eq!(decoded.count(), 1);
        assert_eq!(decoded.data(), stream.data());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut stream = MessageStream::typed::<VersionBranchMessage>();
        stream.add(&VersionBranchMessage { head: 7 });
        let frame = encode_frame(&stream);

        for cut in 0..frame.len() {
            assert!(try_decode_frame(&frame[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn test_bad_magic_aborts() {
        let mut frame = encode_frame(&MessageStream::ordered());
        frame[0] ^= 0xFF;
        assert!(matches!(
            try_decode_frame(&frame),
            Err(TransportError::Framing(_))
        ));
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut a = MessageStream::typed::<VersionBranchMessage>();
        a.add(&VersionBranchMessage { head: 1 });
        let mut b = MessageStream::typed::<VersionBranchMessage>();
        b.add(&VersionBranchMessage { head: 2 });

        let mut wire = encode_frame(&a);
        wire.extend_from_slice(&encode_frame(&b));

        let (first, consumed) = try_decode_frame(&wire).unwrap().unwrap();
        let (second, _) = try_decode_frame(&wire[consumed..]).unwrap().unwrap();

        assert_eq!(
            first.decode_all::<VersionBranchMessage>().unwrap()[0].head,
            1
        );
        assert_eq!(
            second.decode_all::<VersionBranchMessage>().unwrap()[0].head,
            2
        );
    }
}
