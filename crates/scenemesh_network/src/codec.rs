//! Binary wire codec.
//!
//! Every frame is `[u32 length][u32 protocol version][u32 message type][payload]`,
//! little-endian, where `length` counts every byte after the length field.
//! Readers take the length first and then read exactly that many bytes, so
//! the receive buffer is sized once per message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::identity::{ParticipantId, ParticipantType};

/// Size of the leading length field.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Size of version + message type, the part of the header counted by `length`.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest `length` field read from or written to a socket (64 MiB).
///
/// Readers drop the connection on anything larger instead of allocating it.
pub const MAX_FRAME_LENGTH: u32 = 64 * 1024 * 1024;

/// Largest payload that fits in one frame.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_LENGTH as usize - FRAME_HEADER_SIZE;

/// Build a complete frame ready to be written to a socket.
///
/// `payload` must not exceed [`MAX_PAYLOAD_SIZE`]; `ConnectionSystem`
/// rejects larger messages before they reach the event loop.
pub fn encode_frame(protocol_version: u32, message_type: u32, payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE, "payload of {} bytes", payload.len());
    let mut buf = BytesMut::with_capacity(LENGTH_FIELD_SIZE + FRAME_HEADER_SIZE + payload.len());
    buf.put_u32_le((FRAME_HEADER_SIZE + payload.len()) as u32);
    buf.put_u32_le(protocol_version);
    buf.put_u32_le(message_type);
    buf.put_slice(payload);
    buf.freeze()
}

/// Header fields of a received frame body (the bytes after the length field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub protocol_version: u32,
    pub message_type: u32,
}

/// Split a received frame body into its header and payload.
pub fn decode_frame(body: &[u8]) -> Result<(FrameHeader, &[u8]), CodecError> {
    let mut reader = MessageReader::new(body);
    let protocol_version = reader.get_u32()?;
    let message_type = reader.get_u32()?;
    Ok((
        FrameHeader {
            protocol_version,
            message_type,
        },
        reader.remaining_bytes(),
    ))
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Serializes payload scalars.
#[derive(Debug, Default)]
pub struct MessageWriter {
    buf: BytesMut,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16_le(value);
        self
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32_le(value);
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64_le(value);
        self
    }

    pub fn put_participant_id(&mut self, id: &ParticipantId) -> &mut Self {
        self.buf.put_slice(id.as_bytes());
        self
    }

    pub fn put_participant_type(&mut self, participant_type: ParticipantType) -> &mut Self {
        self.put_u32(participant_type.to_wire())
    }

    /// Length-prefixed UTF-8.
    ///
    /// Lengths of 4 GiB and more wrap, but such a payload is far above
    /// [`MAX_PAYLOAD_SIZE`] and never sent.
    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.put_u32(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
        self
    }

    /// Length-prefixed raw bytes, bounded like [`put_string`](Self::put_string).
    pub fn put_blob(&mut self, data: &[u8]) -> &mut Self {
        self.put_u32(data.len() as u32);
        self.buf.put_slice(data);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Reads payload scalars, failing instead of reading past the end.
#[derive(Debug)]
pub struct MessageReader<'a> {
    buf: &'a [u8],
}

impl<'a> MessageReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn ensure(&self, needed: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < needed {
            return Err(CodecError::Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_u16(&mut self) -> Result<u16, CodecError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn get_participant_id(&mut self) -> Result<ParticipantId, CodecError> {
        self.ensure(16)?;
        let mut bytes = [0u8; 16];
        self.buf.copy_to_slice(&mut bytes);
        Ok(ParticipantId::from_bytes(bytes))
    }

    pub fn get_participant_type(&mut self) -> Result<ParticipantType, CodecError> {
        let raw = self.get_u32()?;
        ParticipantType::from_wire(raw).ok_or(CodecError::UnknownParticipantType(raw))
    }

    pub fn get_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.get_blob()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Borrow a length-prefixed byte run without copying.
    pub fn get_blob(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.get_u32()? as usize;
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn remaining_bytes(&self) -> &'a [u8] {
        self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(7, 5, &[0xAA, 0xBB]);
        assert_eq!(frame.len(), 4 + 8 + 2);
        // length counts everything after itself
        assert_eq!(&frame[0..4], &10u32.to_le_bytes());
        assert_eq!(&frame[4..8], &7u32.to_le_bytes());
        assert_eq!(&frame[8..12], &5u32.to_le_bytes());
        assert_eq!(&frame[12..], &[0xAA, 0xBB]);
    }

    #[test]
    fn test_decode_frame_splits_header_and_payload() {
        let frame = encode_frame(3, 9, b"payload");
        let (header, payload) = decode_frame(&frame[LENGTH_FIELD_SIZE..]).unwrap();
        assert_eq!(header.protocol_version, 3);
        assert_eq!(header.message_type, 9);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_empty_payload_frame() {
        let frame = encode_frame(1, 0, &[]);
        let (header, payload) = decode_frame(&frame[LENGTH_FIELD_SIZE..]).unwrap();
        assert_eq!(header.message_type, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_decode_frame_too_short() {
        let err = decode_frame(&[1, 0, 0]).unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                needed: 4,
                remaining: 3
            }
        );
    }

    #[test]
    fn test_writer_reader_scalars() {
        let id = ParticipantId::generate();
        let mut writer = MessageWriter::new();
        writer
            .put_participant_id(&id)
            .put_string("renderer")
            .put_u16(7001)
            .put_participant_type(ParticipantType::Daemon)
            .put_u64(u64::MAX)
            .put_blob(&[1, 2, 3]);
        let bytes = writer.finish();

        let mut reader = MessageReader::new(&bytes);
        assert_eq!(reader.get_participant_id().unwrap(), id);
        assert_eq!(reader.get_string().unwrap(), "renderer");
        assert_eq!(reader.get_u16().unwrap(), 7001);
        assert_eq!(reader.get_participant_type().unwrap(), ParticipantType::Daemon);
        assert_eq!(reader.get_u64().unwrap(), u64::MAX);
        assert_eq!(reader.get_blob().unwrap(), &[1, 2, 3]);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_blob_length_beyond_buffer_is_truncated() {
        let mut writer = MessageWriter::new();
        writer.put_u32(100);
        let bytes = writer.finish();
        let err = MessageReader::new(&bytes).get_blob().unwrap_err();
        assert!(matches!(err, CodecError::Truncated { needed: 100, .. }));
    }

    #[test]
    fn test_invalid_utf8_string() {
        let mut writer = MessageWriter::new();
        writer.put_blob(&[0xFF, 0xFE]);
        let bytes = writer.finish();
        assert_eq!(
            MessageReader::new(&bytes).get_string().unwrap_err(),
            CodecError::InvalidUtf8
        );
    }

    #[test]
    fn test_unknown_participant_type() {
        let mut writer = MessageWriter::new();
        writer.put_u32(42);
        let bytes = writer.finish();
        assert_eq!(
            MessageReader::new(&bytes).get_participant_type().unwrap_err(),
            CodecError::UnknownParticipantType(42)
        );
    }
}
