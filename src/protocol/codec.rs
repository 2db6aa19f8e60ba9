//! Protocol codec for encoding/decoding messages
//!
//! Handles the fixed-header framing of protocol messages. All integer
//! fields are big-endian regardless of host byte order; the serialized
//! form of a message is exactly `HEADER_SIZE + payload.len()` bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;

use super::{Message, MessageType};

/// Maximum payload size (1 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Header size: type(1) + flags(1) + sender(4) + receiver(4) +
/// sequence(4) + timestamp(8) + length(4) = 26 bytes
pub const HEADER_SIZE: usize = 26;

/// Flags bit 0: the sender asked for reliable delivery
const FLAG_RELIABLE: u8 = 0x01;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid message: {0}")]
    Invalid(&'static str),

    #[error("Payload too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Header fields parsed off the wire, before the payload is available
#[derive(Debug, Clone, Copy)]
struct Header {
    kind: MessageType,
    reliable: bool,
    sender_id: u32,
    receiver_id: u32,
    sequence: u32,
    timestamp: i64,
    payload_len: usize,
}

/// Parse a header from the first `HEADER_SIZE` bytes of `buf`.
/// The caller guarantees `buf.len() >= HEADER_SIZE`.
fn parse_header(buf: &[u8]) -> Result<Header, CodecError> {
    let kind = MessageType::from_wire(buf[0])
        .ok_or(CodecError::Invalid("unknown message type"))?;
    // Bits 1-7 of the flags byte are reserved and ignored on read
    let reliable = buf[1] & FLAG_RELIABLE != 0;
    let sender_id = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
    let receiver_id = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
    let sequence = u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]);
    let timestamp = i64::from_be_bytes([
        buf[14], buf[15], buf[16], buf[17], buf[18], buf[19], buf[20], buf[21],
    ]);
    let payload_len = u32::from_be_bytes([buf[22], buf[23], buf[24], buf[25]]) as usize;

    Ok(Header {
        kind,
        reliable,
        sender_id,
        receiver_id,
        sequence,
        timestamp,
        payload_len,
    })
}

impl Message {
    /// Encode this message into a buffer
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::MessageTooLarge(
                self.payload.len(),
                MAX_PAYLOAD_SIZE,
            ));
        }

        buf.reserve(HEADER_SIZE + self.payload.len());
        buf.put_u8(self.kind as u8);
        // Reserved bits are always written as zero
        buf.put_u8(if self.reliable { FLAG_RELIABLE } else { 0 });
        buf.put_u32(self.sender_id);
        buf.put_u32(self.receiver_id);
        buf.put_u32(self.sequence);
        buf.put_i64(self.timestamp);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        Ok(())
    }

    /// Encode this message into a freshly allocated byte buffer
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one message from a byte slice.
    ///
    /// Fails with `CodecError::Invalid` if the slice is shorter than the
    /// header, the declared payload length overruns the slice, or the
    /// message type is unknown. The payload is copied out of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Message, CodecError> {
        if buf.len() < HEADER_SIZE {
            return Err(CodecError::Invalid("truncated header"));
        }

        let header = parse_header(buf)?;
        if header.payload_len > MAX_PAYLOAD_SIZE {
            return Err(CodecError::MessageTooLarge(header.payload_len, MAX_PAYLOAD_SIZE));
        }
        if buf.len() < HEADER_SIZE + header.payload_len {
            return Err(CodecError::Invalid("truncated payload"));
        }

        let payload =
            Bytes::copy_from_slice(&buf[HEADER_SIZE..HEADER_SIZE + header.payload_len]);

        Ok(Message {
            kind: header.kind,
            sender_id: header.sender_id,
            receiver_id: header.receiver_id,
            sequence: header.sequence,
            timestamp: header.timestamp,
            reliable: header.reliable,
            payload,
        })
    }
}

/// Streaming decoder that reassembles messages from a byte stream.
///
/// TCP delivers arbitrary chunks; a message boundary is only known after
/// the full header has been read, so the decoder buffers partial headers
/// and payloads across calls.
pub struct Decoder {
    state: DecodeState,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Payload(Header),
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
        }
    }

    /// Attempt to decode a message from the buffer.
    /// Returns `Ok(None)` if more data is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        loop {
            match &self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let header = parse_header(&buf[..HEADER_SIZE])?;
                    if header.payload_len > MAX_PAYLOAD_SIZE {
                        return Err(CodecError::MessageTooLarge(
                            header.payload_len,
                            MAX_PAYLOAD_SIZE,
                        ));
                    }

                    buf.advance(HEADER_SIZE);
                    self.state = DecodeState::Payload(header);
                }
                DecodeState::Payload(header) => {
                    if buf.len() < header.payload_len {
                        return Ok(None);
                    }

                    let header = *header;
                    let payload = buf.split_to(header.payload_len).freeze();
                    self.state = DecodeState::Header;

                    return Ok(Some(Message {
                        kind: header.kind,
                        sender_id: header.sender_id,
                        receiver_id: header.receiver_id,
                        sequence: header.sequence,
                        timestamp: header.timestamp,
                        reliable: header.reliable,
                        payload,
                    }));
                }
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
