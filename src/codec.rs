//! Framing: the [`Codec`] trait and the built-in binary codec.
//!
//! A codec is a stateful per-connection translator between opaque message
//! payloads and self-delimited wire frames. Every frame carries the channel
//! that multiplexes it; the peer engine never looks inside payloads.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;

/// Channel identifier multiplexing concurrent calls over one connection.
pub type Channel = u16;

/// Highest channel budget a peer may be configured with.
pub const MAX_CHANNELS: usize = 1 << 15;

/// Wire encoding of "channel not yet assigned".
///
/// Valid channels are below [`MAX_CHANNELS`], so the sentinel can never
/// collide with one. It may only appear inside a pre-encoded frame that
/// will be passed through [`Codec::recode`] before reaching the wire.
pub const UNASSIGNED_CHANNEL: Channel = u16::MAX;

/// One decoded message tagged with its channel.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The channel this message belongs to.
    pub channel: Channel,
    /// The message payload.
    pub payload: Bytes,
}

/// Per-connection byte↔message translator.
///
/// Implementations may retain partial input between [`decode`](Codec::decode)
/// calls; chunk boundaries carry no meaning. Decode errors are fatal to the
/// peer that owns the codec; encode errors fail only the originating call.
pub trait Codec: Send + 'static {
    /// Append exactly one self-delimited frame carrying `channel` to `dst`.
    fn encode(
        &mut self,
        payload: &[u8],
        channel: Channel,
        dst: &mut BytesMut,
    ) -> Result<(), CodecError>;

    /// Consume a chunk of incoming bytes, appending every fully-parsed frame
    /// to `out` in wire order.
    fn decode(&mut self, chunk: &[u8], out: &mut Vec<Frame>) -> Result<(), CodecError>;

    /// Whether [`recode`](Codec::recode) is supported.
    fn recoding(&self) -> bool {
        false
    }

    /// Rewrite the channel field of a previously encoded frame without
    /// re-encoding the payload. Must be O(1) in the payload size.
    fn recode(&self, frame: &mut BytesMut, channel: Channel) -> Result<(), CodecError> {
        let _ = (frame, channel);
        Err(CodecError::RecodingUnsupported)
    }
}

/// Frame header: magic (2) + length (4) + channel (2) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Magic bytes: "MX" (0x4d 0x58).
pub const MAGIC: [u8; 2] = [0x4d, 0x58];

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

const CHANNEL_OFFSET: usize = 6;

/// The built-in length-delimited codec.
///
/// Wire format:
/// ```text
/// ┌────────────┬───────────┬──────────┬─────────────────┐
/// │ Magic (2B) │ Length    │ Channel  │ Payload         │
/// │ 0x4d 0x58  │ (4B LE)   │ (2B LE)  │ (Length bytes)  │
/// └────────────┴───────────┴──────────┴─────────────────┘
/// ```
///
/// The channel field sits at a fixed offset, so this codec is
/// recoding-capable: rewriting the channel of a pre-encoded frame touches
/// two bytes regardless of payload size.
#[derive(Debug)]
pub struct BinaryCodec {
    max_payload: usize,
    buf: BytesMut,
}

impl BinaryCodec {
    /// Create a codec with the default payload limit.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    /// Create a codec with a custom payload limit.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            max_payload,
            buf: BytesMut::new(),
        }
    }

    fn decode_one(&mut self) -> Result<Option<Frame>, CodecError> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        if self.buf[0..2] != MAGIC {
            return Err(CodecError::BadMagic {
                found: [self.buf[0], self.buf[1]],
            });
        }

        let payload_len = u32::from_le_bytes(self.buf[2..6].try_into().unwrap()) as usize;
        let channel = u16::from_le_bytes(self.buf[6..8].try_into().unwrap());

        if payload_len > self.max_payload {
            return Err(CodecError::PayloadTooLarge {
                len: payload_len,
                max: self.max_payload,
            });
        }
        // The sentinel must never survive to the wire.
        if channel as usize >= MAX_CHANNELS {
            return Err(CodecError::ChannelOutOfRange { channel });
        }

        if self.buf.len() < HEADER_SIZE + payload_len {
            return Ok(None);
        }

        self.buf.advance(HEADER_SIZE);
        let payload = self.buf.split_to(payload_len).freeze();

        Ok(Some(Frame { channel, payload }))
    }
}

impl Default for BinaryCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for BinaryCodec {
    fn encode(
        &mut self,
        payload: &[u8],
        channel: Channel,
        dst: &mut BytesMut,
    ) -> Result<(), CodecError> {
        if channel as usize >= MAX_CHANNELS && channel != UNASSIGNED_CHANNEL {
            return Err(CodecError::ChannelOutOfRange { channel });
        }
        if payload.len() > self.max_payload {
            return Err(CodecError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_payload,
            });
        }
        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&MAGIC);
        dst.put_u32_le(payload.len() as u32);
        dst.put_u16_le(channel);
        dst.put_slice(payload);
        Ok(())
    }

    fn decode(&mut self, chunk: &[u8], out: &mut Vec<Frame>) -> Result<(), CodecError> {
        self.buf.extend_from_slice(chunk);
        while let Some(frame) = self.decode_one()? {
            out.push(frame);
        }
        Ok(())
    }

    fn recoding(&self) -> bool {
        true
    }

    fn recode(&self, frame: &mut BytesMut, channel: Channel) -> Result<(), CodecError> {
        if channel as usize >= MAX_CHANNELS {
            return Err(CodecError::ChannelOutOfRange { channel });
        }
        if frame.len() < HEADER_SIZE {
            return Err(CodecError::TruncatedFrame {
                len: frame.len(),
                needed: HEADER_SIZE,
            });
        }
        if frame[0..2] != MAGIC {
            return Err(CodecError::BadMagic {
                found: [frame[0], frame[1]],
            });
        }
        frame[CHANNEL_OFFSET..CHANNEL_OFFSET + 2].copy_from_slice(&channel.to_le_bytes());
        Ok(())
    }
}
