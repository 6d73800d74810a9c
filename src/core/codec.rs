//! # Frame Codec
//!
//! Length-prefixed framing for the byte stream between client and server.
//!
//! ## Wire Format
//! ```text
//! [Length(L)] [Opcode(O)] [Payload(Length - L - O)]
//! ```
//! `Length` counts the whole frame, including its own field. `L` and `O` are
//! fixed per deployment (1, 2 or 4 bytes, big-endian) and must match on both
//! ends of a connection.
//!
//! The codec implements tokio-util's `Decoder`/`Encoder`, so it can be driven
//! by a `Framed` stream or, as the connection managers do, called directly on
//! a per-connection accumulator. A partial frame is left in the accumulator
//! untouched until the rest arrives.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::FramingConfig;
use crate::error::{constants, ProtocolError, Result};

/// Width of a fixed-size integer header field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldWidth {
    U8,
    #[default]
    U16,
    U32,
}

impl FieldWidth {
    #[inline]
    pub fn bytes(self) -> usize {
        match self {
            FieldWidth::U8 => 1,
            FieldWidth::U16 => 2,
            FieldWidth::U32 => 4,
        }
    }

    #[inline]
    pub fn max_value(self) -> u64 {
        match self {
            FieldWidth::U8 => u64::from(u8::MAX),
            FieldWidth::U16 => u64::from(u16::MAX),
            FieldWidth::U32 => u64::from(u32::MAX),
        }
    }
}

/// A complete inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u32,
    pub payload: Bytes,
}

/// An outbound frame borrowed from a writer
#[derive(Debug, Clone, Copy)]
pub struct OutboundFrame<'a> {
    pub opcode: u32,
    pub payload: &'a [u8],
}

/// Length-prefixed frame codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    length_width: FieldWidth,
    opcode_width: FieldWidth,
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(FieldWidth::U16, FieldWidth::U16, u16::MAX as usize)
    }
}

impl FrameCodec {
    /// Build a codec; `max_frame_size` is clamped to what the length field can express.
    pub fn new(length_width: FieldWidth, opcode_width: FieldWidth, max_frame_size: usize) -> Self {
        let representable = length_width.max_value().min(usize::MAX as u64) as usize;
        Self {
            length_width,
            opcode_width,
            max_frame_size: max_frame_size.min(representable),
        }
    }

    pub fn from_config(config: &FramingConfig) -> Self {
        Self::new(
            config.length_width,
            config.opcode_width,
            config.max_frame_size,
        )
    }

    /// Bytes taken by the length and opcode fields
    #[inline]
    pub fn header_len(&self) -> usize {
        self.length_width.bytes() + self.opcode_width.bytes()
    }

    #[inline]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Largest payload a single frame can carry
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.max_frame_size.saturating_sub(self.header_len())
    }

    #[inline]
    pub fn opcode_width(&self) -> FieldWidth {
        self.opcode_width
    }

    #[inline]
    pub fn length_width(&self) -> FieldWidth {
        self.length_width
    }
}

fn read_uint(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte))
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let length_bytes = self.length_width.bytes();
        if src.len() < length_bytes {
            return Ok(None);
        }

        let length = read_uint(&src[..length_bytes]) as usize;
        if length < self.header_len() {
            return Err(ProtocolError::MalformedFrame(format!(
                "{}: {length} < {}",
                constants::ERR_LENGTH_BELOW_HEADER,
                self.header_len()
            )));
        }
        if length > self.max_frame_size {
            return Err(ProtocolError::MalformedFrame(format!(
                "{}: {length} > {}",
                constants::ERR_LENGTH_ABOVE_LIMIT,
                self.max_frame_size
            )));
        }

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(length);
        frame.advance(length_bytes);
        let opcode_bytes = self.opcode_width.bytes();
        let opcode = read_uint(&frame[..opcode_bytes]) as u32;
        frame.advance(opcode_bytes);

        Ok(Some(Frame {
            opcode,
            payload: frame.freeze(),
        }))
    }
}

impl<'a> Encoder<OutboundFrame<'a>> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: OutboundFrame<'a>, dst: &mut BytesMut) -> Result<()> {
        let max_opcode = self.opcode_width.max_value();
        if u64::from(item.opcode) > max_opcode {
            return Err(ProtocolError::ValueTooLarge {
                len: item.opcode as usize,
                max: max_opcode as usize,
            });
        }

        let total = self.header_len() + item.payload.len();
        if total > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(total));
        }

        dst.reserve(total);
        dst.put_uint(total as u64, self.length_width.bytes());
        dst.put_uint(u64::from(item.opcode), self.opcode_width.bytes());
        dst.put_slice(item.payload);
        Ok(())
    }
}
