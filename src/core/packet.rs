//! # Packet Writers and Readers
//!
//! [`PacketWriter`] is a pooled [`BitBuffer`] tagged with the opcode of the
//! message being assembled. It is only obtainable from a [`WriterPool`] and
//! goes back to that pool when dropped, whatever path the caller leaves by.
//!
//! [`PacketReader`] is a short-lived, read-only view over one inbound frame
//! payload. It never outlives the dispatch call that created it.
//!
//! ## Usage
//! ```rust
//! use tickwire::core::bitbuf::{BitRead, BitWrite};
//! use tickwire::core::packet::WriterPool;
//!
//! let pool = WriterPool::default();
//! let mut writer = pool.checkout(1).unwrap();
//! writer.write_string("hello").unwrap();
//! writer.write_i32(42).unwrap();
//!
//! let mut reader = writer.reader();
//! assert_eq!(reader.read_string().unwrap(), "hello");
//! assert_eq!(reader.read_i32().unwrap(), 42);
//! ```

use std::ops::{Deref, DerefMut};

use crate::config::PoolConfig;
use crate::core::bitbuf::{read_bits_at, read_raw_at, BitBuffer, BitRead, BufferMode};
use crate::core::codec::{Frame, OutboundFrame};
use crate::error::Result;
use crate::utils::pool::{LeakReport, ObjectPool, PoolHandle, PoolSettings, PoolStats, Pooled};

/// Initial capacity of a freshly checked-out writer
pub const DEFAULT_WRITER_CAPACITY: usize = 128;

/// A checked-out outbound message under construction
#[derive(Debug)]
pub struct PacketWriter {
    opcode: u32,
    body: Pooled<BitBuffer>,
}

impl PacketWriter {
    #[inline]
    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    pub fn set_opcode(&mut self, opcode: u32) {
        self.opcode = opcode;
    }

    /// Pool slot this writer occupies
    #[inline]
    pub fn handle(&self) -> PoolHandle {
        self.body.handle()
    }

    /// Encoded payload bytes, final partial byte zero-padded
    pub fn payload(&self) -> &[u8] {
        self.body.as_bytes()
    }

    /// Borrow the writer as a frame ready for the codec
    pub fn as_frame(&self) -> OutboundFrame<'_> {
        OutboundFrame {
            opcode: self.opcode,
            payload: self.payload(),
        }
    }

    /// Read back what has been written so far
    pub fn reader(&self) -> PacketReader<'_> {
        PacketReader::new(self.opcode, self.payload())
    }
}

impl Deref for PacketWriter {
    type Target = BitBuffer;

    fn deref(&self) -> &Self::Target {
        &self.body
    }
}

impl DerefMut for PacketWriter {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.body
    }
}

/// Pool of packet writers
///
/// Cheap to clone; clones share the same slots. Usually owned by a connection
/// manager and handed to whatever code produces outbound packets.
#[derive(Clone)]
pub struct WriterPool {
    pool: ObjectPool<BitBuffer>,
    writer_capacity: usize,
}

impl Default for WriterPool {
    fn default() -> Self {
        Self::new(PoolSettings::default(), DEFAULT_WRITER_CAPACITY)
    }
}

impl WriterPool {
    pub fn new(settings: PoolSettings, writer_capacity: usize) -> Self {
        let pool = ObjectPool::new(settings, move || {
            BitBuffer::with_capacity(writer_capacity, BufferMode::Dynamic)
        });
        Self {
            pool,
            writer_capacity,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.to_settings(), config.writer_capacity)
    }

    /// Check out an empty dynamic writer for `opcode`.
    pub fn checkout(&self, opcode: u32) -> Result<PacketWriter> {
        let mut body = self.pool.checkout()?;
        if body.capacity() < self.writer_capacity {
            body.reset_to_capacity(self.writer_capacity);
        }
        Ok(PacketWriter { opcode, body })
    }

    /// Release a writer, checking it was issued by this pool.
    ///
    /// Dropping the writer has the same effect without the ownership check.
    pub fn release(&self, writer: PacketWriter) -> Result<()> {
        self.pool.release(writer.body)
    }

    pub fn is_checked_out(&self, handle: PoolHandle) -> bool {
        self.pool.is_checked_out(handle)
    }

    pub fn sweep_leaks(&self) -> Vec<LeakReport> {
        self.pool.sweep_leaks()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

/// Read-only view over one frame payload
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    opcode: u32,
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(opcode: u32, data: &'a [u8]) -> Self {
        Self {
            opcode,
            data,
            pos: 0,
        }
    }

    #[inline]
    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    /// Payload length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bit position of the read cursor
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// The whole payload, regardless of the cursor
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }
}

impl<'a> From<&'a Frame> for PacketReader<'a> {
    fn from(frame: &'a Frame) -> Self {
        PacketReader::new(frame.opcode, &frame.payload)
    }
}

impl BitRead for PacketReader<'_> {
    fn read_bits(&mut self, bits: u32) -> Result<u64> {
        read_bits_at(self.data, &mut self.pos, self.data.len() * 8, bits)
    }

    fn remaining_bits(&self) -> usize {
        self.data.len() * 8 - self.pos
    }

    fn read_raw_into(&mut self, out: &mut [u8]) -> Result<()> {
        read_raw_at(self.data, &mut self.pos, self.data.len() * 8, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bitbuf::BitWrite;
    use crate::core::codec::FrameCodec;
    use crate::error::ProtocolError;
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn test_checkout_is_empty_dynamic_with_default_capacity() {
        let pool = WriterPool::default();
        let writer = pool.checkout(9).unwrap();
        assert_eq!(writer.opcode(), 9);
        assert!(writer.is_empty());
        assert_eq!(writer.mode(), BufferMode::Dynamic);
        assert!(writer.capacity() >= DEFAULT_WRITER_CAPACITY);
    }

    #[test]
    fn test_recycled_writer_is_reset() {
        let pool = WriterPool::default();
        {
            let mut writer = pool.checkout(1).unwrap();
            writer.set_mode(BufferMode::Static);
            writer.write_u64(u64::MAX).unwrap();
        }
        let writer = pool.checkout(2).unwrap();
        assert!(writer.is_empty());
        assert_eq!(writer.mode(), BufferMode::Dynamic);
        assert_eq!(pool.stats().created, 1);
    }

    #[test]
    fn test_writer_released_on_error_path() {
        fn assemble(pool: &WriterPool) -> Result<()> {
            let mut writer = pool.checkout(5)?;
            writer.write_u8(1)?;
            writer.write_string(&"x".repeat(70_000))?;
            Ok(())
        }

        let pool = WriterPool::default();
        assert!(matches!(
            assemble(&pool),
            Err(ProtocolError::ValueTooLarge { .. })
        ));
        assert_eq!(pool.stats().checked_out, 0);
    }

    #[test]
    fn test_release_to_foreign_pool() {
        let pool = WriterPool::default();
        let other = WriterPool::default();
        let writer = pool.checkout(1).unwrap();
        assert!(matches!(other.release(writer), Err(ProtocolError::NotOwned)));
        assert_eq!(pool.stats().available, 1);
    }

    #[test]
    fn test_release_clears_handle() {
        let pool = WriterPool::default();
        let writer = pool.checkout(1).unwrap();
        let handle = writer.handle();
        assert!(pool.is_checked_out(handle));
        pool.release(writer).unwrap();
        assert!(!pool.is_checked_out(handle));
    }

    #[test]
    fn test_writer_leak_flagged() {
        let pool = WriterPool::new(
            PoolSettings {
                leak_threshold: Some(Duration::from_millis(10)),
                ..Default::default()
            },
            DEFAULT_WRITER_CAPACITY,
        );
        let _held = pool.checkout(1).unwrap();
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(pool.sweep_leaks().len(), 1);
        assert!(pool.sweep_leaks().is_empty());
    }

    #[test]
    fn test_reader_bounds() {
        let mut reader = PacketReader::new(1, &[0xF0]);
        assert_eq!(reader.read_bits(4).unwrap(), 0xF);
        assert_eq!(reader.remaining_bits(), 4);
        assert!(matches!(
            reader.read_u8(),
            Err(ProtocolError::BufferUnderrun {
                requested_bits: 8,
                available_bits: 4
            })
        ));
        assert_eq!(reader.read_bits(4).unwrap(), 0);
        assert_eq!(reader.position(), 8);
    }

    #[test]
    fn test_writer_through_codec() {
        let pool = WriterPool::default();
        let mut writer = pool.checkout(1).unwrap();
        writer.write_string("hello").unwrap();
        writer.write_i32(42).unwrap();

        let mut codec = FrameCodec::default();
        let mut wire = BytesMut::new();
        codec.encode(writer.as_frame(), &mut wire).unwrap();
        drop(writer);

        let frame = codec.decode(&mut wire).unwrap().unwrap();
        let mut reader = PacketReader::from(&frame);
        assert_eq!(reader.opcode(), 1);
        assert_eq!(reader.read_string().unwrap(), "hello");
        assert_eq!(reader.read_i32().unwrap(), 42);
        assert_eq!(reader.remaining_bits(), 0);
    }
}
