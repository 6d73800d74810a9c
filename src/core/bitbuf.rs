//! # Bit Buffer
//!
//! Growable, bit-addressable read/write buffer underlying every encoded message.
//!
//! ## Bit Order
//! Values are written most-significant-bit first within each byte, and the
//! same order is used for reading. A single `1` bit written into an empty
//! buffer produces the byte `0x80`.
//!
//! ## Modes
//! - **Static**: capacity fixed at construction; writes past it fail with
//!   [`ProtocolError::CapacityExceeded`] and leave the buffer untouched.
//! - **Dynamic**: capacity doubles on demand. The backing storage may move on
//!   growth, so callers never hold a slice of it across a write.
//!
//! ## Usage
//! ```rust
//! use tickwire::core::bitbuf::{BitBuffer, BitRead, BitWrite, BufferMode};
//!
//! let mut buf = BitBuffer::with_capacity(16, BufferMode::Dynamic);
//! buf.write_bits(0b101, 3).unwrap();
//! buf.write_i32(-42).unwrap();
//! buf.write_string("hello").unwrap();
//!
//! assert_eq!(buf.read_bits(3).unwrap(), 0b101);
//! assert_eq!(buf.read_i32().unwrap(), -42);
//! assert_eq!(buf.read_string().unwrap(), "hello");
//! ```

use crate::error::{ProtocolError, Result};
use crate::utils::pool::Recycle;

/// Maximum length of a length-prefixed byte or string payload.
pub const MAX_PREFIXED_LEN: usize = u16::MAX as usize;

/// Largest capacity a recycled buffer keeps; bigger buffers are dropped on release.
pub const MAX_RETAINED_CAPACITY: usize = 64 * 1024;

/// Smallest allocation made when a dynamic buffer grows from empty.
const MIN_GROWTH_BYTES: usize = 16;

/// Whether a buffer's capacity is fixed or may grow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferMode {
    /// Capacity fixed at construction
    Static,
    /// Capacity doubles when a write needs more room
    #[default]
    Dynamic,
}

#[inline]
fn low_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

#[inline]
fn check_bit_count(bits: u32) -> Result<()> {
    if bits > 64 {
        return Err(ProtocolError::InvalidBitCount(bits));
    }
    Ok(())
}

#[inline]
pub(crate) fn bytes_for_bits(bits: usize) -> usize {
    bits.div_ceil(8)
}

/// Read `bits` bits MSB-first from `data` starting at bit `*pos`, never past `limit`.
///
/// Shared by [`BitBuffer`] and [`PacketReader`](crate::core::packet::PacketReader).
pub(crate) fn read_bits_at(data: &[u8], pos: &mut usize, limit: usize, bits: u32) -> Result<u64> {
    check_bit_count(bits)?;
    let available = limit.saturating_sub(*pos);
    if bits as usize > available {
        return Err(ProtocolError::BufferUnderrun {
            requested_bits: bits as usize,
            available_bits: available,
        });
    }

    let mut value = 0u64;
    let mut remaining = bits;
    while remaining > 0 {
        let byte = data[*pos / 8];
        let offset = (*pos % 8) as u32;
        let left_in_byte = 8 - offset;
        let take = left_in_byte.min(remaining);
        let chunk = (u64::from(byte) >> (left_in_byte - take)) & low_mask(take);
        value = (value << take) | chunk;
        *pos += take as usize;
        remaining -= take;
    }
    Ok(value)
}

/// Copy `out.len()` whole bytes starting at bit `*pos`.
pub(crate) fn read_raw_at(data: &[u8], pos: &mut usize, limit: usize, out: &mut [u8]) -> Result<()> {
    let needed = out.len() * 8;
    let available = limit.saturating_sub(*pos);
    if needed > available {
        return Err(ProtocolError::BufferUnderrun {
            requested_bits: needed,
            available_bits: available,
        });
    }

    if *pos % 8 == 0 {
        let start = *pos / 8;
        out.copy_from_slice(&data[start..start + out.len()]);
        *pos += needed;
    } else {
        for byte in out.iter_mut() {
            *byte = read_bits_at(data, pos, limit, 8)? as u8;
        }
    }
    Ok(())
}

/// Typed writers built on top of [`BitWrite::write_bits`]
pub trait BitWrite {
    /// Write the low `bits` bits of `value`, MSB first.
    fn write_bits(&mut self, value: u64, bits: u32) -> Result<()>;

    /// Check that `bits` more bits can be written without failing.
    ///
    /// Dynamic buffers grow here; static buffers report `CapacityExceeded`.
    fn reserve_bits(&mut self, bits: usize) -> Result<()>;

    /// Write whole bytes without a length prefix.
    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve_bits(bytes.len() * 8)?;
        for &byte in bytes {
            self.write_bits(u64::from(byte), 8)?;
        }
        Ok(())
    }

    fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_bits(u64::from(value), 1)
    }

    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_bits(u64::from(value), 8)
    }

    fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_bits(u64::from(value), 16)
    }

    fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_bits(u64::from(value), 32)
    }

    fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_bits(value, 64)
    }

    /// Write a signed value as a `bits`-wide two's-complement field.
    ///
    /// The value must fit in `bits` bits, otherwise `ValueTooLarge` is returned
    /// and nothing is written.
    fn write_int(&mut self, value: i64, bits: u32) -> Result<()> {
        if bits == 0 || bits > 64 {
            return Err(ProtocolError::InvalidBitCount(bits));
        }
        if bits < 64 {
            let min = -(1i64 << (bits - 1));
            let max = (1i64 << (bits - 1)) - 1;
            if value < min || value > max {
                return Err(ProtocolError::ValueTooLarge {
                    len: value.unsigned_abs() as usize,
                    max: max as usize,
                });
            }
        }
        self.write_bits(value as u64 & low_mask(bits), bits)
    }

    fn write_i8(&mut self, value: i8) -> Result<()> {
        self.write_bits(u64::from(value as u8), 8)
    }

    fn write_i16(&mut self, value: i16) -> Result<()> {
        self.write_bits(u64::from(value as u16), 16)
    }

    fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_bits(u64::from(value as u32), 32)
    }

    fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_bits(value as u64, 64)
    }

    fn write_f32(&mut self, value: f32) -> Result<()> {
        self.write_bits(u64::from(value.to_bits()), 32)
    }

    fn write_f64(&mut self, value: f64) -> Result<()> {
        self.write_bits(value.to_bits(), 64)
    }

    /// Write a 16-bit length followed by the bytes.
    ///
    /// Fails with `ValueTooLarge` above 65535 bytes; the field is written
    /// entirely or not at all.
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > MAX_PREFIXED_LEN {
            return Err(ProtocolError::ValueTooLarge {
                len: bytes.len(),
                max: MAX_PREFIXED_LEN,
            });
        }
        self.reserve_bits(16 + bytes.len() * 8)?;
        self.write_u16(bytes.len() as u16)?;
        self.write_raw(bytes)
    }

    /// Write a length-prefixed UTF-8 string.
    fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }
}

/// Typed readers built on top of [`BitRead::read_bits`]
pub trait BitRead {
    /// Read `bits` bits, MSB first.
    fn read_bits(&mut self, bits: u32) -> Result<u64>;

    /// Number of unread bits.
    fn remaining_bits(&self) -> usize;

    /// Fill `out` with whole bytes.
    fn read_raw_into(&mut self, out: &mut [u8]) -> Result<()> {
        let needed = out.len() * 8;
        if needed > self.remaining_bits() {
            return Err(ProtocolError::BufferUnderrun {
                requested_bits: needed,
                available_bits: self.remaining_bits(),
            });
        }
        for byte in out.iter_mut() {
            *byte = self.read_bits(8)? as u8;
        }
        Ok(())
    }

    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_bits(1)? == 1)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(self.read_bits(16)? as u16)
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(self.read_bits(32)? as u32)
    }

    fn read_u64(&mut self) -> Result<u64> {
        self.read_bits(64)
    }

    /// Read a `bits`-wide two's-complement field, sign-extending it.
    fn read_int(&mut self, bits: u32) -> Result<i64> {
        if bits == 0 || bits > 64 {
            return Err(ProtocolError::InvalidBitCount(bits));
        }
        let raw = self.read_bits(bits)?;
        let shift = 64 - bits;
        Ok(((raw << shift) as i64) >> shift)
    }

    fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_bits(8)? as u8 as i8)
    }

    fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_bits(16)? as u16 as i16)
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_bits(32)? as u32 as i32)
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_bits(64)? as i64)
    }

    fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_bits(32)? as u32))
    }

    fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_bits(64)?))
    }

    /// Read a 16-bit length followed by that many bytes.
    fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u16()? as usize;
        let mut out = vec![0u8; len];
        self.read_raw_into(&mut out)?;
        Ok(out)
    }

    /// Read a length-prefixed UTF-8 string.
    fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| ProtocolError::DeserializeError(e.to_string()))
    }
}

/// Bit-addressable buffer with independent read and write cursors
///
/// Invariant: `read_pos <= write_pos <= capacity() * 8`.
#[derive(Debug, Clone, Default)]
pub struct BitBuffer {
    data: Vec<u8>,
    write_pos: usize,
    read_pos: usize,
    mode: BufferMode,
}

impl BitBuffer {
    /// Empty dynamic buffer; allocates on first write.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer with `capacity` bytes of zeroed storage.
    pub fn with_capacity(capacity: usize, mode: BufferMode) -> Self {
        Self {
            data: vec![0u8; capacity],
            write_pos: 0,
            read_pos: 0,
            mode,
        }
    }

    /// Static buffer holding a copy of `bytes`, ready to be read.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            write_pos: bytes.len() * 8,
            read_pos: 0,
            mode: BufferMode::Static,
        }
    }

    /// Capacity in bytes
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    /// Switch between static and dynamic growth. Existing contents are kept.
    pub fn set_mode(&mut self, mode: BufferMode) {
        self.mode = mode;
    }

    /// Bits written so far
    #[inline]
    pub fn written_bits(&self) -> usize {
        self.write_pos
    }

    /// Bytes covered by the written bits, counting a trailing partial byte
    #[inline]
    pub fn written_bytes(&self) -> usize {
        bytes_for_bits(self.write_pos)
    }

    #[inline]
    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.write_pos == 0
    }

    /// Written bytes. Unused bits of the last byte are zero.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.written_bytes()]
    }

    /// Zero both cursors. Storage and mode are kept; calling twice is harmless.
    pub fn reset(&mut self) {
        self.write_pos = 0;
        self.read_pos = 0;
    }

    /// Reset and make sure at least `capacity` bytes are available.
    ///
    /// Storage above `capacity` is released.
    pub fn reset_to_capacity(&mut self, capacity: usize) {
        self.reset();
        self.data.truncate(capacity);
        self.data.shrink_to(capacity);
        self.data.resize(capacity, 0);
    }

    /// Pad the write cursor with zero bits up to the next byte boundary.
    pub fn align_write(&mut self) -> Result<()> {
        let pad = ((8 - self.write_pos % 8) % 8) as u32;
        self.write_bits(0, pad)
    }

    /// Skip the read cursor forward to the next byte boundary.
    pub fn align_read(&mut self) {
        let aligned = bytes_for_bits(self.read_pos) * 8;
        self.read_pos = aligned.min(self.write_pos);
    }

    fn grow_for(&mut self, needed_bits: usize) -> Result<()> {
        let capacity_bits = self.data.len() * 8;
        if needed_bits <= capacity_bits {
            return Ok(());
        }
        match self.mode {
            BufferMode::Static => Err(ProtocolError::CapacityExceeded {
                requested_bits: needed_bits,
                capacity_bits,
            }),
            BufferMode::Dynamic => {
                let new_len = (self.data.len() * 2)
                    .max(bytes_for_bits(needed_bits))
                    .max(MIN_GROWTH_BYTES);
                self.data.resize(new_len, 0);
                Ok(())
            }
        }
    }
}

impl BitWrite for BitBuffer {
    fn write_bits(&mut self, value: u64, bits: u32) -> Result<()> {
        check_bit_count(bits)?;
        if bits == 0 {
            return Ok(());
        }
        self.grow_for(self.write_pos + bits as usize)?;

        let mut remaining = bits;
        while remaining > 0 {
            let index = self.write_pos / 8;
            let offset = (self.write_pos % 8) as u32;
            let free = 8 - offset;
            let take = free.min(remaining);
            let chunk = ((value >> (remaining - take)) & low_mask(take)) as u8;
            let shifted = chunk << (free - take);
            // A fresh byte may hold stale data from before the last reset.
            if offset == 0 {
                self.data[index] = shifted;
            } else {
                self.data[index] |= shifted;
            }
            self.write_pos += take as usize;
            remaining -= take;
        }
        Ok(())
    }

    fn reserve_bits(&mut self, bits: usize) -> Result<()> {
        self.grow_for(self.write_pos + bits)
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve_bits(bytes.len() * 8)?;
        if self.write_pos % 8 == 0 {
            let start = self.write_pos / 8;
            self.data[start..start + bytes.len()].copy_from_slice(bytes);
            self.write_pos += bytes.len() * 8;
            return Ok(());
        }
        for &byte in bytes {
            self.write_bits(u64::from(byte), 8)?;
        }
        Ok(())
    }
}

impl BitRead for BitBuffer {
    fn read_bits(&mut self, bits: u32) -> Result<u64> {
        read_bits_at(&self.data, &mut self.read_pos, self.write_pos, bits)
    }

    fn remaining_bits(&self) -> usize {
        self.write_pos - self.read_pos
    }

    fn read_raw_into(&mut self, out: &mut [u8]) -> Result<()> {
        read_raw_at(&self.data, &mut self.read_pos, self.write_pos, out)
    }
}

impl Recycle for BitBuffer {
    fn recycle(&mut self) {
        self.reset();
        self.mode = BufferMode::Dynamic;
    }

    fn is_reusable(&self) -> bool {
        self.capacity() <= MAX_RETAINED_CAPACITY
    }
}
