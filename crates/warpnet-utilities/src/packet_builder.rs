//! Fixed-capacity binary writer for building raw payloads.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use warpnet_core::{
    constants::DEFAULT_PACKET_CAPACITY,
    error::{ErrorKind, Result},
};

/// Byte order used by the numeric writers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Endianness {
    /// Least significant byte first.
    #[default]
    Little,
    /// Most significant byte first.
    Big,
}

/// Offset-tracked writer over a fixed-capacity buffer.
///
/// Every write advances the cursor by the encoded width of the value and
/// returns the builder, so fields chain with `?`. Numeric writers take an
/// [`Endianness`] or `None` for little-endian:
///
/// ```
/// use warpnet_utilities::{Endianness, PacketBuilder};
///
/// # fn main() -> warpnet_core::error::Result<()> {
/// let mut builder = PacketBuilder::new(16);
/// builder.write_u8(1)?.write_u16(0x0203, Endianness::Big)?.write_u16(0x0405, None)?.write_str("hi")?;
/// assert_eq!(builder.packet_data(), &[1, 2, 3, 5, 4, b'h', b'i']);
/// # Ok(())
/// # }
/// ```
///
/// Writes that do not fit fail with [`ErrorKind::BufferOverflow`] and leave
/// the buffer and cursor untouched. The buffer never grows.
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    buffer: Box<[u8]>,
    offset: usize,
}

impl Default for PacketBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PACKET_CAPACITY)
    }
}

impl PacketBuilder {
    /// Creates a builder with `capacity` bytes of room.
    pub fn new(capacity: usize) -> Self {
        Self { buffer: vec![0; capacity].into_boxed_slice(), offset: 0 }
    }

    /// Writes an unsigned 8-bit integer.
    pub fn write_u8(&mut self, value: u8) -> Result<&mut Self> {
        self.reserve(1)?[0] = value;
        Ok(self)
    }

    /// Writes an unsigned 16-bit integer.
    pub fn write_u16(
        &mut self,
        value: u16,
        endianness: impl Into<Option<Endianness>>,
    ) -> Result<&mut Self> {
        let slot = self.reserve(2)?;
        match endianness.into().unwrap_or_default() {
            Endianness::Little => LittleEndian::write_u16(slot, value),
            Endianness::Big => BigEndian::write_u16(slot, value),
        }
        Ok(self)
    }

    /// Writes an unsigned 32-bit integer.
    pub fn write_u32(
        &mut self,
        value: u32,
        endianness: impl Into<Option<Endianness>>,
    ) -> Result<&mut Self> {
        let slot = self.reserve(4)?;
        match endianness.into().unwrap_or_default() {
            Endianness::Little => LittleEndian::write_u32(slot, value),
            Endianness::Big => BigEndian::write_u32(slot, value),
        }
        Ok(self)
    }

    /// Writes a 32-bit float.
    pub fn write_f32(
        &mut self,
        value: f32,
        endianness: impl Into<Option<Endianness>>,
    ) -> Result<&mut Self> {
        let slot = self.reserve(4)?;
        match endianness.into().unwrap_or_default() {
            Endianness::Little => LittleEndian::write_f32(slot, value),
            Endianness::Big => BigEndian::write_f32(slot, value),
        }
        Ok(self)
    }

    /// Writes a 64-bit float.
    pub fn write_f64(
        &mut self,
        value: f64,
        endianness: impl Into<Option<Endianness>>,
    ) -> Result<&mut Self> {
        let slot = self.reserve(8)?;
        match endianness.into().unwrap_or_default() {
            Endianness::Little => LittleEndian::write_f64(slot, value),
            Endianness::Big => BigEndian::write_f64(slot, value),
        }
        Ok(self)
    }

    /// Writes the UTF-8 bytes of `value`, without a length prefix or terminator.
    pub fn write_str(&mut self, value: &str) -> Result<&mut Self> {
        self.write_bytes(value.as_bytes())
    }

    /// Writes `value` in the named text encoding. Only `utf8`/`utf-8` is supported.
    pub fn write_string(&mut self, value: &str, encoding: &str) -> Result<&mut Self> {
        if !is_utf8_label(encoding) {
            return Err(ErrorKind::UnsupportedEncoding(encoding.to_string()));
        }
        self.write_str(value)
    }

    /// Writes `bytes` verbatim.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self> {
        self.reserve(bytes.len())?.copy_from_slice(bytes);
        Ok(self)
    }

    /// Bytes written so far.
    pub fn packet_data(&self) -> &[u8] {
        &self.buffer[..self.offset]
    }

    /// Rewinds the cursor to zero, keeping the allocation.
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    /// Current cursor offset in bytes.
    pub fn size(&self) -> usize {
        self.offset
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes left before the buffer is full.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.offset
    }

    fn reserve(&mut self, width: usize) -> Result<&mut [u8]> {
        if width > self.remaining() {
            return Err(ErrorKind::BufferOverflow { requested: width, remaining: self.remaining() });
        }
        let start = self.offset;
        self.offset += width;
        Ok(&mut self.buffer[start..start + width])
    }
}

fn is_utf8_label(encoding: &str) -> bool {
    encoding.eq_ignore_ascii_case("utf8") || encoding.eq_ignore_ascii_case("utf-8")
}
