//! Packet buffer implementation
//!
//! Provides a fixed-capacity byte buffer with protocol-specific read/write operations:
//! - Standard integer widths (byte, short, int, long)
//! - Byte orders (big, little, and the two middle-endian int orders)
//! - Value transforms on the least significant byte (A, C, S)
//! - Bit access mode (MSB first, crossing byte boundaries)
//! - Variable-length frame headers patched once the payload is known
//!
//! Every cursor movement is bounds-checked. Running past the capacity is a
//! framing error and is returned rather than silently truncated.

use bytes::{BufMut, BytesMut};

use crate::crypto::isaac::Isaac;
use crate::error::{ProtocolError, Result};

/// Maximum payload of a variable-short frame
pub const MAX_PACKET_SIZE: usize = 65535;

/// Byte that terminates strings on the wire
pub const STRING_TERMINATOR: u8 = 10;

/// Transform applied to the least significant byte of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Written as-is
    Normal,
    /// value + 128
    A,
    /// Negated
    C,
    /// 128 - value
    S,
}

impl ValueType {
    #[inline]
    fn encode(self, value: u8) -> u8 {
        match self {
            ValueType::Normal => value,
            ValueType::A => value.wrapping_add(128),
            ValueType::C => 0u8.wrapping_sub(value),
            ValueType::S => 128u8.wrapping_sub(value),
        }
    }

    #[inline]
    fn decode(self, value: u8) -> u8 {
        match self {
            ValueType::Normal => value,
            ValueType::A => value.wrapping_sub(128),
            ValueType::C => 0u8.wrapping_sub(value),
            ValueType::S => 128u8.wrapping_sub(value),
        }
    }
}

/// Order in which the bytes of a multi-byte field hit the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
    /// Ints only: bytes 2, 1, 4, 3 (1 = most significant)
    Middle,
    /// Ints only: bytes 3, 4, 1, 2
    InverseMiddle,
}

/// Access granularity of the write/read cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Byte,
    Bit,
}

/// How a frame declares its length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Length is implied by the opcode
    Fixed,
    /// One length byte follows the opcode
    VariableByte,
    /// Two length bytes follow the opcode
    VariableShort,
}

impl FrameKind {
    /// Size of the length prefix
    pub fn header_size(self) -> usize {
        match self {
            FrameKind::Fixed => 0,
            FrameKind::VariableByte => 1,
            FrameKind::VariableShort => 2,
        }
    }

    /// Largest payload the length prefix can describe
    pub fn max_payload(self) -> usize {
        match self {
            FrameKind::Fixed => MAX_PACKET_SIZE,
            FrameKind::VariableByte => 255,
            FrameKind::VariableShort => MAX_PACKET_SIZE,
        }
    }
}

/// Shift amounts, in wire order, for a field of `width` bytes
fn shifts(width: usize, order: ByteOrder) -> std::result::Result<Vec<u32>, ProtocolError> {
    let big: Vec<u32> = (0..width as u32).rev().map(|i| i * 8).collect();
    match order {
        ByteOrder::Big => Ok(big),
        ByteOrder::Little => Ok(big.into_iter().rev().collect()),
        ByteOrder::Middle if width == 4 => Ok(vec![8, 0, 24, 16]),
        ByteOrder::InverseMiddle if width == 4 => Ok(vec![16, 24, 0, 8]),
        _ => Err(ProtocolError::MalformedPacket(format!(
            "byte order {:?} is not defined for {}-byte fields",
            order, width
        ))),
    }
}

#[inline]
fn bit_mask(bits: u32) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

/// Packet buffer for reading and writing game protocol data
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    /// Internal byte buffer
    data: BytesMut,
    /// Hard upper bound on `data.len()`
    capacity: usize,
    /// Current read position
    read_pos: usize,
    /// Bit cursor (in bits) while in bit mode
    bit_pos: usize,
    /// Current access mode
    mode: AccessMode,
    /// Position and kind of the length placeholder awaiting a patch
    pending_header: Option<(usize, FrameKind)>,
}

impl PacketBuffer {
    /// Create an empty buffer that may grow to `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
            read_pos: 0,
            bit_pos: 0,
            mode: AccessMode::Byte,
            pending_header: None,
        }
    }

    /// Create a read buffer over a copy of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::wrap(BytesMut::from(bytes))
    }

    /// Create a read buffer by wrapping a BytesMut
    pub fn wrap(data: BytesMut) -> Self {
        let capacity = data.len();
        Self {
            data,
            capacity,
            read_pos: 0,
            bit_pos: 0,
            mode: AccessMode::Byte,
            pending_header: None,
        }
    }

    // ============ Properties ============

    #[inline]
    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of bytes remaining to read
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.read_pos)
    }

    #[inline]
    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    #[inline]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn into_inner(self) -> BytesMut {
        self.data
    }

    /// Clear the buffer and reset every cursor
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
        self.bit_pos = 0;
        self.mode = AccessMode::Byte;
        self.pending_header = None;
    }

    /// Skip a number of bytes when reading
    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.check_read(count)?;
        self.read_pos += count;
        Ok(())
    }

    // ============ Bounds ============

    fn require_mode(&self, mode: AccessMode) -> Result<()> {
        if self.mode != mode {
            let name = match mode {
                AccessMode::Byte => "byte",
                AccessMode::Bit => "bit",
            };
            return Err(ProtocolError::WrongAccessMode(name).into());
        }
        Ok(())
    }

    fn check_write(&self, count: usize) -> Result<()> {
        self.require_mode(AccessMode::Byte)?;
        if self.data.len() + count > self.capacity {
            return Err(ProtocolError::BufferOverrun {
                needed: count,
                position: self.data.len(),
                capacity: self.capacity,
            }
            .into());
        }
        Ok(())
    }

    fn check_read(&self, count: usize) -> Result<()> {
        self.require_mode(AccessMode::Byte)?;
        if self.read_pos + count > self.data.len() {
            return Err(ProtocolError::BufferOverrun {
                needed: count,
                position: self.read_pos,
                capacity: self.data.len(),
            }
            .into());
        }
        Ok(())
    }

    // ============ Generic Field Access ============

    /// Write the low `width` bytes of `value`
    pub fn write_value(
        &mut self,
        width: usize,
        value: u64,
        value_type: ValueType,
        order: ByteOrder,
    ) -> Result<()> {
        let shifts = shifts(width, order)?;
        self.check_write(width)?;
        for shift in shifts {
            let byte = (value >> shift) as u8;
            if shift == 0 {
                self.data.put_u8(value_type.encode(byte));
            } else {
                self.data.put_u8(byte);
            }
        }
        Ok(())
    }

    /// Read a `width`-byte unsigned value
    pub fn read_value(
        &mut self,
        width: usize,
        value_type: ValueType,
        order: ByteOrder,
    ) -> Result<u64> {
        let shifts = shifts(width, order)?;
        self.check_read(width)?;
        let mut value = 0u64;
        for shift in shifts {
            let mut byte = self.data[self.read_pos];
            self.read_pos += 1;
            if shift == 0 {
                byte = value_type.decode(byte);
            }
            value |= (byte as u64) << shift;
        }
        Ok(value)
    }

    // ============ Writing Methods ============

    pub fn write_byte(&mut self, value: u8) -> Result<()> {
        self.write_byte_as(value, ValueType::Normal)
    }

    pub fn write_byte_as(&mut self, value: u8, value_type: ValueType) -> Result<()> {
        self.write_value(1, value as u64, value_type, ByteOrder::Big)
    }

    /// Write byte A (value + 128)
    pub fn write_byte_a(&mut self, value: u8) -> Result<()> {
        self.write_byte_as(value, ValueType::A)
    }

    /// Write byte C (negated)
    pub fn write_byte_c(&mut self, value: u8) -> Result<()> {
        self.write_byte_as(value, ValueType::C)
    }

    /// Write byte S (128 - value)
    pub fn write_byte_s(&mut self, value: u8) -> Result<()> {
        self.write_byte_as(value, ValueType::S)
    }

    pub fn write_short(&mut self, value: u16) -> Result<()> {
        self.write_value(2, value as u64, ValueType::Normal, ByteOrder::Big)
    }

    pub fn write_short_le(&mut self, value: u16) -> Result<()> {
        self.write_value(2, value as u64, ValueType::Normal, ByteOrder::Little)
    }

    pub fn write_short_as(&mut self, value: u16, value_type: ValueType, order: ByteOrder) -> Result<()> {
        self.write_value(2, value as u64, value_type, order)
    }

    pub fn write_int(&mut self, value: u32) -> Result<()> {
        self.write_value(4, value as u64, ValueType::Normal, ByteOrder::Big)
    }

    pub fn write_int_as(&mut self, value: u32, value_type: ValueType, order: ByteOrder) -> Result<()> {
        self.write_value(4, value as u64, value_type, order)
    }

    pub fn write_long(&mut self, value: u64) -> Result<()> {
        self.write_value(8, value, ValueType::Normal, ByteOrder::Big)
    }

    /// Write raw bytes
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_write(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Write a terminated string
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.check_write(value.len() + 1)?;
        self.data.extend_from_slice(value.as_bytes());
        self.data.put_u8(STRING_TERMINATOR);
        Ok(())
    }

    // ============ Reading Methods ============

    pub fn read_ubyte(&mut self) -> Result<u8> {
        self.read_byte_as(ValueType::Normal)
    }

    pub fn read_byte_as(&mut self, value_type: ValueType) -> Result<u8> {
        Ok(self.read_value(1, value_type, ByteOrder::Big)? as u8)
    }

    /// Read a signed byte
    pub fn read_byte(&mut self) -> Result<i8> {
        Ok(self.read_ubyte()? as i8)
    }

    pub fn read_ushort(&mut self) -> Result<u16> {
        Ok(self.read_value(2, ValueType::Normal, ByteOrder::Big)? as u16)
    }

    pub fn read_ushort_le(&mut self) -> Result<u16> {
        Ok(self.read_value(2, ValueType::Normal, ByteOrder::Little)? as u16)
    }

    pub fn read_short_as(&mut self, value_type: ValueType, order: ByteOrder) -> Result<u16> {
        Ok(self.read_value(2, value_type, order)? as u16)
    }

    pub fn read_int(&mut self) -> Result<u32> {
        Ok(self.read_value(4, ValueType::Normal, ByteOrder::Big)? as u32)
    }

    pub fn read_int_as(&mut self, value_type: ValueType, order: ByteOrder) -> Result<u32> {
        Ok(self.read_value(4, value_type, order)? as u32)
    }

    pub fn read_long(&mut self) -> Result<u64> {
        self.read_value(8, ValueType::Normal, ByteOrder::Big)
    }

    /// Read a string ended by a nul or newline terminator
    pub fn read_string(&mut self) -> Result<String> {
        let start = self.read_pos;
        loop {
            let b = self.read_ubyte()?;
            if b == 0 || b == STRING_TERMINATOR {
                break;
            }
        }
        let bytes = &self.data[start..self.read_pos - 1];
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read a specific number of bytes
    pub fn read_bytes(&mut self, length: usize) -> Result<Vec<u8>> {
        self.check_read(length)?;
        let bytes = self.data[self.read_pos..self.read_pos + length].to_vec();
        self.read_pos += length;
        Ok(bytes)
    }

    // ============ Frame Headers ============

    /// Write a fixed-size frame opcode, obfuscated by `cipher` when present
    pub fn write_header(&mut self, opcode: u8, cipher: Option<&mut Isaac>) -> Result<()> {
        let opcode = match cipher {
            Some(isaac) => opcode.wrapping_add(isaac.next_byte()),
            None => opcode,
        };
        self.write_byte(opcode)
    }

    /// Write an opcode followed by a length placeholder patched by
    /// [`finish_var_header`](Self::finish_var_header)
    pub fn write_var_header(
        &mut self,
        opcode: u8,
        kind: FrameKind,
        cipher: Option<&mut Isaac>,
    ) -> Result<()> {
        if kind == FrameKind::Fixed || self.pending_header.is_some() {
            return Err(ProtocolError::MalformedPacket(
                "variable header requires a variable frame kind and no open header".to_string(),
            )
            .into());
        }
        self.write_header(opcode, cipher)?;
        let position = self.data.len();
        self.write_value(kind.header_size(), 0, ValueType::Normal, ByteOrder::Big)?;
        self.pending_header = Some((position, kind));
        Ok(())
    }

    /// Patch the open length placeholder with the payload size written since
    /// it was reserved. Returns the payload size.
    pub fn finish_var_header(&mut self) -> Result<usize> {
        self.require_mode(AccessMode::Byte)?;
        let (position, kind) = self
            .pending_header
            .take()
            .ok_or(ProtocolError::NoPendingHeader)?;
        let header_size = kind.header_size();
        let payload = self.data.len() - position - header_size;
        if payload > kind.max_payload() {
            return Err(ProtocolError::FrameLengthMismatch {
                declared: kind.max_payload(),
                actual: payload,
            }
            .into());
        }
        match kind {
            FrameKind::VariableByte => self.data[position] = payload as u8,
            FrameKind::VariableShort => {
                self.data[position] = (payload >> 8) as u8;
                self.data[position + 1] = payload as u8;
            }
            FrameKind::Fixed => {}
        }
        Ok(payload)
    }

    // ============ Bit Access ============

    /// Enter bit access mode, appending bits after the last written byte
    pub fn start_bit_access(&mut self) -> Result<()> {
        self.require_mode(AccessMode::Byte)?;
        self.bit_pos = self.data.len() * 8;
        self.mode = AccessMode::Bit;
        Ok(())
    }

    /// Leave bit access mode; the partial trailing byte is kept zero-padded
    pub fn finish_bit_access(&mut self) -> Result<()> {
        self.require_mode(AccessMode::Bit)?;
        self.mode = AccessMode::Byte;
        Ok(())
    }

    /// Enter bit access mode for reading at the current read position
    pub fn start_bit_read(&mut self) -> Result<()> {
        self.require_mode(AccessMode::Byte)?;
        self.bit_pos = self.read_pos * 8;
        self.mode = AccessMode::Bit;
        Ok(())
    }

    /// Leave bit read mode, moving the read cursor to the next whole byte
    pub fn finish_bit_read(&mut self) -> Result<()> {
        self.require_mode(AccessMode::Bit)?;
        self.read_pos = (self.bit_pos + 7) / 8;
        self.mode = AccessMode::Byte;
        Ok(())
    }

    /// Write a single flag bit
    pub fn write_bit(&mut self, flag: bool) -> Result<()> {
        self.write_bits(1, flag as u32)
    }

    /// Write the low `count` bits of `value`, most significant first
    pub fn write_bits(&mut self, count: u32, value: u32) -> Result<()> {
        self.require_mode(AccessMode::Bit)?;
        if count == 0 || count > 32 {
            return Err(ProtocolError::MalformedPacket(format!("bit count {}", count)).into());
        }

        let end_byte = (self.bit_pos + count as usize + 7) / 8;
        if end_byte > self.capacity {
            return Err(ProtocolError::BufferOverrun {
                needed: end_byte - self.data.len().min(end_byte),
                position: self.data.len(),
                capacity: self.capacity,
            }
            .into());
        }
        while self.data.len() < end_byte {
            self.data.put_u8(0);
        }

        let mut byte_pos = self.bit_pos / 8;
        let mut bit_offset = 8 - (self.bit_pos % 8) as u32;
        let mut remaining = count;
        self.bit_pos += count as usize;

        while remaining > bit_offset {
            let mask = bit_mask(bit_offset);
            self.data[byte_pos] &= !(mask as u8);
            self.data[byte_pos] |= ((value >> (remaining - bit_offset)) & mask) as u8;
            remaining -= bit_offset;
            byte_pos += 1;
            bit_offset = 8;
        }

        if remaining == bit_offset {
            let mask = bit_mask(bit_offset);
            self.data[byte_pos] &= !(mask as u8);
            self.data[byte_pos] |= (value & mask) as u8;
        } else {
            let shift = bit_offset - remaining;
            let mask = bit_mask(remaining) << shift;
            self.data[byte_pos] &= !(mask as u8);
            self.data[byte_pos] |= ((value & bit_mask(remaining)) << shift) as u8;
        }
        Ok(())
    }

    /// Read `count` bits, most significant first
    pub fn read_bits(&mut self, count: u32) -> Result<u32> {
        self.require_mode(AccessMode::Bit)?;
        if count == 0 || count > 32 {
            return Err(ProtocolError::MalformedPacket(format!("bit count {}", count)).into());
        }
        if self.bit_pos + count as usize > self.data.len() * 8 {
            return Err(ProtocolError::BufferOverrun {
                needed: count as usize,
                position: self.bit_pos / 8,
                capacity: self.data.len(),
            }
            .into());
        }

        let mut byte_pos = self.bit_pos / 8;
        let mut bit_offset = 8 - (self.bit_pos % 8) as u32;
        let mut remaining = count;
        let mut value = 0u32;
        self.bit_pos += count as usize;

        while remaining > bit_offset {
            value |= (self.data[byte_pos] as u32 & bit_mask(bit_offset)) << (remaining - bit_offset);
            remaining -= bit_offset;
            byte_pos += 1;
            bit_offset = 8;
        }

        if remaining == bit_offset {
            value |= self.data[byte_pos] as u32 & bit_mask(bit_offset);
        } else {
            value |= (self.data[byte_pos] as u32 >> (bit_offset - remaining)) & bit_mask(remaining);
        }
        Ok(value)
    }
}

impl AsRef<[u8]> for PacketBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FerroscapeError;

    const TRANSFORMS: [ValueType; 4] = [ValueType::Normal, ValueType::A, ValueType::C, ValueType::S];

    fn reader(buf: &PacketBuffer) -> PacketBuffer {
        PacketBuffer::from_bytes(buf.as_bytes())
    }

    #[test]
    fn test_basic_read_write() {
        let mut buf = PacketBuffer::with_capacity(64);

        buf.write_byte(42).unwrap();
        buf.write_short(1234).unwrap();
        buf.write_int(987654).unwrap();
        buf.write_long(123456789012345).unwrap();

        let mut r = reader(&buf);
        assert_eq!(r.read_ubyte().unwrap(), 42);
        assert_eq!(r.read_ushort().unwrap(), 1234);
        assert_eq!(r.read_int().unwrap(), 987654);
        assert_eq!(r.read_long().unwrap(), 123456789012345);
        assert!(!r.has_remaining());
    }

    #[test]
    fn test_byte_transforms_round_trip_every_value() {
        for value_type in TRANSFORMS {
            let mut buf = PacketBuffer::with_capacity(256);
            for v in 0..=255u8 {
                buf.write_byte_as(v, value_type).unwrap();
            }
            let mut r = reader(&buf);
            for v in 0..=255u8 {
                assert_eq!(r.read_byte_as(value_type).unwrap(), v, "{:?}", value_type);
            }
        }
    }

    #[test]
    fn test_wide_fields_round_trip_in_every_order() {
        let orders = [
            ByteOrder::Big,
            ByteOrder::Little,
            ByteOrder::Middle,
            ByteOrder::InverseMiddle,
        ];
        for value_type in TRANSFORMS {
            for order in orders {
                let mut buf = PacketBuffer::with_capacity(8);
                buf.write_int_as(0xA1B2_C3D4, value_type, order).unwrap();
                assert_eq!(reader(&buf).read_int_as(value_type, order).unwrap(), 0xA1B2_C3D4);
            }
            for order in [ByteOrder::Big, ByteOrder::Little] {
                let mut buf = PacketBuffer::with_capacity(2);
                buf.write_short_as(0xFE01, value_type, order).unwrap();
                assert_eq!(reader(&buf).read_short_as(value_type, order).unwrap(), 0xFE01);
            }
        }
    }

    #[test]
    fn test_known_encodings() {
        let mut buf = PacketBuffer::with_capacity(16);
        buf.write_byte_a(100).unwrap();
        buf.write_byte_c(5).unwrap();
        buf.write_byte_s(50).unwrap();
        buf.write_short_le(0x1234).unwrap();
        buf.write_int_as(0x11223344, ValueType::Normal, ByteOrder::Middle).unwrap();
        assert_eq!(
            buf.as_bytes(),
            &[228, 251, 78, 0x34, 0x12, 0x33, 0x44, 0x11, 0x22]
        );
    }

    #[test]
    fn test_middle_order_rejected_for_short() {
        let mut buf = PacketBuffer::with_capacity(4);
        assert!(buf
            .write_short_as(1, ValueType::Normal, ByteOrder::Middle)
            .is_err());
    }

    #[test]
    fn test_write_overrun_is_an_error() {
        let mut buf = PacketBuffer::with_capacity(3);
        buf.write_short(7).unwrap();
        let err = buf.write_short(8).unwrap_err();
        assert!(matches!(
            err,
            FerroscapeError::Protocol(ProtocolError::BufferOverrun { capacity: 3, .. })
        ));
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_read_overrun_is_an_error() {
        let mut buf = PacketBuffer::from_bytes(&[1, 2, 3]);
        assert!(buf.read_int().is_err());
        // A failed read does not move the cursor
        assert_eq!(buf.read_position(), 0);
        assert_eq!(buf.read_ushort().unwrap(), 0x0102);
    }

    #[test]
    fn test_string_terminators() {
        let mut buf = PacketBuffer::with_capacity(32);
        buf.write_string("hello").unwrap();
        buf.write_bytes(b"nul\0").unwrap();

        let mut r = reader(&buf);
        assert_eq!(r.read_string().unwrap(), "hello");
        assert_eq!(r.read_string().unwrap(), "nul");

        let mut unterminated = PacketBuffer::from_bytes(b"abc");
        assert!(unterminated.read_string().is_err());
    }

    #[test]
    fn test_bit_access() {
        let mut buf = PacketBuffer::with_capacity(8);
        buf.start_bit_access().unwrap();
        buf.write_bits(1, 1).unwrap();
        buf.write_bits(5, 15).unwrap();
        buf.write_bits(11, 1234).unwrap();
        buf.finish_bit_access().unwrap();
        assert_eq!(buf.len(), 3);

        let mut r = reader(&buf);
        r.start_bit_read().unwrap();
        assert_eq!(r.read_bits(1).unwrap(), 1);
        assert_eq!(r.read_bits(5).unwrap(), 15);
        assert_eq!(r.read_bits(11).unwrap(), 1234);
        r.finish_bit_read().unwrap();
        assert_eq!(r.read_position(), 3);
    }

    #[test]
    fn test_bits_are_msb_first() {
        let mut buf = PacketBuffer::with_capacity(2);
        buf.start_bit_access().unwrap();
        buf.write_bit(true).unwrap();
        buf.write_bits(2, 3).unwrap();
        buf.write_bits(8, 0xFF).unwrap();
        buf.finish_bit_access().unwrap();
        assert_eq!(buf.as_bytes(), &[0xFF, 0xE0]);
    }

    #[test]
    fn test_byte_write_in_bit_mode_fails() {
        let mut buf = PacketBuffer::with_capacity(4);
        buf.start_bit_access().unwrap();
        assert!(buf.write_byte(1).is_err());
    }

    #[test]
    fn test_bit_write_overrun() {
        let mut buf = PacketBuffer::with_capacity(1);
        buf.start_bit_access().unwrap();
        buf.write_bits(8, 0xAB).unwrap();
        assert!(buf.write_bit(true).is_err());
    }

    #[test]
    fn test_var_short_header_backpatch_for_every_length() {
        let capacity = 600;
        for n in 0..=(capacity - 3) {
            let mut buf = PacketBuffer::with_capacity(capacity);
            buf.write_var_header(65, FrameKind::VariableShort, None).unwrap();
            for i in 0..n {
                buf.write_byte(i as u8).unwrap();
            }
            assert_eq!(buf.finish_var_header().unwrap(), n);

            let bytes = buf.as_bytes();
            let declared = ((bytes[1] as usize) << 8) | bytes[2] as usize;
            assert_eq!(declared, n);
            assert_eq!(bytes.len() - 3, declared);
        }
    }

    #[test]
    fn test_var_byte_header_backpatch() {
        let mut buf = PacketBuffer::with_capacity(300);
        buf.write_var_header(253, FrameKind::VariableByte, None).unwrap();
        buf.write_string("welcome").unwrap();
        assert_eq!(buf.finish_var_header().unwrap(), 8);
        assert_eq!(buf.as_bytes()[1], 8);

        let mut buf = PacketBuffer::with_capacity(300);
        buf.write_var_header(253, FrameKind::VariableByte, None).unwrap();
        buf.write_bytes(&[0u8; 256]).unwrap();
        assert!(buf.finish_var_header().is_err());
    }

    #[test]
    fn test_finish_without_header_fails() {
        let mut buf = PacketBuffer::with_capacity(4);
        assert!(buf.finish_var_header().is_err());
    }

    #[test]
    fn test_header_opcode_obfuscation() {
        let seeds: [u32; 4] = [1, 2, 3, 4];
        let mut cipher = Isaac::new(&seeds);
        let mut buf = PacketBuffer::with_capacity(4);
        buf.write_header(81, Some(&mut cipher)).unwrap();

        let mut check = Isaac::new(&seeds);
        assert_eq!(buf.as_bytes()[0].wrapping_sub(check.next_byte()), 81);
    }
}
