//! Protocol-buffer wire primitives.
//!
//! Only the subset the sync envelope needs: varint, fixed64 and
//! length-delimited fields. Scalars holding their default value are not
//! written (proto3 rules); nested messages are always written so that an
//! empty oneof member is still visible to the decoder.
//!
//! ```text
//! key     = varint(field_number << 3 | wire_type)
//! varint  = 7 bits per byte, MSB = continuation, little-endian groups
//! fixed64 = 8 bytes little-endian
//! len     = varint(length) ++ bytes
//! ```

use bytes::{BufMut, BytesMut};

use super::ProtocolError;

/// Largest length-delimited field accepted by the decoder (64 MiB).
pub const MAX_FIELD_LEN: usize = 64 * 1024 * 1024;

/// Largest valid protobuf field number.
const MAX_FIELD_NUMBER: u64 = (1 << 29) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint,
    Fixed64,
    Len,
    Fixed32,
}

impl WireType {
    fn code(self) -> u64 {
        match self {
            WireType::Varint => 0,
            WireType::Fixed64 => 1,
            WireType::Len => 2,
            WireType::Fixed32 => 5,
        }
    }

    fn from_code(code: u8) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::Len),
            5 => Ok(WireType::Fixed32),
            // 3/4 are the deprecated group markers; 6/7 are unassigned.
            other => Err(ProtocolError::InvalidWireType(other)),
        }
    }
}

/// A type with a fixed protobuf field layout.
pub trait WireMessage: Sized {
    fn encode_fields(&self, w: &mut WireWriter);
    fn decode_fields(r: &mut WireReader<'_>) -> Result<Self, ProtocolError>;

    fn to_wire(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        self.encode_fields(&mut w);
        w.into_vec()
    }

    fn from_wire(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::decode_fields(&mut WireReader::new(bytes))
    }
}

// ───────────────────────────────────────────────────────────────────
// Writer
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    fn varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.put_u8((value as u8) | 0x80);
            value >>= 7;
        }
        self.buf.put_u8(value as u8);
    }

    fn key(&mut self, field: u32, wire_type: WireType) {
        self.varint(((field as u64) << 3) | wire_type.code());
    }

    pub fn uint64(&mut self, field: u32, value: u64) {
        if value != 0 {
            self.key(field, WireType::Varint);
            self.varint(value);
        }
    }

    pub fn uint32(&mut self, field: u32, value: u32) {
        self.uint64(field, value as u64);
    }

    /// Negative values are sign-extended to ten bytes, as protobuf does.
    pub fn int32(&mut self, field: u32, value: i32) {
        self.uint64(field, value as i64 as u64);
    }

    pub fn int64(&mut self, field: u32, value: i64) {
        self.uint64(field, value as u64);
    }

    pub fn bool(&mut self, field: u32, value: bool) {
        self.uint64(field, value as u64);
    }

    pub fn fixed64(&mut self, field: u32, value: u64) {
        if value != 0 {
            self.key(field, WireType::Fixed64);
            self.buf.put_u64_le(value);
        }
    }

    pub fn bytes(&mut self, field: u32, value: &[u8]) {
        if !value.is_empty() {
            self.len_prefixed(field, value);
        }
    }

    pub fn string(&mut self, field: u32, value: &str) {
        self.bytes(field, value.as_bytes());
    }

    pub fn message<M: WireMessage>(&mut self, field: u32, value: &M) {
        let nested = value.to_wire();
        self.len_prefixed(field, &nested);
    }

    fn len_prefixed(&mut self, field: u32, value: &[u8]) {
        self.key(field, WireType::Len);
        self.varint(value.len() as u64);
        self.buf.put_slice(value);
    }
}

// ───────────────────────────────────────────────────────────────────
// Reader
// ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Next field key, or `None` at the end of the buffer.
    pub fn next_field(&mut self) -> Result<Option<(u32, WireType)>, ProtocolError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let key = self.varint()?;
        let field = key >> 3;
        if field == 0 || field > MAX_FIELD_NUMBER {
            return Err(ProtocolError::InvalidFieldNumber(field));
        }
        let wire_type = WireType::from_code((key & 0x7) as u8)?;
        Ok(Some((field as u32, wire_type)))
    }

    fn varint(&mut self) -> Result<u64, ProtocolError> {
        let mut value = 0u64;
        for shift in (0..70).step_by(7) {
            let byte = *self.buf.get(self.pos).ok_or(ProtocolError::UnexpectedEof)?;
            self.pos += 1;
            if shift == 63 && byte > 1 {
                return Err(ProtocolError::VarintOverflow);
            }
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtocolError::VarintOverflow)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(len).ok_or(ProtocolError::UnexpectedEof)?;
        let slice = self.buf.get(self.pos..end).ok_or(ProtocolError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    pub fn read_uint64(&mut self) -> Result<u64, ProtocolError> {
        self.varint()
    }

    /// Truncates to 32 bits like other protobuf runtimes.
    pub fn read_uint32(&mut self) -> Result<u32, ProtocolError> {
        Ok(self.varint()? as u32)
    }

    pub fn read_int32(&mut self) -> Result<i32, ProtocolError> {
        Ok(self.varint()? as i32)
    }

    pub fn read_int64(&mut self) -> Result<i64, ProtocolError> {
        Ok(self.varint()? as i64)
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.varint()? != 0)
    }

    pub fn read_fixed64(&mut self) -> Result<u64, ProtocolError> {
        let raw = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.varint()?;
        if len > MAX_FIELD_LEN as u64 {
            return Err(ProtocolError::LengthTooLarge {
                len,
                max: MAX_FIELD_LEN,
            });
        }
        self.take(len as usize)
    }

    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let raw = self.read_bytes()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub fn read_message<M: WireMessage>(&mut self) -> Result<M, ProtocolError> {
        let raw = self.read_bytes()?;
        M::from_wire(raw)
    }

    /// Skip a field this decoder does not know, or whose wire type does
    /// not match the expected layout.
    pub fn skip(&mut self, wire_type: WireType) -> Result<(), ProtocolError> {
        match wire_type {
            WireType::Varint => self.varint().map(drop),
            WireType::Fixed64 => self.take(8).map(drop),
            WireType::Len => self.read_bytes().map(drop),
            WireType::Fixed32 => self.take(4).map(drop),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_encoding_matches_protobuf() {
        let mut w = WireWriter::new();
        w.uint64(1, 300);
        // key 0x08, then 300 = 0b1_0010_1100 → AC 02
        assert_eq!(w.into_vec(), vec![0x08, 0xAC, 0x02]);
    }

    #[test]
    fn test_negative_int32_is_ten_bytes() {
        let mut w = WireWriter::new();
        w.int32(3, -1);
        let bytes = w.into_vec();
        assert_eq!(bytes.len(), 11);
        assert_eq!(bytes[0], 0x18);

        let mut r = WireReader::new(&bytes);
        assert_eq!(r.next_field().unwrap(), Some((3, WireType::Varint)));
        assert_eq!(r.read_int32().unwrap(), -1);
        assert_eq!(r.next_field().unwrap(), None);
    }

    #[test]
    fn test_fixed64_little_endian() {
        let mut w = WireWriter::new();
        w.fixed64(1, 0x0102030405060708);
        assert_eq!(
            w.into_vec(),
            vec![0x09, 0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn test_defaults_are_omitted() {
        let mut w = WireWriter::new();
        w.uint32(1, 0);
        w.bool(2, false);
        w.bytes(3, &[]);
        w.string(4, "");
        w.fixed64(5, 0);
        assert!(w.into_vec().is_empty());
    }

    #[test]
    fn test_truncated_input() {
        let mut r = WireReader::new(&[0x08]);
        assert_eq!(r.next_field().unwrap(), Some((1, WireType::Varint)));
        assert_eq!(r.read_uint64(), Err(ProtocolError::UnexpectedEof));

        let mut r = WireReader::new(&[0x0A, 0x05, 0x01]);
        r.next_field().unwrap();
        assert_eq!(r.read_bytes(), Err(ProtocolError::UnexpectedEof));
    }

    #[test]
    fn test_varint_overflow() {
        let bytes = [0xFF; 11];
        let mut r = WireReader::new(&bytes);
        assert_eq!(r.read_uint64(), Err(ProtocolError::VarintOverflow));
    }

    #[test]
    fn test_group_wire_type_rejected() {
        // field 1, wire type 3 (start group)
        let mut r = WireReader::new(&[0x0B]);
        assert_eq!(r.next_field(), Err(ProtocolError::InvalidWireType(3)));
    }

    #[test]
    fn test_field_zero_rejected() {
        let mut r = WireReader::new(&[0x00, 0x01]);
        assert_eq!(r.next_field(), Err(ProtocolError::InvalidFieldNumber(0)));
    }

    #[test]
    fn test_length_guard() {
        let mut w = WireWriter::new();
        w.varint(((1u64) << 3) | 2);
        w.varint(MAX_FIELD_LEN as u64 + 1);
        let bytes = w.into_vec();
        let mut r = WireReader::new(&bytes);
        r.next_field().unwrap();
        assert!(matches!(
            r.read_bytes(),
            Err(ProtocolError::LengthTooLarge { .. })
        ));
    }

    #[test]
    fn test_skip_every_wire_type() {
        let mut w = WireWriter::new();
        w.uint64(1, 99);
        w.fixed64(2, 7);
        w.bytes(3, b"abc");
        w.key(4, WireType::Fixed32);
        w.buf.put_u32_le(5);
        w.string(5, "kept");
        let bytes = w.into_vec();

        let mut r = WireReader::new(&bytes);
        let mut kept = None;
        while let Some((field, wt)) = r.next_field().unwrap() {
            if field == 5 {
                kept = Some(r.read_string().unwrap());
            } else {
                r.skip(wt).unwrap();
            }
        }
        assert_eq!(kept.as_deref(), Some("kept"));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut w = WireWriter::new();
        w.bytes(1, &[0xFF, 0xFE]);
        let bytes = w.into_vec();
        let mut r = WireReader::new(&bytes);
        r.next_field().unwrap();
        assert_eq!(r.read_string(), Err(ProtocolError::InvalidUtf8));
    }
}
