//! Positional reader for logical replication payloads
//!
//! The same pgoutput message reaches us in two encodings: raw bytes from the
//! COPY protocol, and hex text from `pg_logical_slot_peek_binary_changes`.
//! [`Cursor`] reads through a [`ByteSource`] so the decoder is written once.

use crate::core::errors::{ReplicationError, ReplicationResult};
use crate::utils::binary::hex_pair;
use std::marker::PhantomData;

/// How logical bytes are laid out in the underlying buffer
pub trait ByteSource {
    /// Buffer bytes consumed per logical byte
    const WIDTH: usize;

    /// Leading buffer bytes that are not part of the payload
    fn prefix_len(_buffer: &[u8]) -> usize {
        0
    }

    /// Decode one logical byte from exactly `WIDTH` buffer bytes
    fn decode(chunk: &[u8]) -> u8;
}

/// Raw binary bytes, as delivered in XLogData frames
#[derive(Debug, Clone, Copy)]
pub struct RawBytes;

impl ByteSource for RawBytes {
    const WIDTH: usize = 1;

    fn decode(chunk: &[u8]) -> u8 {
        chunk[0]
    }
}

/// ASCII hex text, two characters per byte, optionally prefixed with `\x`
#[derive(Debug, Clone, Copy)]
pub struct HexText;

impl ByteSource for HexText {
    const WIDTH: usize = 2;

    fn prefix_len(buffer: &[u8]) -> usize {
        if buffer.starts_with(b"\\x") { 2 } else { 0 }
    }

    fn decode(chunk: &[u8]) -> u8 {
        hex_pair(chunk[0], chunk[1])
    }
}

/// Big-endian reader that advances by exactly the width it consumes
#[derive(Debug)]
pub struct Cursor<'a, S: ByteSource> {
    buffer: &'a [u8],
    position: usize,
    _source: PhantomData<S>,
}

impl<'a, S: ByteSource> Cursor<'a, S> {
    pub fn new(buffer: &'a [u8]) -> Self {
        let position = S::prefix_len(buffer).min(buffer.len());
        Self {
            buffer,
            position,
            _source: PhantomData,
        }
    }

    /// Offset into the underlying buffer
    pub fn position(&self) -> usize {
        self.position
    }

    /// Logical bytes left to read
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position) / S::WIDTH
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn ensure(&self, count: usize) -> ReplicationResult<()> {
        let available = self.remaining();
        if available < count {
            return Err(ReplicationError::truncated(count, self.position, available));
        }
        Ok(())
    }

    fn next_byte(&mut self) -> u8 {
        let chunk = &self.buffer[self.position..self.position + S::WIDTH];
        self.position += S::WIDTH;
        S::decode(chunk)
    }

    fn read_array<const N: usize>(&mut self) -> ReplicationResult<[u8; N]> {
        self.ensure(N)?;
        let mut out = [0u8; N];
        for slot in out.iter_mut() {
            *slot = self.next_byte();
        }
        Ok(out)
    }

    pub fn read_u8(&mut self) -> ReplicationResult<u8> {
        self.ensure(1)?;
        Ok(self.next_byte())
    }

    pub fn read_i16(&mut self) -> ReplicationResult<i16> {
        Ok(i16::from_be_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> ReplicationResult<i32> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> ReplicationResult<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> ReplicationResult<i64> {
        Ok(i64::from_be_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> ReplicationResult<u64> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    /// Read `count` logical bytes
    pub fn read_bytes(&mut self, count: usize) -> ReplicationResult<Vec<u8>> {
        self.ensure(count)?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.next_byte());
        }
        Ok(out)
    }

    /// Read an i32 length followed by that many bytes
    pub fn read_length_prefixed_bytes(&mut self) -> ReplicationResult<Vec<u8>> {
        let length = self.read_i32()?;
        if length < 0 {
            return Err(ReplicationError::protocol(format!(
                "Negative value length {} at position {}",
                length, self.position
            )));
        }
        self.read_bytes(length as usize)
    }

    /// Skip `count` logical bytes
    pub fn skip(&mut self, count: usize) -> ReplicationResult<()> {
        self.ensure(count)?;
        self.position += count * S::WIDTH;
        Ok(())
    }

    /// Read bytes up to (and consuming) a NUL terminator.
    ///
    /// Running out of input before the terminator is a truncation error.
    pub fn read_cstring(&mut self) -> ReplicationResult<String> {
        let mut bytes = Vec::new();
        loop {
            let byte = self.read_u8()?;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::binary::to_hex;

    #[test]
    fn test_raw_reads_advance_by_width() {
        let data = [
            0x01, // u8
            0x00, 0x02, // i16
            0x00, 0x00, 0x00, 0x03, // i32
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, // i64
        ];
        let mut cursor = Cursor::<RawBytes>::new(&data);
        assert_eq!(cursor.read_u8().unwrap(), 1);
        assert_eq!(cursor.position(), 1);
        assert_eq!(cursor.read_i16().unwrap(), 2);
        assert_eq!(cursor.position(), 3);
        assert_eq!(cursor.read_i32().unwrap(), 3);
        assert_eq!(cursor.read_i64().unwrap(), 4);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_negative_big_endian_values() {
        let data = [0xFF, 0xFE, 0xFF, 0xFF, 0xFF, 0xFF];
        let mut cursor = Cursor::<RawBytes>::new(&data);
        assert_eq!(cursor.read_i16().unwrap(), -2);
        assert_eq!(cursor.read_i32().unwrap(), -1);
    }

    #[test]
    fn test_truncated_reads_fail() {
        let data = [0x00, 0x01, 0x02];
        let mut cursor = Cursor::<RawBytes>::new(&data);
        let err = cursor.read_i32().unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::TruncatedMessage {
                needed: 4,
                available: 3,
                ..
            }
        ));

        let mut cursor = Cursor::<RawBytes>::new(&[]);
        assert!(matches!(
            cursor.read_u8(),
            Err(ReplicationError::TruncatedMessage { .. })
        ));
        assert!(matches!(
            cursor.read_u64(),
            Err(ReplicationError::TruncatedMessage { .. })
        ));
    }

    #[test]
    fn test_cstring_requires_terminator() {
        let mut cursor = Cursor::<RawBytes>::new(b"public\0students\0");
        assert_eq!(cursor.read_cstring().unwrap(), "public");
        assert_eq!(cursor.read_cstring().unwrap(), "students");

        let mut cursor = Cursor::<RawBytes>::new(b"public");
        assert!(matches!(
            cursor.read_cstring(),
            Err(ReplicationError::TruncatedMessage { .. })
        ));

        let mut cursor = Cursor::<RawBytes>::new(b"\0");
        assert_eq!(cursor.read_cstring().unwrap(), "");
    }

    #[test]
    fn test_hex_source_matches_raw_source() {
        let raw = [0x49u8, 0x00, 0x00, 0x40, 0x00, b'h', b'i', 0x00];
        let hex = format!("\\x{}", to_hex(&raw));

        let mut raw_cursor = Cursor::<RawBytes>::new(&raw);
        let mut hex_cursor = Cursor::<HexText>::new(hex.as_bytes());

        assert_eq!(hex_cursor.remaining(), raw.len());
        assert_eq!(raw_cursor.read_u8().unwrap(), hex_cursor.read_u8().unwrap());
        assert_eq!(raw_cursor.read_i32().unwrap(), hex_cursor.read_i32().unwrap());
        assert_eq!(
            raw_cursor.read_cstring().unwrap(),
            hex_cursor.read_cstring().unwrap()
        );
        assert!(hex_cursor.is_empty());
    }

    #[test]
    fn test_hex_source_without_prefix_and_odd_tail() {
        // A dangling half byte is not a full logical byte
        let mut cursor = Cursor::<HexText>::new(b"00ff4");
        assert_eq!(cursor.remaining(), 2);
        assert_eq!(cursor.read_i16().unwrap(), 0x00FF);
        assert!(matches!(
            cursor.read_u8(),
            Err(ReplicationError::TruncatedMessage { .. })
        ));
    }

    #[test]
    fn test_hex_invalid_digits_are_not_rejected() {
        let mut cursor = Cursor::<HexText>::new(b"zz");
        // 0xFF * 16 + 0xFF with wrapping
        assert_eq!(cursor.read_u8().unwrap(), 0xEF);
    }

    #[test]
    fn test_length_prefixed_bytes() {
        let data = [0x00, 0x00, 0x00, 0x02, b'o', b'k', 0xFF, 0xFF, 0xFF, 0xFF];
        let mut cursor = Cursor::<RawBytes>::new(&data);
        assert_eq!(cursor.read_length_prefixed_bytes().unwrap(), b"ok".to_vec());
        assert!(matches!(
            cursor.read_length_prefixed_bytes(),
            Err(ReplicationError::Protocol { .. })
        ));
    }
}
