use crate::core::errors::{ReplicationError, ReplicationResult};

/// A buffer writer over a fixed slice with automatic position tracking,
/// used to build outgoing replication frames
#[derive(Debug)]
pub struct BufferWriter<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> BufferWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Get remaining space in the buffer
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    fn put(&mut self, bytes: &[u8]) -> ReplicationResult<()> {
        if self.remaining() < bytes.len() {
            return Err(ReplicationError::protocol(format!(
                "Not enough space for {} byte(s) at position {}",
                bytes.len(),
                self.position
            )));
        }
        self.buffer[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> ReplicationResult<()> {
        self.put(&[value])
    }

    pub fn write_u64(&mut self, value: u64) -> ReplicationResult<()> {
        self.put(&value.to_be_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> ReplicationResult<()> {
        self.put(&value.to_be_bytes())
    }

    /// Get the total bytes written so far
    pub fn bytes_written(&self) -> usize {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_big_endian_and_overflow() {
        let mut buf = [0u8; 9];
        let mut writer = BufferWriter::new(&mut buf);
        writer.write_u8(b'r').unwrap();
        writer.write_u64(0x0102_0304_0506_0708).unwrap();
        assert_eq!(writer.bytes_written(), 9);
        assert!(writer.write_u8(0).is_err());
        assert_eq!(buf, [b'r', 1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
