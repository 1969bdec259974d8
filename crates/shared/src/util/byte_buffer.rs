// ByteBuffer - Binary packet serialization/deserialization
//
// All multi-byte integers on the Lineage II wire are little-endian and
// strings are UTF-16LE with a u16 0x0000 terminator.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// A byte buffer for reading/writing binary packet data.
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    data: Vec<u8>,
    read_pos: usize,
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteBuffer {
    /// Create a new empty ByteBuffer
    pub fn new() -> Self {
        ByteBuffer {
            data: Vec::new(),
            read_pos: 0,
        }
    }

    /// Create with a pre-allocated capacity
    pub fn with_capacity(capacity: usize) -> Self {
        ByteBuffer {
            data: Vec::with_capacity(capacity),
            read_pos: 0,
        }
    }

    /// Wrap an existing payload for reading
    pub fn from_bytes(data: &[u8]) -> Self {
        ByteBuffer {
            data: data.to_vec(),
            read_pos: 0,
        }
    }

    /// Get the current size of the buffer
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of unread bytes
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_pos
    }

    /// Get a pointer to the raw contents
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
    }

    // ---- Write operations (append) ----

    /// Append raw bytes
    pub fn append(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    /// Write a u8 (writeC)
    pub fn write_u8(&mut self, val: u8) {
        self.data.push(val);
    }

    /// Write a u16 (writeH)
    pub fn write_u16(&mut self, val: u16) {
        self.data.write_u16::<LittleEndian>(val).unwrap();
    }

    /// Write a u32 (writeD)
    pub fn write_u32(&mut self, val: u32) {
        self.data.write_u32::<LittleEndian>(val).unwrap();
    }

    /// Write an i32 (writeD, signed)
    pub fn write_i32(&mut self, val: i32) {
        self.data.write_i32::<LittleEndian>(val).unwrap();
    }

    /// Write a u64 (writeQ)
    pub fn write_u64(&mut self, val: u64) {
        self.data.write_u64::<LittleEndian>(val).unwrap();
    }

    /// Write an f64 (writeF)
    pub fn write_f64(&mut self, val: f64) {
        self.data.write_f64::<LittleEndian>(val).unwrap();
    }

    /// Write a UTF-16LE string with a u16 null terminator (writeS)
    pub fn write_utf16(&mut self, val: &str) {
        for unit in val.encode_utf16() {
            self.data.write_u16::<LittleEndian>(unit).unwrap();
        }
        self.data.write_u16::<LittleEndian>(0).unwrap();
    }

    // ---- Read operations ----

    /// Read a u8
    pub fn read_u8(&mut self) -> Result<u8, std::io::Error> {
        if self.read_pos >= self.data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "ByteBuffer read past end",
            ));
        }
        let val = self.data[self.read_pos];
        self.read_pos += 1;
        Ok(val)
    }

    /// Read a u16 (little-endian)
    pub fn read_u16(&mut self) -> Result<u16, std::io::Error> {
        if self.read_pos + 2 > self.data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "ByteBuffer read past end",
            ));
        }
        let mut cursor = Cursor::new(&self.data[self.read_pos..]);
        let val = cursor.read_u16::<LittleEndian>()?;
        self.read_pos += 2;
        Ok(val)
    }

    /// Read a u32 (little-endian)
    pub fn read_u32(&mut self) -> Result<u32, std::io::Error> {
        if self.read_pos + 4 > self.data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "ByteBuffer read past end",
            ));
        }
        let mut cursor = Cursor::new(&self.data[self.read_pos..]);
        let val = cursor.read_u32::<LittleEndian>()?;
        self.read_pos += 4;
        Ok(val)
    }

    /// Read an i32 (little-endian)
    pub fn read_i32(&mut self) -> Result<i32, std::io::Error> {
        self.read_u32().map(|v| v as i32)
    }

    /// Read a u64 (little-endian)
    pub fn read_u64(&mut self) -> Result<u64, std::io::Error> {
        if self.read_pos + 8 > self.data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "ByteBuffer read past end",
            ));
        }
        let mut cursor = Cursor::new(&self.data[self.read_pos..]);
        let val = cursor.read_u64::<LittleEndian>()?;
        self.read_pos += 8;
        Ok(val)
    }

    /// Read a UTF-16LE string up to the u16 null terminator (readS)
    pub fn read_utf16(&mut self) -> Result<String, std::io::Error> {
        let mut units = Vec::new();
        loop {
            let unit = self.read_u16()?;
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        String::from_utf16(&units).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid UTF-16 string")
        })
    }

    /// Read N bytes into a new vector
    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, std::io::Error> {
        if self.read_pos + count > self.data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "ByteBuffer read past end",
            ));
        }
        let bytes = self.data[self.read_pos..self.read_pos + count].to_vec();
        self.read_pos += count;
        Ok(bytes)
    }

    /// Skip N bytes in the read position
    pub fn read_skip(&mut self, count: usize) {
        self.read_pos = (self.read_pos + count).min(self.data.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_ints() {
        let mut buf = ByteBuffer::new();
        buf.write_u8(0x07);
        buf.write_u16(0xBEEF);
        buf.write_i32(-5);
        assert_eq!(buf.read_u8().unwrap(), 0x07);
        assert_eq!(buf.read_u16().unwrap(), 0xBEEF);
        assert_eq!(buf.read_i32().unwrap(), -5);
    }

    #[test]
    fn test_little_endian_layout() {
        let mut buf = ByteBuffer::new();
        buf.write_u32(0x0000_C621);
        assert_eq!(buf.contents(), &[0x21, 0xC6, 0x00, 0x00]);
    }

    #[test]
    fn test_utf16_round_trip() {
        let mut buf = ByteBuffer::new();
        buf.write_utf16("testuser");
        // 8 UTF-16 units + terminator
        assert_eq!(buf.size(), 18);
        assert_eq!(buf.read_utf16().unwrap(), "testuser");
    }

    #[test]
    fn test_utf16_terminator_stops_read() {
        let mut buf = ByteBuffer::new();
        buf.write_utf16("ab");
        buf.write_u32(7);
        assert_eq!(buf.read_utf16().unwrap(), "ab");
        assert_eq!(buf.read_u32().unwrap(), 7);
    }

    #[test]
    fn test_read_past_end() {
        let mut buf = ByteBuffer::from_bytes(&[1]);
        assert_eq!(buf.read_u8().unwrap(), 1);
        assert!(buf.read_u8().is_err());
    }
}
