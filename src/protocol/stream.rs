//! Minimal big-endian marshaling used for request and reply bodies.

use crate::error::{Error, Result};
use crate::protocol::header::{EncodingVersion, ENCODING};

/// Encapsulation header: 4-byte size plus 2-byte encoding version.
pub const ENCAPSULATION_HEADER_SIZE: usize = 6;

#[derive(Debug, Default, Clone)]
pub struct OutputStream {
    buf: Vec<u8>,
}

impl OutputStream {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_blob(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Sizes below 255 take one byte, larger ones 255 followed by an i32.
    pub fn write_size(&mut self, size: usize) {
        if size < 255 {
            self.write_u8(size as u8);
        } else {
            self.write_u8(255);
            self.write_i32(size as i32);
        }
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_size(value.len());
        self.write_blob(value.as_bytes());
    }

    pub fn write_encapsulation(&mut self, encoding: EncodingVersion, data: &[u8]) {
        self.write_i32((ENCAPSULATION_HEADER_SIZE + data.len()) as i32);
        self.write_u8(encoding.major);
        self.write_u8(encoding.minor);
        self.write_blob(data);
    }

    /// Overwrite four bytes at `pos` with a big-endian i32.
    pub fn rewrite_i32(&mut self, pos: usize, value: i32) {
        self.buf[pos..pos + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Debug)]
pub struct InputStream<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> InputStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn read_blob(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::unmarshal(format!(
                "out of bounds: need {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_blob(1)?[0])
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.read_blob(4)?);
        Ok(i32::from_be_bytes(bytes))
    }

    pub fn read_size(&mut self) -> Result<usize> {
        let first = self.read_u8()?;
        if first < 255 {
            return Ok(usize::from(first));
        }
        let size = self.read_i32()?;
        if size < 0 {
            return Err(Error::unmarshal(format!("negative size {}", size)));
        }
        Ok(size as usize)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_size()?;
        let bytes = self.read_blob(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::unmarshal(format!("invalid UTF-8 string: {}", e)))
    }

    /// Read an encapsulation and return its encoding and payload.
    pub fn read_encapsulation(&mut self) -> Result<(EncodingVersion, &'a [u8])> {
        let size = self.read_i32()?;
        if size < ENCAPSULATION_HEADER_SIZE as i32 {
            return Err(Error::unmarshal(format!("encapsulation size {} too small", size)));
        }
        let encoding = EncodingVersion {
            major: self.read_u8()?,
            minor: self.read_u8()?,
        };
        if encoding.major != ENCODING.major || encoding.minor > ENCODING.minor {
            return Err(Error::UnsupportedEncoding {
                major: encoding.major,
                minor: encoding.minor,
                supported: ENCODING.to_string(),
            });
        }
        let data = self.read_blob(size as usize - ENCAPSULATION_HEADER_SIZE)?;
        Ok((encoding, data))
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_encoding_boundaries() {
        let mut out = OutputStream::new();
        out.write_size(254);
        out.write_size(255);
        assert_eq!(out.as_slice(), &[254, 255, 0, 0, 0, 255]);

        let data = out.into_inner();
        let mut input = InputStream::new(&data);
        assert_eq!(input.read_size().unwrap(), 254);
        assert_eq!(input.read_size().unwrap(), 255);
        assert_eq!(input.remaining(), 0);
    }

    #[test]
    fn test_string_and_encapsulation() {
        let mut out = OutputStream::new();
        out.write_string("echo");
        out.write_encapsulation(ENCODING, &[1, 2]);
        let data = out.into_inner();

        let mut input = InputStream::new(&data);
        assert_eq!(input.read_string().unwrap(), "echo");
        let (encoding, params) = input.read_encapsulation().unwrap();
        assert_eq!(encoding, ENCODING);
        assert_eq!(params, &[1, 2]);
    }

    #[test]
    fn test_read_past_end_fails() {
        let data = [0u8, 0, 0];
        let mut input = InputStream::new(&data);
        assert!(matches!(input.read_i32(), Err(Error::Unmarshal { .. })));
    }

    #[test]
    fn test_encapsulation_size_validated() {
        let mut out = OutputStream::new();
        out.write_i32(3);
        let data = out.into_inner();
        assert!(InputStream::new(&data).read_encapsulation().is_err());
    }
}
