//! The `.i` sidecar companion of every data file.
//!
//! Layout, starting at offset 0: a `u32` with the total byte count of the
//! header block (the count includes the `u32` itself), the URL, the
//! response header count, and the name/value pairs, all in the buffer
//! codec's length-prefixed form. For partially cached files the block
//! bitmap follows immediately after the header block, so the block's
//! total size doubles as the bitmap offset.

use crate::codec::buffer::{BufferReader, BufferWriter};
use crate::error::{Error, Result};
use std::io::Read;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarHeader {
    pub url: String,
    /// Response headers as captured from the origin: first value per
    /// name, names lowercased.
    pub headers: Vec<(String, String)>,
}

impl SidecarHeader {
    pub fn new(url: impl Into<String>, headers: Vec<(String, String)>) -> Self {
        Self {
            url: url.into(),
            headers,
        }
    }

    /// Returns the first header with the given name, ignoring case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.get("content-length")?.trim().parse().ok()
    }

    /// Encodes the header block. The first four bytes hold the block's
    /// total size, which is also the file offset of the block bitmap.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = BufferWriter::new();
        body.put_str(&self.url);
        body.put_size(self.headers.len() as u32);
        for (name, value) in &self.headers {
            body.put_str(name);
            body.put_str(value);
        }
        let body = body.into_bytes();

        let mut block = BufferWriter::new();
        block.put_u32((body.len() + 4) as u32);
        block.put_bytes(&body);
        block.into_bytes()
    }

    /// Decodes a header block from the start of `buf` (which may extend
    /// past the block, e.g. into the bitmap). Returns the header and the
    /// bitmap offset.
    pub fn decode(buf: &[u8]) -> Result<(SidecarHeader, u32)> {
        let mut reader = BufferReader::new(buf);
        let total = reader.get_u32()?;
        if (total as usize) < 4 || total as usize > buf.len() {
            return Err(Error::MalformedSidecar("header block size out of range"));
        }
        let mut body = BufferReader::new(&buf[4..total as usize]);
        let url = body.get_str()?.to_string();
        let n_headers = body.get_size()?;
        let mut headers = Vec::with_capacity(n_headers.min(256) as usize);
        for _ in 0..n_headers {
            let name = body.get_str()?.to_string();
            let value = body.get_str()?.to_string();
            headers.push((name, value));
        }
        Ok((SidecarHeader { url, headers }, total))
    }

    /// Reads and decodes a header block from the start of `reader`.
    pub fn read_from(reader: &mut impl Read) -> Result<(SidecarHeader, u32)> {
        let mut size_buf = [0u8; 4];
        reader
            .read_exact(&mut size_buf)
            .map_err(|_| Error::MalformedSidecar("missing header block"))?;
        let total = u32::from_le_bytes(size_buf);
        if (total as usize) < 4 {
            return Err(Error::MalformedSidecar("header block size out of range"));
        }
        let mut block = vec![0u8; total as usize];
        block[..4].copy_from_slice(&size_buf);
        reader
            .read_exact(&mut block[4..])
            .map_err(|_| Error::MalformedSidecar("truncated header block"))?;
        Self::decode(&block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SidecarHeader {
        SidecarHeader::new(
            "https://example.com/video.mp4",
            vec![
                ("content-length".to_string(), "40000".to_string()),
                ("content-type".to_string(), "video/mp4".to_string()),
            ],
        )
    }

    #[test]
    fn test_roundtrip() {
        let header = sample();
        let encoded = header.encode();
        let (decoded, offset) = SidecarHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(offset as usize, encoded.len());
    }

    #[test]
    fn test_decode_ignores_trailing_bitmap_bytes() {
        let mut encoded = sample().encode();
        let offset = encoded.len();
        encoded.extend_from_slice(&[0b101, 0, 0xFF]);
        let (decoded, parsed_offset) = SidecarHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, sample());
        assert_eq!(parsed_offset as usize, offset);
    }

    #[test]
    fn test_content_length_lookup_is_case_insensitive() {
        let header = SidecarHeader::new(
            "u",
            vec![("Content-Length".to_string(), " 123 ".to_string())],
        );
        assert_eq!(header.content_length(), Some(123));
        assert_eq!(header.get("CONTENT-length"), Some(" 123 "));
    }

    #[test]
    fn test_empty_buffer_is_malformed() {
        assert!(matches!(
            SidecarHeader::decode(&[]),
            Err(Error::MalformedSidecar(_))
        ));
    }

    #[test]
    fn test_truncated_block_is_malformed() {
        let mut encoded = sample().encode();
        encoded.truncate(encoded.len() - 1);
        assert!(SidecarHeader::decode(&encoded).is_err());
    }

    #[test]
    fn test_header_size_larger_than_file_is_malformed() {
        let mut encoded = sample().encode();
        let bogus = (encoded.len() as u32 + 1).to_le_bytes();
        encoded[..4].copy_from_slice(&bogus);
        assert!(SidecarHeader::decode(&encoded).is_err());
    }

    #[test]
    fn test_read_from_consumes_exactly_the_block() {
        let header = sample();
        let mut encoded = header.encode();
        encoded.extend_from_slice(&[0xAA, 0xBB]);
        let mut cursor = std::io::Cursor::new(encoded.clone());
        let (decoded, offset) = SidecarHeader::read_from(&mut cursor).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(cursor.position(), offset as u64);
    }
}
