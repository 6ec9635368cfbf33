//! Row struct with typed accessors.
//!
//! A row is one framed unit of the stream: the id it addresses, its tag
//! and the raw payload. Payloads are `bytes::Bytes` so binary rows can be
//! handed to typed-array decoding without another copy.
//!
//! # Example
//!
//! ```
//! use rowwire_client::protocol::{build_row, RowBuffer, RowTag};
//!
//! let mut buffer = RowBuffer::new();
//! let rows = buffer.push(&build_row(1, RowTag::Model, b"{\"v\":1}")).unwrap();
//!
//! assert_eq!(rows[0].id, 1);
//! assert_eq!(rows[0].payload_str().unwrap(), "{\"v\":1}");
//! ```

use bytes::Bytes;

use super::wire_format::{RowTag, ID_TERMINATOR, LENGTH_TERMINATOR, ROW_TERMINATOR};
use crate::error::{Result, RowwireError};

/// A complete protocol row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Chunk id this row addresses.
    pub id: u32,
    /// Decoded tag.
    pub tag: RowTag,
    /// Payload bytes, without the trailing newline of line rows.
    pub payload: Bytes,
}

impl Row {
    /// Create a new row.
    pub fn new(id: u32, tag: RowTag, payload: Bytes) -> Self {
        Self { id, tag, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload decoded as UTF-8.
    pub fn payload_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload).map_err(|e| {
            RowwireError::Protocol(format!("Row {:x} payload is not valid UTF-8: {}", self.id, e))
        })
    }

    /// Check if the payload is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Encode a row in its wire form.
///
/// Sized tags get a hex length prefix, everything else is newline
/// terminated. Mostly useful for tests and fixtures.
pub fn build_row(id: u32, tag: RowTag, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 16);
    out.extend_from_slice(format!("{:x}", id).as_bytes());
    out.push(ID_TERMINATOR);
    if let Some(byte) = tag.to_byte() {
        out.push(byte);
    }
    if tag.is_sized() {
        out.extend_from_slice(format!("{:x}", payload.len()).as_bytes());
        out.push(LENGTH_TERMINATOR);
        out.extend_from_slice(payload);
    } else {
        out.extend_from_slice(payload);
        out.push(ROW_TERMINATOR);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BinaryKind;

    #[test]
    fn test_build_model_row() {
        assert_eq!(build_row(0x1f, RowTag::Model, b"[1]"), b"1f:[1]\n");
    }

    #[test]
    fn test_build_tagged_line_row() {
        assert_eq!(build_row(2, RowTag::ReadableStream, b""), b"2:R\n");
    }

    #[test]
    fn test_build_sized_rows() {
        assert_eq!(build_row(3, RowTag::Text, b"hello"), b"3:T5,hello");
        assert_eq!(
            build_row(4, RowTag::Binary(BinaryKind::Uint8), &[0u8; 17]),
            [b"4:o11,".as_slice(), &[0u8; 17]].concat()
        );
    }

    #[test]
    fn test_payload_str_rejects_invalid_utf8() {
        let row = Row::new(1, RowTag::Model, Bytes::from_static(&[0xff, 0xfe]));
        assert!(row.payload_str().is_err());
    }
}
