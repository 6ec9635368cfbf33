//! Row buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` to stitch rows that span several transport
//! fragments. Implements a state machine over the row preamble:
//! - `Id`: accumulating hex id nibbles until `:`
//! - `Tag`: classifying the byte after `:`
//! - `Length`: accumulating hex length nibbles until `,` (sized rows)
//! - `Line`: waiting for the terminating newline
//! - `Sized`: waiting for the remaining N payload bytes
//!
//! Binary input may be split anywhere, including inside the preamble.
//! Text input must arrive in its original shape: a text fragment may end
//! between rows or right after a preamble, never inside a payload.
//!
//! # Example
//!
//! ```ignore
//! use rowwire_client::protocol::RowBuffer;
//!
//! let mut buffer = RowBuffer::new();
//!
//! // Data arrives in chunks from the transport
//! let rows = buffer.push(b"0:{\"a\":\"$1\"}\n1:{\"v\"").unwrap();
//! assert_eq!(rows.len(), 1);
//!
//! let rows = buffer.push(b":1}\n").unwrap();
//! assert_eq!(rows[0].id, 1);
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{
    hex_nibble, tags, RowTag, TagClass, DEFAULT_MAX_ROW_LENGTH, ID_TERMINATOR, LENGTH_TERMINATOR,
    ROW_TERMINATOR,
};
use super::Row;
use crate::error::{Result, RowwireError};

const SPLIT_TEXT_ROW: &str =
    "Text rows must be delivered in their original shape, not split into smaller fragments";

/// State machine for row parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Reading the hex id.
    Id,
    /// Reading the tag byte.
    Tag,
    /// Reading the hex length of a sized row.
    Length,
    /// Payload runs until the next newline.
    Line,
    /// Payload is exactly `row_length` more bytes.
    Sized,
}

/// Buffer for accumulating incoming fragments and extracting complete rows.
///
/// Partial preambles are kept as cursor state (`row_id`, `row_tag`,
/// `row_length`); partial payloads are kept in a single `BytesMut`.
pub struct RowBuffer {
    /// Payload bytes of the row in progress.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    row_id: u32,
    row_tag: RowTag,
    /// Remaining payload bytes for sized rows.
    row_length: usize,
    /// Maximum allowed payload size.
    max_row_length: usize,
}

impl RowBuffer {
    /// Create a new row buffer with default settings.
    ///
    /// Default capacity: 64KB, max row: 1GB.
    pub fn new() -> Self {
        Self::with_max_row_length(DEFAULT_MAX_ROW_LENGTH)
    }

    /// Create a new row buffer with a custom max payload size.
    pub fn with_max_row_length(max_row_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::Id,
            row_id: 0,
            row_tag: RowTag::Model,
            row_length: 0,
            max_row_length,
        }
    }

    /// Push a binary fragment and extract all complete rows.
    ///
    /// Fragments may be split at any byte boundary. Incomplete data is
    /// buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on malformed hex in the preamble or when a
    /// row exceeds the configured maximum length.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        self.push_into(data, &mut rows)?;
        Ok(rows)
    }

    /// Like [`push`](Self::push), appending to `rows`. Rows completed
    /// before an error stay in `rows`.
    ///
    /// # Errors
    ///
    /// Same as [`push`](Self::push).
    pub fn push_into(&mut self, data: &[u8], rows: &mut Vec<Row>) -> Result<()> {
        let mut i = 0;

        while i < data.len() || self.zero_length_pending() {
            if self.step_preamble(data, &mut i, false)? {
                continue;
            }

            let end = match self.state {
                State::Line => data[i..]
                    .iter()
                    .position(|&b| b == ROW_TERMINATOR)
                    .map(|offset| i + offset),
                State::Sized => Some(i + self.row_length).filter(|end| *end <= data.len()),
                _ => None,
            };

            match end {
                Some(end) => {
                    if self.state == State::Line {
                        let len = self.buffer.len() + (end - i);
                        if len > self.max_row_length {
                            return Err(self.too_large(len));
                        }
                    }
                    let payload = if self.buffer.is_empty() {
                        Bytes::copy_from_slice(&data[i..end])
                    } else {
                        self.buffer.extend_from_slice(&data[i..end]);
                        self.buffer.split().freeze()
                    };
                    rows.push(Row::new(self.row_id, self.row_tag, payload));
                    i = end;
                    if self.state == State::Line {
                        i += 1;
                    }
                    self.reset_row();
                }
                None => {
                    let rest = &data[i..];
                    self.buffer.extend_from_slice(rest);
                    if self.state == State::Sized {
                        self.row_length -= rest.len();
                    } else if self.buffer.len() > self.max_row_length {
                        return Err(self.too_large(self.buffer.len()));
                    }
                    break;
                }
            }
        }

        Ok(())
    }

    /// Push a text fragment and extract all complete rows.
    ///
    /// Only `T` rows may be sized in text mode, and each fragment must end
    /// on a row (or preamble) boundary.
    ///
    /// # Errors
    ///
    /// Returns a protocol error when a binary row tag appears or when a
    /// fragment splits a row payload.
    pub fn push_str(&mut self, text: &str) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        self.push_str_into(text, &mut rows)?;
        Ok(rows)
    }

    /// Like [`push_str`](Self::push_str), appending to `rows`. Rows
    /// completed before an error stay in `rows`.
    ///
    /// # Errors
    ///
    /// Same as [`push_str`](Self::push_str).
    pub fn push_str_into(&mut self, text: &str, rows: &mut Vec<Row>) -> Result<()> {
        let data = text.as_bytes();
        let mut i = 0;

        while i < data.len() || self.zero_length_pending() {
            if self.step_preamble(data, &mut i, true)? {
                continue;
            }

            let end = match self.state {
                State::Line => data[i..]
                    .iter()
                    .position(|&b| b == ROW_TERMINATOR)
                    .map(|offset| i + offset),
                State::Sized => {
                    if self.row_tag != RowTag::Text {
                        return Err(RowwireError::Protocol(
                            "Binary rows cannot be encoded as text".to_string(),
                        ));
                    }
                    if data.len() - i != self.row_length {
                        return Err(RowwireError::Protocol(SPLIT_TEXT_ROW.to_string()));
                    }
                    Some(data.len())
                }
                _ => None,
            };

            let Some(end) = end else {
                return Err(RowwireError::Protocol(SPLIT_TEXT_ROW.to_string()));
            };
            if !self.buffer.is_empty() {
                return Err(RowwireError::Protocol(SPLIT_TEXT_ROW.to_string()));
            }
            if self.state == State::Line && end - i > self.max_row_length {
                return Err(self.too_large(end - i));
            }

            rows.push(Row::new(
                self.row_id,
                self.row_tag,
                Bytes::copy_from_slice(&data[i..end]),
            ));
            i = end;
            if self.state == State::Line {
                i += 1;
            }
            self.reset_row();
        }

        Ok(())
    }

    /// Advance over one preamble byte. Returns `false` once the payload starts.
    fn step_preamble(&mut self, data: &[u8], i: &mut usize, text: bool) -> Result<bool> {
        match self.state {
            State::Id => {
                let byte = data[*i];
                *i += 1;
                if byte == ID_TERMINATOR {
                    self.state = State::Tag;
                } else {
                    if self.row_id > u32::MAX >> 4 {
                        return Err(RowwireError::Protocol("Row id overflows u32".to_string()));
                    }
                    self.row_id = (self.row_id << 4) | hex_nibble(byte)?;
                }
                Ok(true)
            }
            State::Tag => {
                let byte = data[*i];
                let class = match RowTag::classify(byte) {
                    // Text streams have no debug channel.
                    TagClass::Line(_) if text && byte == tags::DEBUG_CHANNEL => TagClass::Untagged,
                    class => class,
                };
                match class {
                    TagClass::Sized(tag) => {
                        self.row_tag = tag;
                        self.state = State::Length;
                        *i += 1;
                    }
                    TagClass::Line(tag) => {
                        self.row_tag = tag;
                        self.state = State::Line;
                        *i += 1;
                    }
                    // The byte belongs to the payload; leave it unconsumed.
                    TagClass::Untagged => {
                        self.row_tag = RowTag::Model;
                        self.state = State::Line;
                    }
                }
                Ok(true)
            }
            State::Length => {
                let byte = data[*i];
                *i += 1;
                if byte == LENGTH_TERMINATOR {
                    self.state = State::Sized;
                } else {
                    self.row_length = (self.row_length << 4) | hex_nibble(byte)? as usize;
                    if self.row_length > self.max_row_length {
                        return Err(self.too_large(self.row_length));
                    }
                }
                Ok(true)
            }
            State::Line | State::Sized => Ok(false),
        }
    }

    /// A sized row of length zero completes without further input.
    #[inline]
    fn zero_length_pending(&self) -> bool {
        self.state == State::Sized && self.row_length == 0
    }

    fn reset_row(&mut self) {
        self.state = State::Id;
        self.row_id = 0;
        self.row_tag = RowTag::Model;
        self.row_length = 0;
        self.buffer.clear();
    }

    fn too_large(&self, len: usize) -> RowwireError {
        RowwireError::Protocol(format!(
            "Row {:x} length {} exceeds maximum {}",
            self.row_id, len, self.max_row_length
        ))
    }

    /// Get the number of buffered payload bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if no row is in progress.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.state == State::Id && self.row_id == 0
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.reset_row();
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::Id => "Id",
            State::Tag => "Tag",
            State::Length => "Length",
            State::Line => "Line",
            State::Sized => "Sized",
        }
    }
}

impl Default for RowBuffer {
    fn default() -> Self {
        Self::new()
    }
}
