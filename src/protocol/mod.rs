//! Protocol module - wire format, row framing, and row types.
//!
//! This module implements the framing layer of the stream:
//! - Tag catalog and hex decoding of the row preamble
//! - Row buffer for reassembling rows split across fragments
//! - Row struct with typed accessors

mod row;
mod row_buffer;
mod wire_format;

pub use row::{build_row, Row};
pub use row_buffer::RowBuffer;
pub use wire_format::{
    hex_nibble, parse_hex_id, tags, BinaryKind, RowTag, TagClass, DEFAULT_MAX_ROW_LENGTH,
    ID_TERMINATOR, LENGTH_TERMINATOR, ROW_TERMINATOR,
};
