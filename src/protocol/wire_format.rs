//! Wire format constants and tag decoding.
//!
//! Every row has the shape:
//! ```text
//! ┌──────────┬───┬─────┬──────────────┬───┬──────────────┐
//! │ id (hex) │ : │ tag │ length (hex) │ , │ payload      │   sized rows
//! ├──────────┼───┼─────┼──────────────┴───┴──────────────┤
//! │ id (hex) │ : │ tag?│ payload ... \n                   │   line rows
//! └──────────┴───┴─────┴──────────────────────────────────┘
//! ```
//!
//! Ids and lengths are lower-case hex, accumulated one nibble at a time.
//! The tag is optional for line rows: when the byte after `:` is not a
//! recognised tag it is the first byte of a plain model payload.

use crate::error::{Result, RowwireError};

/// Default maximum row payload size (1 GB).
pub const DEFAULT_MAX_ROW_LENGTH: usize = 1_073_741_824;

/// Separator between the id and the tag.
pub const ID_TERMINATOR: u8 = b':';

/// Separator between a sized row's length and its payload.
pub const LENGTH_TERMINATOR: u8 = b',';

/// Terminator of line rows.
pub const ROW_TERMINATOR: u8 = b'\n';

/// Tag bytes used on the wire.
pub mod tags {
    pub const MODULE: u8 = b'I';
    pub const HINT: u8 = b'H';
    pub const ERROR: u8 = b'E';
    pub const TEXT: u8 = b'T';
    pub const TIME_ORIGIN: u8 = b'N';
    pub const DEBUG_INFO: u8 = b'D';
    pub const IO_INFO: u8 = b'J';
    pub const CONSOLE: u8 = b'W';
    pub const READABLE_STREAM: u8 = b'R';
    pub const BYTE_STREAM: u8 = b'r';
    pub const ASYNC_ITERABLE: u8 = b'X';
    pub const ASYNC_ITERATOR: u8 = b'x';
    pub const CLOSE: u8 = b'C';
    pub const DEBUG_CHANNEL: u8 = b'#';

    pub const ARRAY_BUFFER: u8 = b'A';
    pub const INT8: u8 = b'O';
    pub const UINT8: u8 = b'o';
    pub const UINT8_CLAMPED: u8 = b'U';
    pub const INT16: u8 = b'S';
    pub const UINT16: u8 = b's';
    pub const INT32: u8 = b'L';
    pub const UINT32: u8 = b'l';
    pub const FLOAT32: u8 = b'G';
    pub const FLOAT64: u8 = b'g';
    pub const BIG_INT64: u8 = b'M';
    pub const BIG_UINT64: u8 = b'm';
    pub const DATA_VIEW: u8 = b'V';
}

/// Element type of a fixed-length binary row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryKind {
    ArrayBuffer,
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
    DataView,
}

impl BinaryKind {
    /// Map a tag byte to a binary element kind.
    pub fn from_tag(tag: u8) -> Option<Self> {
        let kind = match tag {
            tags::ARRAY_BUFFER => BinaryKind::ArrayBuffer,
            tags::INT8 => BinaryKind::Int8,
            tags::UINT8 => BinaryKind::Uint8,
            tags::UINT8_CLAMPED => BinaryKind::Uint8Clamped,
            tags::INT16 => BinaryKind::Int16,
            tags::UINT16 => BinaryKind::Uint16,
            tags::INT32 => BinaryKind::Int32,
            tags::UINT32 => BinaryKind::Uint32,
            tags::FLOAT32 => BinaryKind::Float32,
            tags::FLOAT64 => BinaryKind::Float64,
            tags::BIG_INT64 => BinaryKind::BigInt64,
            tags::BIG_UINT64 => BinaryKind::BigUint64,
            tags::DATA_VIEW => BinaryKind::DataView,
            _ => return None,
        };
        Some(kind)
    }

    /// The tag byte for this kind.
    pub fn tag(self) -> u8 {
        match self {
            BinaryKind::ArrayBuffer => tags::ARRAY_BUFFER,
            BinaryKind::Int8 => tags::INT8,
            BinaryKind::Uint8 => tags::UINT8,
            BinaryKind::Uint8Clamped => tags::UINT8_CLAMPED,
            BinaryKind::Int16 => tags::INT16,
            BinaryKind::Uint16 => tags::UINT16,
            BinaryKind::Int32 => tags::INT32,
            BinaryKind::Uint32 => tags::UINT32,
            BinaryKind::Float32 => tags::FLOAT32,
            BinaryKind::Float64 => tags::FLOAT64,
            BinaryKind::BigInt64 => tags::BIG_INT64,
            BinaryKind::BigUint64 => tags::BIG_UINT64,
            BinaryKind::DataView => tags::DATA_VIEW,
        }
    }

    /// Size in bytes of one element.
    #[inline]
    pub fn element_size(self) -> usize {
        match self {
            BinaryKind::ArrayBuffer
            | BinaryKind::Int8
            | BinaryKind::Uint8
            | BinaryKind::Uint8Clamped
            | BinaryKind::DataView => 1,
            BinaryKind::Int16 | BinaryKind::Uint16 => 2,
            BinaryKind::Int32 | BinaryKind::Uint32 | BinaryKind::Float32 => 4,
            BinaryKind::Float64 | BinaryKind::BigInt64 | BinaryKind::BigUint64 => 8,
        }
    }
}

/// Decoded row tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowTag {
    /// No tag: plain model payload.
    Model,
    Module,
    Hint,
    Error,
    /// Sized UTF-8 text value.
    Text,
    TimeOrigin,
    DebugInfo,
    IoInfo,
    Console,
    ReadableStream,
    ByteStream,
    AsyncIterable,
    AsyncIterator,
    Close,
    /// Sized binary value.
    Binary(BinaryKind),
    /// Any other recognised line tag. Interpreted as a model row.
    Other(u8),
}

/// How the tokenizer treats the byte following `:`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    /// Tag with an explicit hex length.
    Sized(RowTag),
    /// Tag followed by a newline-terminated payload.
    Line(RowTag),
    /// Not a tag: the byte starts a plain model payload.
    Untagged,
}

impl RowTag {
    /// Classify the byte following the id separator.
    pub fn classify(byte: u8) -> TagClass {
        if byte == tags::TEXT {
            return TagClass::Sized(RowTag::Text);
        }
        if let Some(kind) = BinaryKind::from_tag(byte) {
            return TagClass::Sized(RowTag::Binary(kind));
        }
        if byte.is_ascii_uppercase()
            || byte == tags::DEBUG_CHANNEL
            || byte == tags::BYTE_STREAM
            || byte == tags::ASYNC_ITERATOR
        {
            return TagClass::Line(RowTag::from_line_byte(byte));
        }
        TagClass::Untagged
    }

    fn from_line_byte(byte: u8) -> Self {
        match byte {
            tags::MODULE => RowTag::Module,
            tags::HINT => RowTag::Hint,
            tags::ERROR => RowTag::Error,
            tags::TIME_ORIGIN => RowTag::TimeOrigin,
            tags::DEBUG_INFO => RowTag::DebugInfo,
            tags::IO_INFO => RowTag::IoInfo,
            tags::CONSOLE => RowTag::Console,
            tags::READABLE_STREAM => RowTag::ReadableStream,
            tags::BYTE_STREAM => RowTag::ByteStream,
            tags::ASYNC_ITERABLE => RowTag::AsyncIterable,
            tags::ASYNC_ITERATOR => RowTag::AsyncIterator,
            tags::CLOSE => RowTag::Close,
            other => RowTag::Other(other),
        }
    }

    /// The byte written on the wire for this tag, `None` for untagged rows.
    pub fn to_byte(self) -> Option<u8> {
        let byte = match self {
            RowTag::Model => return None,
            RowTag::Module => tags::MODULE,
            RowTag::Hint => tags::HINT,
            RowTag::Error => tags::ERROR,
            RowTag::Text => tags::TEXT,
            RowTag::TimeOrigin => tags::TIME_ORIGIN,
            RowTag::DebugInfo => tags::DEBUG_INFO,
            RowTag::IoInfo => tags::IO_INFO,
            RowTag::Console => tags::CONSOLE,
            RowTag::ReadableStream => tags::READABLE_STREAM,
            RowTag::ByteStream => tags::BYTE_STREAM,
            RowTag::AsyncIterable => tags::ASYNC_ITERABLE,
            RowTag::AsyncIterator => tags::ASYNC_ITERATOR,
            RowTag::Close => tags::CLOSE,
            RowTag::Binary(kind) => kind.tag(),
            RowTag::Other(byte) => byte,
        };
        Some(byte)
    }

    /// Check if rows with this tag carry an explicit length.
    #[inline]
    pub fn is_sized(self) -> bool {
        matches!(self, RowTag::Text | RowTag::Binary(_))
    }
}

/// Decode one lower-case hex digit.
#[inline]
pub fn hex_nibble(byte: u8) -> Result<u32> {
    match byte {
        b'0'..=b'9' => Ok((byte - b'0') as u32),
        b'a'..=b'f' => Ok((byte - b'a' + 10) as u32),
        _ => Err(RowwireError::Protocol(format!(
            "Invalid hex digit {:?} in row preamble",
            byte as char
        ))),
    }
}

/// Parse a complete hex string (used for ids inside placeholders).
pub fn parse_hex_id(text: &str) -> Result<u32> {
    if text.is_empty() {
        return Err(RowwireError::Unsupported(
            "Empty reference id".to_string(),
        ));
    }
    u32::from_str_radix(text, 16)
        .map_err(|_| RowwireError::Unsupported(format!("Invalid reference id {:?}", text)))
}
