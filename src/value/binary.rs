//! Binary values: typed arrays, blobs and form data.

use std::rc::Rc;

use bytes::{Bytes, BytesMut};

use super::Value;
use crate::error::{Result, RowwireError};
use crate::protocol::BinaryKind;

/// Fixed-width elements decoded from a binary row.
///
/// Elements are little-endian on the wire. The raw bytes are kept as-is;
/// the typed accessors decode on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedArray {
    kind: BinaryKind,
    bytes: Bytes,
}

macro_rules! typed_accessor {
    ($name:ident, $ty:ty, $size:expr) => {
        #[doc = concat!("Decode the elements as `", stringify!($ty), "`.")]
        pub fn $name(&self) -> Vec<$ty> {
            self.bytes
                .chunks_exact($size)
                .map(|c| {
                    let mut raw = [0u8; $size];
                    raw.copy_from_slice(c);
                    <$ty>::from_le_bytes(raw)
                })
                .collect()
        }
    };
}

impl TypedArray {
    /// Wrap a row payload.
    ///
    /// # Errors
    ///
    /// Fails when the byte length is not a multiple of the element size.
    pub fn new(kind: BinaryKind, bytes: Bytes) -> Result<Self> {
        if bytes.len() % kind.element_size() != 0 {
            return Err(RowwireError::Unsupported(format!(
                "Byte length {} is not a multiple of the {:?} element size {}",
                bytes.len(),
                kind,
                kind.element_size()
            )));
        }
        Ok(Self { kind, bytes })
    }

    #[inline]
    pub fn kind(&self) -> BinaryKind {
        self.kind
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len() / self.kind.element_size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    typed_accessor!(to_i8, i8, 1);
    typed_accessor!(to_i16, i16, 2);
    typed_accessor!(to_u16, u16, 2);
    typed_accessor!(to_i32, i32, 4);
    typed_accessor!(to_u32, u32, 4);
    typed_accessor!(to_f32, f32, 4);
    typed_accessor!(to_f64, f64, 8);
    typed_accessor!(to_i64, i64, 8);
    typed_accessor!(to_u64, u64, 8);
}

/// Immutable binary object with a MIME type.
#[derive(Debug, Clone)]
pub struct Blob(Rc<BlobData>);

#[derive(Debug)]
struct BlobData {
    mime_type: String,
    parts: Vec<Bytes>,
}

impl Blob {
    pub fn new(mime_type: impl Into<String>, parts: Vec<Bytes>) -> Self {
        Self(Rc::new(BlobData {
            mime_type: mime_type.into(),
            parts,
        }))
    }

    /// Build from the outlined model `[mimeType, ...parts]`.
    ///
    /// Parts may be strings, typed arrays or other blobs.
    pub(crate) fn from_model(model: &Value) -> Result<Self> {
        let items = match model {
            Value::Array(a) => a.to_vec(),
            other => {
                return Err(RowwireError::Unsupported(format!(
                    "Blob model must be an array, got {}",
                    other.type_name()
                )))
            }
        };
        let mut items = items.into_iter();
        let mime_type = match items.next() {
            Some(Value::String(s)) => s.to_string(),
            _ => String::new(),
        };
        let parts = items
            .map(|part| match part {
                Value::String(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
                Value::Binary(t) => Ok(t.bytes.clone()),
                Value::Blob(b) => Ok(b.bytes()),
                other => Err(RowwireError::Unsupported(format!(
                    "Cannot use {} as a blob part",
                    other.type_name()
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(mime_type, parts))
    }

    pub fn mime_type(&self) -> &str {
        &self.0.mime_type
    }

    /// Total size in bytes.
    pub fn size(&self) -> usize {
        self.0.parts.iter().map(Bytes::len).sum()
    }

    /// Contents as one contiguous buffer.
    pub fn bytes(&self) -> Bytes {
        match self.0.parts.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            parts => {
                let mut out = BytesMut::with_capacity(self.size());
                for part in parts {
                    out.extend_from_slice(part);
                }
                out.freeze()
            }
        }
    }
}

/// Ordered multi-valued form fields.
#[derive(Debug, Clone, Default)]
pub struct FormData(Rc<Vec<(String, Value)>>);

impl FormData {
    /// Build from the outlined model `[[key, value], ...]`.
    pub(crate) fn from_model(model: &Value) -> Result<Self> {
        let items = match model {
            Value::Array(a) => a.to_vec(),
            other => {
                return Err(RowwireError::Unsupported(format!(
                    "Form data model must be an array, got {}",
                    other.type_name()
                )))
            }
        };
        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            let key = match item.get("0") {
                Value::String(s) => s.to_string(),
                other => {
                    return Err(RowwireError::Unsupported(format!(
                        "Form data key must be a string, got {}",
                        other.type_name()
                    )))
                }
            };
            entries.push((key, item.get("1")));
        }
        Ok(Self(Rc::new(entries)))
    }

    pub fn entries(&self) -> &[(String, Value)] {
        &self.0
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    }

    /// All values for `key`, in order.
    pub fn get_all(&self, key: &str) -> Vec<Value> {
        self.0
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
