//! Materialized values.
//!
//! A decoded stream produces a graph of [`Value`]s. Containers are shared
//! (`Rc<RefCell<..>>`) because the graph may contain cycles and because
//! fields of a container are filled in after the container itself exists,
//! when a forward reference resolves.
//!
//! Values that are not available yet are exposed as [`Value::Lazy`] or
//! [`Value::Promise`] wrappers around a [`Chunk`].
//!
//! # Example
//!
//! ```
//! use rowwire_client::value::{Object, Value};
//!
//! let obj = Object::new();
//! obj.insert("b", Value::from(2.0));
//! let value = Value::Object(obj);
//!
//! assert_eq!(value.get("b").as_f64(), Some(2.0));
//! assert!(value.get("missing").is_undefined());
//! ```

mod binary;
mod reference;

pub use binary::{Blob, FormData, TypedArray};
pub use reference::{Callable, RemoteCall, ServerReference, TemporaryReferenceSet};

use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;

use crate::chunk::{Chunk, ChunkPoll};
use crate::error::{RemoteError, Result, RowwireError};
use crate::stream::StreamValue;

/// A materialized value.
#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    BigInt(BigInt),
    /// `None` is an invalid date.
    Date(Option<DateTime<Utc>>),
    /// Registered symbol, by name.
    Symbol(Rc<str>),
    Array(Array),
    Object(Object),
    Map(MapValue),
    Set(SetValue),
    Iterator(IteratorValue),
    Binary(TypedArray),
    Blob(Blob),
    FormData(FormData),
    Error(Arc<RemoteError>),
    /// Value read on demand from a chunk.
    Lazy(Chunk),
    /// Future value backed by a chunk.
    Promise(Chunk),
    ServerReference(Rc<ServerReference>),
    /// Native function, typically a module export.
    Callable(Callable),
    Stream(StreamValue),
    /// Source text of a function literal. Never evaluated.
    Function(Rc<str>),
    /// Placeholder for data the producer left out to save space.
    Omitted,
}

impl Value {
    /// Short name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::BigInt(_) => "bigint",
            Value::Date(_) => "date",
            Value::Symbol(_) => "symbol",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Map(_) => "map",
            Value::Set(_) => "set",
            Value::Iterator(_) => "iterator",
            Value::Binary(_) => "typed array",
            Value::Blob(_) => "blob",
            Value::FormData(_) => "form data",
            Value::Error(_) => "error",
            Value::Lazy(_) => "lazy",
            Value::Promise(_) => "promise",
            Value::ServerReference(_) => "server reference",
            Value::Callable(_) => "function",
            Value::Stream(_) => "stream",
            Value::Function(_) => "function source",
            Value::Omitted => "omitted",
        }
    }

    #[inline]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&SetValue> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    /// The chunk behind a lazy or promise value.
    pub fn as_chunk(&self) -> Option<&Chunk> {
        match self {
            Value::Lazy(c) | Value::Promise(c) => Some(c),
            _ => None,
        }
    }

    /// Property lookup: object fields and array indices.
    ///
    /// Anything else, including a missing key, reads as `Undefined`.
    pub fn get(&self, key: &str) -> Value {
        match self {
            Value::Object(o) => o.get(key),
            Value::Array(a) => key
                .parse::<usize>()
                .ok()
                .and_then(|i| a.get(i))
                .unwrap_or(Value::Undefined),
            Value::Error(e) => match key {
                "message" => Value::from(e.message.as_str()),
                "name" => e.name.as_deref().map(Value::from).unwrap_or(Value::Undefined),
                "digest" => e.digest.as_deref().map(Value::from).unwrap_or(Value::Undefined),
                _ => Value::Undefined,
            },
            _ => Value::Undefined,
        }
    }

    /// Read through a lazy or promise wrapper without blocking.
    ///
    /// Every other variant is immediately ready with itself.
    pub fn resolve(&self) -> ChunkPoll {
        match self {
            Value::Lazy(chunk) | Value::Promise(chunk) => chunk.poll(),
            other => ChunkPoll::Ready(other.clone()),
        }
    }

    /// Identity comparison: primitives by value, containers by pointer.
    pub fn same_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a.ptr_eq(b),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(&a.0, &b.0),
            (Value::Set(a), Value::Set(b)) => Rc::ptr_eq(&a.0, &b.0),
            (Value::Lazy(a), Value::Lazy(b)) | (Value::Promise(a), Value::Promise(b)) => {
                a.ptr_eq(b)
            }
            (Value::ServerReference(a), Value::ServerReference(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Plain JSON rendering, for logging and tests.
    ///
    /// Non-JSON values degrade: `undefined` and non-finite numbers become
    /// `null`, maps and sets become arrays, a cycle back to an ancestor
    /// becomes the string `"[Circular]"`. Wrappers render their settled
    /// value without forcing initialization.
    pub fn to_json(&self) -> serde_json::Value {
        let mut ancestors = HashSet::new();
        self.to_json_inner(&mut ancestors)
    }

    fn to_json_inner(&self, ancestors: &mut HashSet<usize>) -> serde_json::Value {
        use serde_json::Value as Json;

        let container = match self {
            Value::Array(a) => Some(a.addr()),
            Value::Object(o) => Some(o.addr()),
            Value::Map(m) => Some(Rc::as_ptr(&m.0) as *const u8 as usize),
            Value::Set(s) => Some(Rc::as_ptr(&s.0) as *const u8 as usize),
            _ => None,
        };
        if let Some(addr) = container {
            if !ancestors.insert(addr) {
                return Json::String("[Circular]".to_string());
            }
        }

        let json = match self {
            Value::Undefined | Value::Null | Value::Omitted => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 => {
                Json::from(*n as i64)
            }
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.to_string()),
            Value::BigInt(b) => Json::String(b.as_str().to_string()),
            Value::Date(Some(d)) => Json::String(d.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Value::Date(None) => Json::Null,
            Value::Symbol(s) => Json::String(format!("Symbol({})", s)),
            Value::Array(a) => Json::Array(
                a.to_vec()
                    .iter()
                    .map(|v| v.to_json_inner(ancestors))
                    .collect(),
            ),
            Value::Object(o) => Json::Object(
                o.entries()
                    .into_iter()
                    .map(|(k, v)| (k, v.to_json_inner(ancestors)))
                    .collect(),
            ),
            Value::Map(m) => Json::Array(
                m.entries()
                    .iter()
                    .map(|(k, v)| {
                        Json::Array(vec![k.to_json_inner(ancestors), v.to_json_inner(ancestors)])
                    })
                    .collect(),
            ),
            Value::Set(s) => Json::Array(
                s.values()
                    .iter()
                    .map(|v| v.to_json_inner(ancestors))
                    .collect(),
            ),
            Value::Iterator(_) => Json::String("[Iterator]".to_string()),
            Value::Binary(t) => Json::Array(t.as_bytes().iter().map(|b| Json::from(*b)).collect()),
            Value::Blob(b) => serde_json::json!({ "type": b.mime_type(), "size": b.size() }),
            Value::FormData(f) => Json::Array(
                f.entries()
                    .iter()
                    .map(|(k, v)| Json::Array(vec![Json::from(k.as_str()), v.to_json_inner(ancestors)]))
                    .collect(),
            ),
            Value::Error(e) => serde_json::json!({ "message": e.message, "digest": e.digest }),
            Value::Lazy(c) | Value::Promise(c) => c
                .fulfilled_value()
                .map(|v| v.to_json_inner(ancestors))
                .unwrap_or(Json::Null),
            Value::ServerReference(r) => Json::String(format!("[ServerReference {}]", r.id())),
            Value::Callable(_) => Json::String("[Function]".to_string()),
            Value::Stream(_) => Json::String("[Stream]".to_string()),
            Value::Function(src) => Json::String(src.to_string()),
        };

        if let Some(addr) = container {
            ancestors.remove(&addr);
        }
        json
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Lazy(c) => write!(f, "Lazy({:?})", c.status()),
            Value::Promise(c) => write!(f, "Promise({:?})", c.status()),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(Array::from_vec(items))
    }
}

/// Arbitrary-precision integer, kept as its decimal text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigInt(Rc<str>);

impl BigInt {
    /// Validate and wrap a decimal integer literal.
    pub fn parse(text: &str) -> Result<Self> {
        let digits = text.strip_prefix('-').unwrap_or(text);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RowwireError::Unsupported(format!(
                "Cannot convert {:?} to a BigInt",
                text
            )));
        }
        Ok(Self(Rc::from(text)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The value as `i128`, when it fits.
    pub fn to_i128(&self) -> Option<i128> {
        self.0.parse().ok()
    }
}

/// Shared, mutable array.
#[derive(Clone, Default)]
pub struct Array(Rc<RefCell<Vec<Value>>>);

impl Array {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(items: Vec<Value>) -> Self {
        Self(Rc::new(RefCell::new(items)))
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.borrow().get(index).cloned()
    }

    /// Snapshot of the elements.
    pub fn to_vec(&self) -> Vec<Value> {
        self.0.borrow().clone()
    }

    pub fn push(&self, value: Value) {
        self.0.borrow_mut().push(value);
    }

    pub(crate) fn set(&self, index: usize, value: Value) {
        let mut items = self.0.borrow_mut();
        if index >= items.len() {
            items.resize(index + 1, Value::Undefined);
        }
        items[index] = value;
    }

    pub fn ptr_eq(&self, other: &Array) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const u8 as usize
    }
}

struct ObjectData {
    fields: IndexMap<String, Value>,
    prototype: Option<Value>,
}

/// Shared, mutable object with ordered fields.
#[derive(Clone)]
pub struct Object(Rc<RefCell<ObjectData>>);

impl Object {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(ObjectData {
            fields: IndexMap::new(),
            prototype: None,
        })))
    }

    /// Field value, `Undefined` when missing.
    pub fn get(&self, key: &str) -> Value {
        self.0
            .borrow()
            .fields
            .get(key)
            .cloned()
            .unwrap_or(Value::Undefined)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.borrow().fields.contains_key(key)
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.0.borrow_mut().fields.insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.borrow_mut().fields.shift_remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.borrow().fields.keys().cloned().collect()
    }

    /// Snapshot of the fields in insertion order.
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.0
            .borrow()
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().fields.is_empty()
    }

    /// Value installed by a prototype placeholder.
    pub fn prototype(&self) -> Option<Value> {
        self.0.borrow().prototype.clone()
    }

    pub(crate) fn set_prototype(&self, prototype: Value) {
        self.0.borrow_mut().prototype = Some(prototype);
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as *const u8 as usize
    }
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

/// Insertion-ordered map keyed by value identity.
#[derive(Clone)]
pub struct MapValue(Rc<RefCell<Vec<(Value, Value)>>>);

impl MapValue {
    /// Build from entries; a repeated key keeps its first position and the
    /// last value.
    pub fn from_entries(entries: Vec<(Value, Value)>) -> Self {
        let mut out: Vec<(Value, Value)> = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match out.iter_mut().find(|(k, _)| k.same_value(&key)) {
                Some(slot) => slot.1 = value,
                None => out.push((key, value)),
            }
        }
        Self(Rc::new(RefCell::new(out)))
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.0
            .borrow()
            .iter()
            .find(|(k, _)| k.same_value(key))
            .map(|(_, v)| v.clone())
    }

    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.0.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

/// Insertion-ordered set keyed by value identity.
#[derive(Clone)]
pub struct SetValue(Rc<RefCell<Vec<Value>>>);

impl SetValue {
    pub fn from_values(values: Vec<Value>) -> Self {
        let mut out: Vec<Value> = Vec::with_capacity(values.len());
        for value in values {
            if !out.iter().any(|v| v.same_value(&value)) {
                out.push(value);
            }
        }
        Self(Rc::new(RefCell::new(out)))
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.0.borrow().iter().any(|v| v.same_value(value))
    }

    pub fn values(&self) -> Vec<Value> {
        self.0.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

/// Single-pass iterator over a snapshot of an array.
#[derive(Clone)]
pub struct IteratorValue(Rc<RefCell<VecDeque<Value>>>);

impl IteratorValue {
    pub fn from_values(values: Vec<Value>) -> Self {
        Self(Rc::new(RefCell::new(values.into())))
    }

    /// Next element, `None` once exhausted.
    pub fn next_value(&self) -> Option<Value> {
        self.0.borrow_mut().pop_front()
    }

    pub fn remaining(&self) -> usize {
        self.0.borrow().len()
    }
}
