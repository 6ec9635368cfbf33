//! Model materialization: turning a model row's JSON into a [`Value`] graph.
//!
//! The walk is top-down. Containers are created before their children so a
//! child that references an enclosing chunk can be written into the exact
//! slot it came from once that chunk is available. Strings starting with
//! `$` carry the special encodings:
//!
//! | Text          | Meaning                                  |
//! |---------------|------------------------------------------|
//! | `$$…`         | literal string starting with `$`         |
//! | `$L<id>`      | lazy value backed by chunk `id`          |
//! | `$@<id>`      | promise backed by chunk `id`             |
//! | `$S<name>`    | well-known symbol                        |
//! | `$F<ref>`     | remote procedure                         |
//! | `$T<key>`     | temporary reference supplied by caller   |
//! | `$Q` `$W`     | map / set from an outlined model         |
//! | `$B` `$K`     | blob / form data from an outlined model  |
//! | `$Z` `$i`     | error / iterator from an outlined model  |
//! | `$P<ref>`     | prototype of the enclosing object        |
//! | `$I` `$-Infinity` `$-0` `$NaN` | special numbers         |
//! | `$u`          | undefined                                |
//! | `$D<iso>`     | date                                     |
//! | `$n<digits>`  | big integer                              |
//! | `$E<source>`  | function source (debug only)             |
//! | `$Y`          | omitted debug value                      |
//! | `$<ref>`      | plain outlined model                     |
//!
//! `<ref>` is a hex chunk id optionally followed by `:`-separated keys.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use crate::chunk::{Chunk, ChunkPoll, ChunkStatus, Listener};
use crate::error::{RemoteError, Result, RowwireError};
use crate::protocol::parse_hex_id;
use crate::resolver::{wait_built, Handler, Reference, Slot};
use crate::session::Session;
use crate::value::{
    Array, BigInt, Blob, FormData, IteratorValue, MapValue, Object, ServerReference, SetValue, Value,
};

/// How the value found at a reference becomes the slot's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builder {
    Model,
    Map,
    Set,
    Blob,
    FormData,
    Iterator,
    Error,
    Prototype,
    ServerReference,
}

/// Rest of a build that needs another chunk first.
pub(crate) type Continuation = Box<dyn FnOnce(Value) -> Result<Built>>;

pub(crate) enum Built {
    Ready(Value),
    Wait(Chunk, Continuation),
}

/// Drive a build forward through chunks that are already settled.
pub(crate) fn settle_ready(mut built: Built) -> Result<Built> {
    loop {
        let (chunk, next) = match built {
            Built::Wait(chunk, next) => (chunk, next),
            ready => return Ok(ready),
        };
        match chunk.poll() {
            ChunkPoll::Ready(value) => built = next(value)?,
            ChunkPoll::Failed(err) => return Err(err),
            ChunkPoll::Pending => return Ok(Built::Wait(chunk, next)),
        }
    }
}

/// Apply `builder` to the value found at a reference.
pub(crate) fn build(
    session: &Rc<Session>,
    builder: &Builder,
    value: Value,
    slot: &Slot,
) -> Result<Built> {
    let built = match builder {
        Builder::Model => value,
        Builder::Map => {
            let entries = array_items(&value, "Map")?
                .into_iter()
                .map(|entry| (entry.get("0"), entry.get("1")))
                .collect();
            Value::Map(MapValue::from_entries(entries))
        }
        Builder::Set => Value::Set(SetValue::from_values(array_items(&value, "Set")?)),
        Builder::Blob => Value::Blob(Blob::from_model(&value)?),
        Builder::FormData => Value::FormData(FormData::from_model(&value)?),
        Builder::Iterator => {
            Value::Iterator(IteratorValue::from_values(array_items(&value, "Iterator")?))
        }
        Builder::Error => {
            let mut err = RemoteError::from_json(&value.to_json());
            if err.environment.is_none() {
                err.environment = Some(session.options().environment_name.clone());
            }
            Value::Error(Arc::new(err))
        }
        Builder::Prototype => match slot {
            Slot::Object(object, _) => {
                object.set_prototype(value);
                Value::Undefined
            }
            _ => {
                return Err(RowwireError::Unsupported(
                    "Prototype reference outside of an object".to_string(),
                ))
            }
        },
        Builder::ServerReference => return load_server_reference(session, value),
    };
    Ok(Built::Ready(built))
}

fn array_items(value: &Value, what: &str) -> Result<Vec<Value>> {
    match value {
        Value::Array(a) => Ok(a.to_vec()),
        other => Err(RowwireError::Unsupported(format!(
            "{} model must be an array, got {}",
            what,
            other.type_name()
        ))),
    }
}

/// Build a remote procedure from its `{id, bound}` model.
///
/// Without a server map the reference calls back into `on_remote_call`.
/// With one, the target module is loaded first, then any bound-argument
/// promise is awaited.
fn load_server_reference(session: &Rc<Session>, meta: Value) -> Result<Built> {
    let id = match meta.get("id") {
        Value::String(id) => id.to_string(),
        other => {
            return Err(RowwireError::Unsupported(format!(
                "Server reference id must be a string, got {}",
                other.type_name()
            )))
        }
    };
    let bound = match meta.get("bound") {
        Value::Null | Value::Undefined => None,
        other => Some(other),
    };
    let caller = session.options().on_remote_call.clone();

    if session.manifest().server_map.is_none() {
        let reference = ServerReference::new(&id, bound, None, caller);
        return Ok(Built::Ready(Value::ServerReference(Rc::new(reference))));
    }

    let module = session.manifest().resolve_server_reference(&id)?;
    let load = session.preload_module(&module);
    let weak = Rc::downgrade(session);
    let finish = move |bound: Option<Value>| -> Result<Built> {
        let session = weak.upgrade().ok_or(RowwireError::SessionReleased)?;
        let target = session.require_module(&module)?;
        let reference = ServerReference::new(&id, bound, Some(target), caller);
        Ok(Built::Ready(Value::ServerReference(Rc::new(reference))))
    };
    let after_load = move |_: Value| -> Result<Built> {
        match bound {
            Some(Value::Promise(chunk)) | Some(Value::Lazy(chunk)) => {
                let next = move |args: Value| -> Result<Built> { finish(Some(args)) };
                Ok(Built::Wait(chunk, Box::new(next)))
            }
            other => finish(other),
        }
    };
    match load {
        Some(chunk) => Ok(Built::Wait(chunk, Box::new(after_load))),
        None => after_load(Value::Undefined),
    }
}

/// Parse a date the way the producer formats it.
fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc3339(text) {
        return Some(date.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// One model walk. Owns the shared [`Handler`] once any reference waits.
pub(crate) struct Walker<'a> {
    session: &'a Rc<Session>,
    handler: Option<Rc<Handler>>,
}

impl<'a> Walker<'a> {
    pub(crate) fn new(session: &'a Rc<Session>) -> Self {
        Self {
            session,
            handler: None,
        }
    }

    /// Decode `json` and materialize it.
    pub(crate) fn parse(&mut self, json: &[u8]) -> Result<Value> {
        let tree: serde_json::Value = serde_json::from_slice(json)?;
        self.revive(tree, &Slot::Root)
    }

    pub(crate) fn into_handler(self) -> Option<Rc<Handler>> {
        self.handler
    }

    fn handler_with_dep(&mut self) -> Rc<Handler> {
        let handler = self.handler.get_or_insert_with(Handler::new).clone();
        handler.add_dep();
        handler
    }

    fn mark_errored(&mut self, err: RowwireError) {
        self.handler.get_or_insert_with(Handler::new).fail(err);
    }

    fn revive(&mut self, node: serde_json::Value, slot: &Slot) -> Result<Value> {
        use serde_json::Value as Json;

        Ok(match node {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => return self.parse_model_string(s, slot),
            Json::Array(items) => {
                let array = Array::new();
                for (index, item) in items.into_iter().enumerate() {
                    array.push(Value::Null);
                    let child = self.revive(item, &Slot::Array(array.clone(), index))?;
                    array.set(index, child);
                }
                Value::Array(array)
            }
            Json::Object(fields) => {
                let object = Object::new();
                for (key, item) in fields {
                    object.insert(key.clone(), Value::Null);
                    let child = self.revive(item, &Slot::Object(object.clone(), key.clone()))?;
                    if child.is_undefined() {
                        object.remove(&key);
                    } else {
                        object.insert(key, child);
                    }
                }
                Value::Object(object)
            }
        })
    }

    fn parse_model_string(&mut self, text: String, slot: &Slot) -> Result<Value> {
        let tag = match text.as_bytes() {
            [b'$', tag, ..] if tag.is_ascii() => *tag,
            [b'$', _, ..] => return self.get_outlined_model(&text[1..], slot, Builder::Model),
            _ => return Ok(Value::from(text)),
        };
        let rest = &text[2..];
        match tag {
            b'$' => Ok(Value::from(&text[1..])),
            b'L' => Ok(Value::Lazy(self.session.get_chunk(parse_hex_id(rest)?))),
            b'@' => Ok(Value::Promise(self.session.get_chunk(parse_hex_id(rest)?))),
            b'S' => Ok(Value::Symbol(Rc::from(rest))),
            b'F' => self.get_outlined_model(rest, slot, Builder::ServerReference),
            b'T' => {
                let set = self
                    .session
                    .options()
                    .temporary_references
                    .as_ref()
                    .ok_or(RowwireError::MissingTemporaryReferences)?;
                Ok(set.get(&format!("${}", rest)))
            }
            b'Q' => self.get_outlined_model(rest, slot, Builder::Map),
            b'W' => self.get_outlined_model(rest, slot, Builder::Set),
            b'B' => self.get_outlined_model(rest, slot, Builder::Blob),
            b'K' => self.get_outlined_model(rest, slot, Builder::FormData),
            b'Z' => self.get_outlined_model(rest, slot, Builder::Error),
            b'i' => self.get_outlined_model(rest, slot, Builder::Iterator),
            b'P' => self.get_outlined_model(rest, slot, Builder::Prototype),
            b'I' => Ok(Value::Number(f64::INFINITY)),
            b'-' if text == "$-0" => Ok(Value::Number(-0.0)),
            b'-' => Ok(Value::Number(f64::NEG_INFINITY)),
            b'N' => Ok(Value::Number(f64::NAN)),
            b'u' => Ok(Value::Undefined),
            b'D' => Ok(Value::Date(parse_date(rest))),
            b'n' => Ok(Value::BigInt(BigInt::parse(rest)?)),
            b'E' => Ok(Value::Function(Rc::from(rest))),
            b'Y' => Ok(Value::Omitted),
            _ => self.get_outlined_model(&text[1..], slot, Builder::Model),
        }
    }

    /// Resolve `<id>[:key...]` now if possible, otherwise leave a
    /// placeholder and register for later.
    fn get_outlined_model(&mut self, reference: &str, slot: &Slot, builder: Builder) -> Result<Value> {
        let mut parts = reference.split(':');
        let id = parse_hex_id(parts.next().unwrap_or_default())?;
        let path: Vec<String> = parts.map(str::to_string).collect();
        let chunk = self.session.get_chunk(id);

        let mut value = match chunk.poll() {
            ChunkPoll::Ready(root) => root,
            ChunkPoll::Failed(err) => {
                self.mark_errored(err);
                return Ok(Value::Null);
            }
            ChunkPoll::Pending => return Ok(self.wait_for_chunk(&chunk, slot, builder, path)),
        };

        for (i, key) in path.iter().enumerate() {
            while let Value::Lazy(inner) = &value {
                let inner = inner.clone();
                match inner.poll() {
                    ChunkPoll::Ready(next) => value = next,
                    ChunkPoll::Failed(err) => {
                        self.mark_errored(err);
                        return Ok(Value::Null);
                    }
                    ChunkPoll::Pending => {
                        return Ok(self.wait_for_chunk(&inner, slot, builder, path[i..].to_vec()))
                    }
                }
            }
            value = value.get(key);
        }
        while let Value::Lazy(inner) = &value {
            match inner.clone().poll() {
                ChunkPoll::Ready(next) => value = next,
                _ => break,
            }
        }

        match settle_ready(build(self.session, &builder, value, slot)?)? {
            Built::Ready(value) => Ok(value),
            Built::Wait(chunk, next) => {
                let handler = self.handler_with_dep();
                wait_built(handler, slot.clone(), chunk, next);
                Ok(Value::Null)
            }
        }
    }

    /// Count a dependency on an unfinished chunk and return its placeholder.
    fn wait_for_chunk(&mut self, chunk: &Chunk, slot: &Slot, builder: Builder, path: Vec<String>) -> Value {
        let handler = self.handler_with_dep();
        if chunk.status() == ChunkStatus::Halted {
            // Never completes; the owning chunk stays blocked.
            return Value::Null;
        }
        let reference = Rc::new(Reference {
            session: Rc::downgrade(self.session),
            handler,
            slot: slot.clone(),
            builder,
            path: RefCell::new(path),
        });
        chunk.add_listener(Listener::Reference(reference));
        Value::Null
    }
}
