//! Response session: the chunk table and row dispatch.
//!
//! A [`Session`] owns everything one response needs: the row reassembly
//! buffer, the id to [`Chunk`] table, the module cache and the side
//! channels (debug info, console replay, hints). Rows are applied in
//! arrival order; values referencing rows that have not arrived yet stay
//! blocked until they do.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use bytes::Bytes;

use crate::chunk::{
    halt_chunk, resolve_chunk_value, resolve_model_chunk, resolve_module_chunk,
    resolve_stream_chunk, trigger_error_on_chunk, Chunk, ChunkStatus,
};
use crate::client::SessionOptions;
use crate::error::{RemoteError, Result, RowwireError};
use crate::modules::{LoadContext, Manifest, ModuleCache, ModuleDescriptor, ModuleLoader};
use crate::protocol::{Row, RowBuffer, RowTag};
use crate::stream::{self, StreamKind, StreamSink, UNDEFINED_MODEL};
use crate::value::{TypedArray, Value};

/// Decoding state for one response.
pub struct Session {
    this: Weak<Session>,
    manifest: Manifest,
    options: SessionOptions,
    loader: Rc<dyn ModuleLoader>,
    modules: ModuleCache,
    rows: RefCell<RowBuffer>,
    chunks: RefCell<HashMap<u32, Chunk>>,
    closed: Cell<bool>,
    closed_reason: RefCell<Option<RowwireError>>,
    time_origin: Cell<Option<f64>>,
    debug_info: RefCell<HashMap<u32, Vec<serde_json::Value>>>,
    io_info: RefCell<HashMap<u32, Vec<serde_json::Value>>>,
    /// Last console entry still waiting on a forward reference.
    blocked_console: Rc<RefCell<Option<Chunk>>>,
}

impl Session {
    pub(crate) fn new(manifest: Manifest, options: SessionOptions, loader: Rc<dyn ModuleLoader>) -> Rc<Self> {
        let rows = RowBuffer::with_max_row_length(options.max_row_length);
        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            manifest,
            options,
            loader,
            modules: ModuleCache::default(),
            rows: RefCell::new(rows),
            chunks: RefCell::new(HashMap::new()),
            closed: Cell::new(false),
            closed_reason: RefCell::new(None),
            time_origin: Cell::new(None),
            debug_info: RefCell::new(HashMap::new()),
            io_info: RefCell::new(HashMap::new()),
            blocked_console: Rc::new(RefCell::new(None)),
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// The chunk for `id`, created pending on first use.
    ///
    /// After [`close`](Self::close), unknown ids get a chunk rejected with
    /// the close reason.
    pub fn get_chunk(&self, id: u32) -> Chunk {
        if let Some(chunk) = self.chunks.borrow().get(&id) {
            return chunk.clone();
        }
        let chunk = match self.closed_reason.borrow().clone() {
            Some(reason) => Chunk::rejected(reason),
            None => Chunk::pending(),
        };
        self.chunks.borrow_mut().insert(id, chunk.clone());
        chunk
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub fn closed_reason(&self) -> Option<RowwireError> {
        self.closed_reason.borrow().clone()
    }

    /// Time origin announced by the producer, in milliseconds.
    pub fn time_origin(&self) -> Option<f64> {
        self.time_origin.get()
    }

    /// Debug records received for `id`, in arrival order.
    pub fn debug_info(&self, id: u32) -> Vec<serde_json::Value> {
        self.debug_info.borrow().get(&id).cloned().unwrap_or_default()
    }

    /// I/O timing records received for `id`, in arrival order.
    pub fn io_info(&self, id: u32) -> Vec<serde_json::Value> {
        self.io_info.borrow().get(&id).cloned().unwrap_or_default()
    }

    /// Feed a binary fragment.
    ///
    /// # Errors
    ///
    /// A framing violation closes the session and is returned.
    pub fn process_bytes(&self, data: &[u8]) -> Result<()> {
        if self.closed.get() {
            tracing::debug!(len = data.len(), "ignoring data after close");
            return Ok(());
        }
        let mut rows = Vec::new();
        let result = self.rows.borrow_mut().push_into(data, &mut rows);
        self.apply(rows, result)
    }

    /// Feed a text fragment. Rows must arrive whole.
    ///
    /// # Errors
    ///
    /// A framing violation closes the session and is returned.
    pub fn process_text(&self, text: &str) -> Result<()> {
        if self.closed.get() {
            tracing::debug!(len = text.len(), "ignoring text after close");
            return Ok(());
        }
        let mut rows = Vec::new();
        let result = self.rows.borrow_mut().push_str_into(text, &mut rows);
        self.apply(rows, result)
    }

    /// Apply the rows framed so far, then close on a framing error.
    fn apply(&self, rows: Vec<Row>, result: Result<()>) -> Result<()> {
        for row in rows {
            self.process_row(row);
        }
        if let Err(err) = result {
            tracing::warn!(error = %err, "protocol violation, closing session");
            self.close(err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Apply one complete row.
    pub fn process_row(&self, row: Row) {
        if self.closed.get() {
            tracing::debug!(id = row.id, "ignoring row after close");
            return;
        }
        tracing::trace!(id = row.id, tag = ?row.tag, len = row.payload.len(), "row");
        let id = row.id;
        match row.tag {
            RowTag::Module => self.resolve_module(id, &row.payload),
            RowTag::Hint => self.resolve_hint(&row.payload),
            RowTag::Error => self.resolve_error(id, &row.payload),
            RowTag::Text => match row.payload_str() {
                Ok(text) => self.resolve_value(id, Value::from(text)),
                Err(err) => self.reject_id(id, err),
            },
            RowTag::Binary(kind) => match TypedArray::new(kind, row.payload.clone()) {
                Ok(array) => self.resolve_value(id, Value::Binary(array)),
                Err(err) => self.reject_id(id, err),
            },
            RowTag::TimeOrigin => self.resolve_time_origin(&row.payload),
            RowTag::DebugInfo => record_info(&self.debug_info, id, &row.payload),
            RowTag::IoInfo => record_info(&self.io_info, id, &row.payload),
            RowTag::Console => self.resolve_console(row.payload),
            RowTag::ReadableStream => self.start_readable(id, StreamKind::Values),
            RowTag::ByteStream => self.start_readable(id, StreamKind::Bytes),
            RowTag::AsyncIterable => self.start_iterable(id, false),
            RowTag::AsyncIterator => self.start_iterable(id, true),
            RowTag::Close => self.close_stream(id, row.payload),
            RowTag::Model | RowTag::Other(_) => {
                if row.is_empty() {
                    self.halt(id);
                } else {
                    self.resolve_model(id, row.payload);
                }
            }
        }
    }

    /// Fail every outstanding value with `reason`.
    ///
    /// Pending and blocked chunks are rejected and open streams are errored.
    /// Settled values are untouched and later rows are ignored.
    pub fn close(&self, reason: RowwireError) {
        if self.closed.replace(true) {
            return;
        }
        tracing::debug!(error = %reason, "closing session");
        *self.closed_reason.borrow_mut() = Some(reason.clone());
        self.rows.borrow_mut().clear();

        let chunks: Vec<Chunk> = self.chunks.borrow().values().cloned().collect();
        for chunk in chunks {
            fail_outstanding(&chunk, &reason);
        }
    }

    pub(crate) fn preload_module(&self, module: &ModuleDescriptor) -> Option<Chunk> {
        let policy = self.manifest.module_loading.clone().unwrap_or_default();
        let context = LoadContext {
            prefix: policy.prefix,
            cross_origin: policy.cross_origin,
            nonce: self.options.nonce.clone(),
        };
        self.modules.preload(self.loader.as_ref(), module, &context)
    }

    pub(crate) fn require_module(&self, module: &ModuleDescriptor) -> Result<Value> {
        self.modules.require(self.loader.as_ref(), module)
    }

    fn existing(&self, id: u32) -> Option<Chunk> {
        self.chunks.borrow().get(&id).cloned()
    }

    fn insert(&self, id: u32, chunk: Chunk) {
        self.chunks.borrow_mut().insert(id, chunk);
    }

    fn resolve_model(&self, id: u32, json: Bytes) {
        match self.existing(id) {
            Some(chunk) => resolve_model_chunk(&chunk, json, &self.this),
            None => self.insert(id, Chunk::resolved_model(json, self.this.clone())),
        }
    }

    fn resolve_value(&self, id: u32, value: Value) {
        match self.existing(id) {
            Some(chunk) if chunk.status() != ChunkStatus::Pending => match chunk.sink() {
                Some(sink) => sink.enqueue_value(value),
                None => tracing::warn!(id, "value row for a chunk that already settled"),
            },
            Some(chunk) => {
                resolve_chunk_value(&chunk, value);
            }
            None => self.insert(id, Chunk::fulfilled(value)),
        }
    }

    fn reject_id(&self, id: u32, err: RowwireError) {
        match self.existing(id) {
            Some(chunk) => trigger_error_on_chunk(&chunk, err),
            None => self.insert(id, Chunk::rejected(err)),
        }
    }

    fn resolve_error(&self, id: u32, payload: &[u8]) {
        let err = match serde_json::from_slice::<serde_json::Value>(payload) {
            Ok(info) => RowwireError::from(RemoteError::from_json(&info)),
            Err(err) => err.into(),
        };
        tracing::debug!(id, error = %err, "error row");
        self.reject_id(id, err);
    }

    fn resolve_module(&self, id: u32, payload: &[u8]) {
        let resolved = serde_json::from_slice::<serde_json::Value>(payload)
            .map_err(RowwireError::from)
            .and_then(|metadata| self.manifest.resolve_client_reference(&metadata));
        let module = match resolved {
            Ok(module) => module,
            Err(err) => {
                tracing::warn!(id, error = %err, "unresolvable module reference");
                self.reject_id(id, err);
                return;
            }
        };

        let existing = self.existing(id);
        let Some(load) = self.preload_module(&module) else {
            match existing {
                Some(chunk) => resolve_module_chunk(&chunk, module, &self.this),
                None => self.insert(id, Chunk::resolved_module(module, self.this.clone())),
            }
            return;
        };

        let chunk = match existing {
            Some(chunk) if chunk.status() == ChunkStatus::Pending => {
                chunk.block();
                chunk
            }
            Some(chunk) => {
                tracing::warn!(id, status = ?chunk.status(), "module row for a chunk that already settled");
                return;
            }
            None => {
                let chunk = Chunk::blocked();
                self.insert(id, chunk.clone());
                chunk
            }
        };
        let (loaded, failed) = (chunk.clone(), chunk);
        let session = self.this.clone();
        load.then(
            move |_| resolve_module_chunk(&loaded, module, &session),
            move |err| trigger_error_on_chunk(&failed, err),
        );
    }

    fn resolve_hint(&self, payload: &[u8]) {
        let text = match std::str::from_utf8(payload) {
            Ok(text) if !text.is_empty() => text,
            _ => {
                tracing::warn!("malformed hint row");
                return;
            }
        };
        let split = text.chars().next().map_or(0, char::len_utf8);
        let (code, model) = text.split_at(split);
        let model: serde_json::Value = match serde_json::from_str(model) {
            Ok(model) => model,
            Err(err) => {
                tracing::warn!(code, error = %err, "malformed hint payload");
                return;
            }
        };
        match &self.options.on_hint {
            Some(on_hint) => on_hint(code, &model),
            None => tracing::debug!(code, hint = %model, "resource hint"),
        }
    }

    fn resolve_time_origin(&self, payload: &[u8]) {
        match std::str::from_utf8(payload).ok().and_then(|s| s.trim().parse::<f64>().ok()) {
            Some(origin) => self.time_origin.set(Some(origin)),
            None => tracing::warn!("malformed time origin row"),
        }
    }

    fn resolve_console(&self, json: Bytes) {
        if !self.options.replay_logs {
            return;
        }
        let emit = self.console_emitter();
        let previous = self.blocked_console.borrow().clone();
        let Some(previous) = previous else {
            let entry = Chunk::resolved_model(json, self.this.clone());
            match entry.poll().ready() {
                Some(args) => emit(args),
                None => {
                    entry.on_fulfilled(move |args| emit(args));
                    *self.blocked_console.borrow_mut() = Some(entry);
                }
            }
            return;
        };

        // Keep log order: this entry waits for the one before it.
        let next = Chunk::pending();
        next.on_fulfilled(move |args| emit(args));
        *self.blocked_console.borrow_mut() = Some(next.clone());
        let unblock = {
            let slot = self.blocked_console.clone();
            let session = self.this.clone();
            let next = next.clone();
            move || {
                let is_last = slot.borrow().as_ref().map_or(false, |c| c.ptr_eq(&next));
                if is_last {
                    *slot.borrow_mut() = None;
                }
                resolve_model_chunk(&next, json, &session);
            }
        };
        let unblock = Rc::new(RefCell::new(Some(unblock)));
        let on_reject = unblock.clone();
        previous.then(
            move |_| {
                if let Some(f) = unblock.borrow_mut().take() {
                    f();
                }
            },
            move |_| {
                if let Some(f) = on_reject.borrow_mut().take() {
                    f();
                }
            },
        );
    }

    fn console_emitter(&self) -> Rc<dyn Fn(Value)> {
        match &self.options.on_console {
            Some(on_console) => on_console.clone(),
            None => {
                let environment = self.options.environment_name.clone();
                Rc::new(move |args: Value| {
                    tracing::info!(
                        target: "rowwire::console",
                        environment = %environment,
                        "{}",
                        args.to_json()
                    );
                })
            }
        }
    }

    fn start_readable(&self, id: u32, kind: StreamKind) {
        let (value, sink) = stream::readable_stream(kind, self.this.clone());
        self.start_stream(id, value, sink);
    }

    fn start_iterable(&self, id: u32, single_use: bool) {
        let (value, sink) = stream::async_iterable(single_use, self.this.clone());
        self.start_stream(id, value, sink);
    }

    fn start_stream(&self, id: u32, value: Value, sink: Rc<dyn StreamSink>) {
        match self.existing(id) {
            Some(chunk) => resolve_stream_chunk(&chunk, value, sink),
            None => self.insert(id, Chunk::stream(value, sink)),
        }
    }

    fn close_stream(&self, id: u32, payload: Bytes) {
        let sink = self.existing(id).and_then(|chunk| chunk.sink());
        match sink {
            Some(sink) if payload.is_empty() => sink.close(Bytes::from_static(UNDEFINED_MODEL)),
            Some(sink) => sink.close(payload),
            None => tracing::warn!(id, "close row for a chunk that is not an open stream"),
        }
    }

    fn halt(&self, id: u32) {
        tracing::debug!(id, "chunk halted");
        halt_chunk(&self.get_chunk(id));
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed.get() {
            return;
        }
        let chunks: Vec<Chunk> = self.chunks.get_mut().drain().map(|(_, chunk)| chunk).collect();
        for chunk in chunks {
            fail_outstanding(&chunk, &RowwireError::SessionReleased);
        }
    }
}

fn fail_outstanding(chunk: &Chunk, reason: &RowwireError) {
    match chunk.status() {
        ChunkStatus::Pending | ChunkStatus::Blocked => trigger_error_on_chunk(chunk, reason.clone()),
        ChunkStatus::Fulfilled => {
            if let Some(sink) = chunk.sink() {
                if !sink.is_finished() {
                    sink.error(reason.clone());
                }
            }
        }
        _ => {}
    }
}

fn record_info(table: &RefCell<HashMap<u32, Vec<serde_json::Value>>>, id: u32, payload: &[u8]) {
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(record) => table.borrow_mut().entry(id).or_default().push(record),
        Err(err) => tracing::warn!(id, error = %err, "malformed info row"),
    }
}
