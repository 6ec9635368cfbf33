//! Incremental values: readable streams and async iterables.
//!
//! A stream start row installs a stream value on its chunk together with a
//! [`StreamSink`]. Later rows with the same id feed the sink instead of
//! resolving the chunk. Items are delivered in row order even when an item
//! refers to a chunk that has not arrived yet: each item waits for the
//! previous one before it is initialized.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::Notify;

use crate::chunk::{resolve_chunk_value, resolve_model_chunk, trigger_error_on_chunk, Chunk};
use crate::error::{Result, RowwireError};
use crate::session::Session;
use crate::value::{Object, Value};

/// Payload used when a close row carries no value.
pub(crate) const UNDEFINED_MODEL: &[u8] = b"\"$undefined\"";

/// Receiver of the rows that follow a stream start row.
pub(crate) trait StreamSink {
    fn enqueue_value(&self, value: Value);
    fn enqueue_model(&self, json: Bytes);
    fn close(&self, json: Bytes);
    fn error(&self, err: RowwireError);
    fn is_finished(&self) -> bool;
}

/// Stream value carried by [`Value::Stream`].
#[derive(Clone)]
pub enum StreamValue {
    Readable(ReadableStream),
    Iterable(AsyncIterable),
    /// Single-use iterator.
    Iterator(AsyncIterator),
}

impl StreamValue {
    pub fn as_readable(&self) -> Option<&ReadableStream> {
        match self {
            StreamValue::Readable(s) => Some(s),
            _ => None,
        }
    }

    /// A reader over the iterable, or the single-use iterator itself.
    pub fn iterator(&self) -> Option<AsyncIterator> {
        match self {
            StreamValue::Iterable(i) => Some(i.iterator()),
            StreamValue::Iterator(i) => Some(i.clone()),
            StreamValue::Readable(_) => None,
        }
    }
}

impl fmt::Debug for StreamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamValue::Readable(s) => write!(f, "ReadableStream({:?})", s.kind()),
            StreamValue::Iterable(_) => f.write_str("AsyncIterable"),
            StreamValue::Iterator(_) => f.write_str("AsyncIterator"),
        }
    }
}

/// Element type announced by the start row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Values,
    Bytes,
}

/// One step of a non-blocking stream read.
#[derive(Debug, Clone)]
pub enum StreamRead {
    Item(Value),
    Pending,
    Done,
    Failed(RowwireError),
}

/// Consumer side of a readable stream.
#[derive(Clone)]
pub struct ReadableStream(Rc<ReadableInner>);

struct ReadableInner {
    kind: StreamKind,
    state: RefCell<ReadableState>,
    notify: Notify,
}

#[derive(Default)]
struct ReadableState {
    queue: VecDeque<Value>,
    done: bool,
    error: Option<RowwireError>,
}

impl ReadableStream {
    fn new(kind: StreamKind) -> Self {
        Self(Rc::new(ReadableInner {
            kind,
            state: RefCell::new(ReadableState::default()),
            notify: Notify::new(),
        }))
    }

    pub fn kind(&self) -> StreamKind {
        self.0.kind
    }

    /// Next item if one is buffered.
    pub fn try_next(&self) -> StreamRead {
        let mut state = self.0.state.borrow_mut();
        if let Some(err) = &state.error {
            return StreamRead::Failed(err.clone());
        }
        match state.queue.pop_front() {
            Some(item) => StreamRead::Item(item),
            None if state.done => StreamRead::Done,
            None => StreamRead::Pending,
        }
    }

    /// Wait for the next item. `None` once the stream closed.
    pub async fn next(&self) -> Result<Option<Value>> {
        loop {
            match self.try_next() {
                StreamRead::Item(item) => return Ok(Some(item)),
                StreamRead::Done => return Ok(None),
                StreamRead::Failed(err) => return Err(err),
                StreamRead::Pending => self.0.notify.notified().await,
            }
        }
    }

    /// Read every remaining item.
    pub async fn collect(&self) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    /// Closed or errored.
    pub fn is_finished(&self) -> bool {
        let state = self.0.state.borrow();
        state.done || state.error.is_some()
    }

    fn push(&self, item: Value) {
        {
            let mut state = self.0.state.borrow_mut();
            if state.done || state.error.is_some() {
                tracing::debug!("dropping stream item after the stream finished");
                return;
            }
            state.queue.push_back(item);
        }
        self.0.notify.notify_one();
    }

    fn finish(&self) {
        {
            let mut state = self.0.state.borrow_mut();
            if state.done || state.error.is_some() {
                return;
            }
            state.done = true;
        }
        self.0.notify.notify_one();
    }

    fn fail(&self, err: RowwireError) {
        {
            let mut state = self.0.state.borrow_mut();
            if state.done || state.error.is_some() {
                return;
            }
            state.queue.clear();
            state.error = Some(err);
        }
        self.0.notify.notify_one();
    }
}

struct ReadableSink {
    stream: ReadableStream,
    /// Last item that has not been delivered yet. Later items queue behind it.
    previous: Rc<RefCell<Option<Chunk>>>,
    session: Weak<Session>,
    finished: Cell<bool>,
}

impl ReadableSink {
    fn deliver(&self, chunk: &Chunk) {
        let (ok, err) = (self.stream.clone(), self.stream.clone());
        chunk.then(move |item| ok.push(item), move |e| err.fail(e));
    }
}

impl StreamSink for ReadableSink {
    fn enqueue_value(&self, value: Value) {
        let previous = self.previous.borrow().clone();
        match previous {
            None => self.stream.push(value),
            Some(previous) => {
                let stream = self.stream.clone();
                previous.on_fulfilled(move |_| stream.push(value));
            }
        }
    }

    fn enqueue_model(&self, json: Bytes) {
        let previous = self.previous.borrow().clone();
        let Some(previous) = previous else {
            let chunk = Chunk::resolved_model(json, self.session.clone());
            match chunk.poll().ready() {
                Some(item) => self.stream.push(item),
                None => {
                    self.deliver(&chunk);
                    *self.previous.borrow_mut() = Some(chunk);
                }
            }
            return;
        };

        let next = Chunk::pending();
        self.deliver(&next);
        *self.previous.borrow_mut() = Some(next.clone());
        let slot = self.previous.clone();
        let session = self.session.clone();
        previous.on_fulfilled(move |_| {
            let is_last = slot.borrow().as_ref().map_or(false, |c| c.ptr_eq(&next));
            if is_last {
                *slot.borrow_mut() = None;
            }
            resolve_model_chunk(&next, json, &session);
        });
    }

    fn close(&self, _json: Bytes) {
        self.finished.set(true);
        let previous = self.previous.borrow_mut().take();
        match previous {
            None => self.stream.finish(),
            Some(previous) => {
                let stream = self.stream.clone();
                previous.on_fulfilled(move |_| stream.finish());
            }
        }
    }

    fn error(&self, err: RowwireError) {
        self.finished.set(true);
        let previous = self.previous.borrow_mut().take();
        match previous {
            None => self.stream.fail(err),
            Some(previous) => {
                let (a, b) = (self.stream.clone(), self.stream.clone());
                let reason = err.clone();
                previous.then(move |_| a.fail(err), move |_| b.fail(reason));
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.finished.get()
    }
}

/// Open a readable stream: the value to install and the sink for later rows.
pub(crate) fn readable_stream(kind: StreamKind, session: Weak<Session>) -> (Value, Rc<dyn StreamSink>) {
    let stream = ReadableStream::new(kind);
    let sink = ReadableSink {
        stream: stream.clone(),
        previous: Rc::new(RefCell::new(None)),
        session,
        finished: Cell::new(false),
    };
    (Value::Stream(StreamValue::Readable(stream)), Rc::new(sink))
}

/// Async iterable backed by one chunk per `{done, value}` result.
///
/// Every reader sees every item from the start.
#[derive(Clone)]
pub struct AsyncIterable(Rc<IterableInner>);

struct IterableInner {
    state: RefCell<IterableState>,
    session: Weak<Session>,
}

#[derive(Default)]
struct IterableState {
    buffer: Vec<Chunk>,
    closed: bool,
    next_write: usize,
}

impl AsyncIterable {
    fn new(session: Weak<Session>) -> Self {
        Self(Rc::new(IterableInner {
            state: RefCell::new(IterableState::default()),
            session,
        }))
    }

    /// A fresh reader positioned at the first item.
    pub fn iterator(&self) -> AsyncIterator {
        AsyncIterator {
            source: self.clone(),
            next_read: Rc::new(Cell::new(0)),
        }
    }

    fn is_closed(&self) -> bool {
        self.0.state.borrow().closed
    }

    /// Slot for the next written result, created pending if no reader asked yet.
    fn next_slot(&self) -> Chunk {
        let mut state = self.0.state.borrow_mut();
        let index = state.next_write;
        state.next_write += 1;
        match state.buffer.get(index) {
            Some(chunk) => chunk.clone(),
            None => {
                let chunk = Chunk::pending();
                state.buffer.push(chunk.clone());
                chunk
            }
        }
    }
}

/// Reader over an [`AsyncIterable`].
#[derive(Clone)]
pub struct AsyncIterator {
    source: AsyncIterable,
    next_read: Rc<Cell<usize>>,
}

impl AsyncIterator {
    /// Chunk that settles with the next `{done, value}` result.
    pub fn next_chunk(&self) -> Chunk {
        let mut state = self.source.0.state.borrow_mut();
        let index = self.next_read.get();
        if index == state.buffer.len() {
            if state.closed {
                return Chunk::fulfilled(iter_result(true, Value::Undefined));
            }
            state.buffer.push(Chunk::pending());
        }
        self.next_read.set(index + 1);
        state.buffer[index].clone()
    }

    /// Wait for the next item. `None` once the producer finished.
    pub async fn next(&self) -> Result<Option<Value>> {
        let result = self.next_chunk().settled().await?;
        if result.get("done").as_bool() == Some(true) {
            Ok(None)
        } else {
            Ok(Some(result.get("value")))
        }
    }

    /// Read every remaining item.
    pub async fn collect(&self) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }
}

fn iter_result(done: bool, value: Value) -> Value {
    let result = Object::new();
    result.insert("done", Value::Bool(done));
    result.insert("value", value);
    Value::Object(result)
}

/// Wrap a value model in a `{done, value}` result model.
fn iter_result_model(done: bool, json: &[u8]) -> Bytes {
    let head: &[u8] = if done {
        b"{\"done\":true,\"value\":"
    } else {
        b"{\"done\":false,\"value\":"
    };
    let mut out = BytesMut::with_capacity(head.len() + json.len() + 1);
    out.put_slice(head);
    out.put_slice(json);
    out.put_u8(b'}');
    out.freeze()
}

struct IterableSink {
    iterable: AsyncIterable,
}

impl IterableSink {
    fn write_model(&self, done: bool, json: &[u8]) {
        let chunk = self.iterable.next_slot();
        let model = iter_result_model(done, json);
        resolve_model_chunk(&chunk, model, &self.iterable.0.session);
    }
}

impl StreamSink for IterableSink {
    fn enqueue_value(&self, value: Value) {
        if self.iterable.is_closed() {
            tracing::debug!("dropping iterator item after close");
            return;
        }
        let chunk = self.iterable.next_slot();
        resolve_chunk_value(&chunk, iter_result(false, value));
    }

    fn enqueue_model(&self, json: Bytes) {
        if self.iterable.is_closed() {
            tracing::debug!("dropping iterator item after close");
            return;
        }
        self.write_model(false, &json);
    }

    fn close(&self, json: Bytes) {
        if self.iterable.is_closed() {
            return;
        }
        self.iterable.0.state.borrow_mut().closed = true;
        self.write_model(true, &json);
        // Readers that ran ahead of the producer see the end as well.
        loop {
            let outstanding = {
                let state = self.iterable.0.state.borrow();
                state.next_write < state.buffer.len()
            };
            if !outstanding {
                break;
            }
            self.write_model(true, UNDEFINED_MODEL);
        }
    }

    fn error(&self, err: RowwireError) {
        let outstanding = {
            let mut state = self.iterable.0.state.borrow_mut();
            state.closed = true;
            if state.next_write == state.buffer.len() {
                state.buffer.push(Chunk::pending());
            }
            let from = state.next_write;
            state.next_write = state.buffer.len();
            state.buffer[from..].to_vec()
        };
        for chunk in outstanding {
            trigger_error_on_chunk(&chunk, err.clone());
        }
    }

    fn is_finished(&self) -> bool {
        self.iterable.is_closed()
    }
}

/// Open an async iterable. `single_use` installs one iterator instead.
pub(crate) fn async_iterable(single_use: bool, session: Weak<Session>) -> (Value, Rc<dyn StreamSink>) {
    let iterable = AsyncIterable::new(session);
    let value = if single_use {
        StreamValue::Iterator(iterable.iterator())
    } else {
        StreamValue::Iterable(iterable.clone())
    };
    (Value::Stream(value), Rc::new(IterableSink { iterable }))
}
