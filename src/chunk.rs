//! Chunk cells: the unit of incremental resolution.
//!
//! Every row id maps to one [`Chunk`]. A chunk moves through these states:
//!
//! ```text
//! pending ──model row──▶ resolved_model ──initialize──▶ blocked ──▶ fulfilled
//!    │                                         │                       ▲
//!    ├──module row──▶ resolved_module ─────────┴───────────────────────┘
//!    ├──error row / close──────────────────────────────────▶ rejected
//!    └──empty model row────────────────────────────────────▶ halted
//! ```
//!
//! Resolved models are decoded lazily: the JSON text is only walked the
//! first time somebody reads or subscribes to the chunk.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{Result, RowwireError};
use crate::materialize::Walker;
use crate::modules::ModuleDescriptor;
use crate::resolver::{fulfill_reference, reject_reference, resolve_blocked_cycle, Reference};
use crate::session::Session;
use crate::stream::StreamSink;
use crate::value::Value;

pub(crate) type FulfillFn = Box<dyn FnOnce(Value)>;
pub(crate) type RejectFn = Box<dyn FnOnce(RowwireError)>;

/// Subscriber waiting on a chunk.
pub(crate) enum Listener {
    Callback {
        on_fulfill: Option<FulfillFn>,
        on_reject: Option<RejectFn>,
    },
    /// A slot elsewhere in the graph that will be filled with this value.
    Reference(Rc<Reference>),
}

pub(crate) enum ChunkState {
    Pending(Vec<Listener>),
    Blocked(Vec<Listener>),
    ResolvedModel {
        json: Bytes,
        session: Weak<Session>,
    },
    ResolvedModule {
        module: ModuleDescriptor,
        session: Weak<Session>,
    },
    Fulfilled {
        value: Value,
        /// Present when the chunk is an open stream that accepts more rows.
        sink: Option<Rc<dyn StreamSink>>,
    },
    Rejected(RowwireError),
    Halted,
}

/// Observable chunk state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    Blocked,
    ResolvedModel,
    ResolvedModule,
    Fulfilled,
    Rejected,
    Halted,
}

/// Result of a non-blocking read.
#[derive(Debug, Clone)]
pub enum ChunkPoll {
    Ready(Value),
    /// Not available yet (pending, blocked or halted).
    Pending,
    Failed(RowwireError),
}

impl ChunkPoll {
    pub fn is_ready(&self) -> bool {
        matches!(self, ChunkPoll::Ready(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ChunkPoll::Pending)
    }

    /// The ready value, if any.
    pub fn ready(self) -> Option<Value> {
        match self {
            ChunkPoll::Ready(v) => Some(v),
            _ => None,
        }
    }
}

/// Shared handle to one chunk cell.
#[derive(Clone)]
pub struct Chunk(Rc<RefCell<ChunkState>>);

impl Chunk {
    fn from_state(state: ChunkState) -> Self {
        Self(Rc::new(RefCell::new(state)))
    }

    pub(crate) fn pending() -> Self {
        Self::from_state(ChunkState::Pending(Vec::new()))
    }

    pub(crate) fn blocked() -> Self {
        Self::from_state(ChunkState::Blocked(Vec::new()))
    }

    pub(crate) fn fulfilled(value: Value) -> Self {
        Self::from_state(ChunkState::Fulfilled { value, sink: None })
    }

    pub(crate) fn stream(value: Value, sink: Rc<dyn StreamSink>) -> Self {
        Self::from_state(ChunkState::Fulfilled {
            value,
            sink: Some(sink),
        })
    }

    pub(crate) fn rejected(err: RowwireError) -> Self {
        Self::from_state(ChunkState::Rejected(err))
    }

    pub(crate) fn resolved_model(json: Bytes, session: Weak<Session>) -> Self {
        Self::from_state(ChunkState::ResolvedModel { json, session })
    }

    pub(crate) fn resolved_module(module: ModuleDescriptor, session: Weak<Session>) -> Self {
        Self::from_state(ChunkState::ResolvedModule { module, session })
    }

    pub fn status(&self) -> ChunkStatus {
        match &*self.0.borrow() {
            ChunkState::Pending(_) => ChunkStatus::Pending,
            ChunkState::Blocked(_) => ChunkStatus::Blocked,
            ChunkState::ResolvedModel { .. } => ChunkStatus::ResolvedModel,
            ChunkState::ResolvedModule { .. } => ChunkStatus::ResolvedModule,
            ChunkState::Fulfilled { .. } => ChunkStatus::Fulfilled,
            ChunkState::Rejected(_) => ChunkStatus::Rejected,
            ChunkState::Halted => ChunkStatus::Halted,
        }
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Chunk) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Decode a resolved model or module, if the chunk holds one.
    pub(crate) fn initialize(&self) {
        match self.status() {
            ChunkStatus::ResolvedModel => initialize_model_chunk(self),
            ChunkStatus::ResolvedModule => initialize_module_chunk(self),
            _ => {}
        }
    }

    /// Read without blocking, initializing the chunk first if needed.
    pub fn poll(&self) -> ChunkPoll {
        self.initialize();
        match &*self.0.borrow() {
            ChunkState::Fulfilled { value, .. } => ChunkPoll::Ready(value.clone()),
            ChunkState::Rejected(err) => ChunkPoll::Failed(err.clone()),
            _ => ChunkPoll::Pending,
        }
    }

    /// Fulfilled value, without triggering initialization.
    pub fn fulfilled_value(&self) -> Option<Value> {
        match &*self.0.borrow() {
            ChunkState::Fulfilled { value, .. } => Some(value.clone()),
            _ => None,
        }
    }

    /// Rejection reason, without triggering initialization.
    pub fn rejection(&self) -> Option<RowwireError> {
        match &*self.0.borrow() {
            ChunkState::Rejected(err) => Some(err.clone()),
            _ => None,
        }
    }

    pub(crate) fn sink(&self) -> Option<Rc<dyn StreamSink>> {
        match &*self.0.borrow() {
            ChunkState::Fulfilled { sink, .. } => sink.clone(),
            _ => None,
        }
    }

    /// Subscribe to the outcome.
    ///
    /// A settled chunk calls back immediately. A halted chunk never does.
    pub fn then<F, R>(&self, on_fulfill: F, on_reject: R)
    where
        F: FnOnce(Value) + 'static,
        R: FnOnce(RowwireError) + 'static,
    {
        self.subscribe(Some(Box::new(on_fulfill)), Some(Box::new(on_reject)));
    }

    /// Subscribe to fulfillment only.
    pub(crate) fn on_fulfilled<F>(&self, on_fulfill: F)
    where
        F: FnOnce(Value) + 'static,
    {
        self.subscribe(Some(Box::new(on_fulfill)), None);
    }

    fn subscribe(&self, on_fulfill: Option<FulfillFn>, on_reject: Option<RejectFn>) {
        self.initialize();
        let settled = {
            let mut state = self.0.borrow_mut();
            match &mut *state {
                ChunkState::Pending(listeners) | ChunkState::Blocked(listeners) => {
                    listeners.push(Listener::Callback {
                        on_fulfill,
                        on_reject,
                    });
                    return;
                }
                ChunkState::Fulfilled { value, .. } => Ok(value.clone()),
                ChunkState::Rejected(err) => Err(err.clone()),
                _ => return,
            }
        };
        match settled {
            Ok(value) => {
                if let Some(f) = on_fulfill {
                    f(value);
                }
            }
            Err(err) => {
                if let Some(r) = on_reject {
                    r(err);
                }
            }
        }
    }

    /// Wait for the chunk to settle.
    ///
    /// # Errors
    ///
    /// The rejection reason; `Incomplete` if the chunk was halted, and
    /// `SessionReleased` if the session went away while waiting.
    pub async fn settled(&self) -> Result<Value> {
        let (tx, rx) = oneshot::channel::<Result<Value>>();
        let tx = Rc::new(RefCell::new(Some(tx)));
        let on_reject = tx.clone();
        self.then(
            move |value| {
                if let Some(tx) = tx.borrow_mut().take() {
                    let _ = tx.send(Ok(value));
                }
            },
            move |err| {
                if let Some(tx) = on_reject.borrow_mut().take() {
                    let _ = tx.send(Err(err));
                }
            },
        );
        match rx.await {
            Ok(result) => result,
            Err(_) if self.status() == ChunkStatus::Halted => Err(RowwireError::Incomplete),
            Err(_) => Err(RowwireError::SessionReleased),
        }
    }

    /// Register a reference listener. Settled chunks ignore it.
    pub(crate) fn add_listener(&self, listener: Listener) {
        if let ChunkState::Pending(listeners) | ChunkState::Blocked(listeners) =
            &mut *self.0.borrow_mut()
        {
            listeners.push(listener);
        }
    }

    pub(crate) fn take_listeners(&self) -> Vec<Listener> {
        match &mut *self.0.borrow_mut() {
            ChunkState::Pending(listeners) | ChunkState::Blocked(listeners) => {
                std::mem::take(listeners)
            }
            _ => Vec::new(),
        }
    }

    /// Reference listeners currently waiting, for cycle detection.
    pub(crate) fn reference_listeners(&self) -> Vec<Rc<Reference>> {
        match &*self.0.borrow() {
            ChunkState::Pending(listeners) | ChunkState::Blocked(listeners) => listeners
                .iter()
                .filter_map(|l| match l {
                    Listener::Reference(r) => Some(r.clone()),
                    Listener::Callback { .. } => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn replace_state(&self, state: ChunkState) -> ChunkState {
        std::mem::replace(&mut *self.0.borrow_mut(), state)
    }

    /// Move a pending chunk to blocked, keeping its listeners.
    pub(crate) fn block(&self) {
        let mut state = self.0.borrow_mut();
        if let ChunkState::Pending(listeners) = &mut *state {
            let listeners = std::mem::take(listeners);
            *state = ChunkState::Blocked(listeners);
        }
    }

    /// Fulfill a pending or blocked chunk and wake its listeners.
    pub(crate) fn complete(&self, value: Value) {
        match self.replace_state(ChunkState::Fulfilled {
            value: value.clone(),
            sink: None,
        }) {
            ChunkState::Pending(listeners) | ChunkState::Blocked(listeners) => {
                wake_chunk(listeners, &value)
            }
            previous => {
                self.replace_state(previous);
            }
        }
    }

    /// Reject a pending or blocked chunk and reject its listeners.
    pub(crate) fn fail(&self, err: RowwireError) {
        match self.replace_state(ChunkState::Rejected(err.clone())) {
            ChunkState::Pending(listeners) | ChunkState::Blocked(listeners) => {
                reject_chunk(listeners, &err)
            }
            previous => {
                self.replace_state(previous);
            }
        }
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk({:?})", self.status())
    }
}

/// Externally settled chunk, handed out by module loaders.
#[derive(Debug, Clone)]
pub struct Deferred {
    chunk: Chunk,
}

impl Deferred {
    pub fn new() -> Self {
        Self {
            chunk: Chunk::pending(),
        }
    }

    /// Already settled with `value`.
    pub fn resolved(value: Value) -> Self {
        Self {
            chunk: Chunk::fulfilled(value),
        }
    }

    pub fn rejected(err: RowwireError) -> Self {
        Self {
            chunk: Chunk::rejected(err),
        }
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn resolve(&self, value: Value) {
        resolve_chunk_value(&self.chunk, value);
    }

    pub fn reject(&self, err: RowwireError) {
        trigger_error_on_chunk(&self.chunk, err);
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self.chunk.status(),
            ChunkStatus::Fulfilled | ChunkStatus::Rejected
        )
    }
}

impl Default for Deferred {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn wake_chunk(listeners: Vec<Listener>, value: &Value) {
    for listener in listeners {
        match listener {
            Listener::Callback { on_fulfill, .. } => {
                if let Some(f) = on_fulfill {
                    f(value.clone());
                }
            }
            Listener::Reference(reference) => fulfill_reference(&reference, value.clone()),
        }
    }
}

pub(crate) fn reject_chunk(listeners: Vec<Listener>, err: &RowwireError) {
    for listener in listeners {
        match listener {
            Listener::Callback { on_reject, .. } => {
                if let Some(r) = on_reject {
                    r(err.clone());
                }
            }
            Listener::Reference(reference) => reject_reference(&reference, err.clone()),
        }
    }
}

/// Hand `listeners` to `chunk` according to its current state.
fn deliver(chunk: &Chunk, listeners: Vec<Listener>) {
    if listeners.is_empty() {
        return;
    }
    let settled = {
        let mut state = chunk.0.borrow_mut();
        match &mut *state {
            ChunkState::Pending(existing) | ChunkState::Blocked(existing) => {
                existing.extend(listeners);
                return;
            }
            ChunkState::Fulfilled { value, .. } => Ok(value.clone()),
            ChunkState::Rejected(err) => Err(err.clone()),
            _ => return,
        }
    };
    match settled {
        Ok(value) => wake_chunk(listeners, &value),
        Err(err) => reject_chunk(listeners, &err),
    }
}

/// Deliver listeners that were waiting before `chunk` was initialized.
///
/// While the chunk is blocked, reference listeners that form a cycle back
/// to it are fulfilled right away with the partially built value.
pub(crate) fn wake_chunk_if_initialized(chunk: &Chunk, listeners: Vec<Listener>) {
    if chunk.status() != ChunkStatus::Blocked {
        deliver(chunk, listeners);
        return;
    }
    let mut waiting = Vec::with_capacity(listeners.len());
    for listener in listeners {
        if let Listener::Reference(reference) = &listener {
            if let Some(cyclic) = resolve_blocked_cycle(chunk, reference) {
                fulfill_reference(reference, cyclic.value());
                continue;
            }
        }
        waiting.push(listener);
    }
    deliver(chunk, waiting);
}

/// Reject a chunk that has not settled, or error the stream it carries.
pub(crate) fn trigger_error_on_chunk(chunk: &Chunk, err: RowwireError) {
    match chunk.status() {
        ChunkStatus::Pending | ChunkStatus::Blocked => chunk.fail(err),
        ChunkStatus::Fulfilled => match chunk.sink() {
            Some(sink) => sink.error(err),
            None => tracing::debug!(error = %err, "ignoring error for a settled chunk"),
        },
        status => tracing::debug!(?status, error = %err, "ignoring error for a settled chunk"),
    }
}

/// Store a model row on `chunk`, or feed it to the chunk's open stream.
pub(crate) fn resolve_model_chunk(chunk: &Chunk, json: Bytes, session: &Weak<Session>) {
    if chunk.status() != ChunkStatus::Pending {
        match chunk.sink() {
            Some(sink) => sink.enqueue_model(json),
            None => tracing::warn!(status = ?chunk.status(), "model row for a chunk that already settled"),
        }
        return;
    }
    let listeners = match chunk.replace_state(ChunkState::ResolvedModel {
        json,
        session: session.clone(),
    }) {
        ChunkState::Pending(listeners) => listeners,
        _ => Vec::new(),
    };
    if !listeners.is_empty() {
        initialize_model_chunk(chunk);
        wake_chunk_if_initialized(chunk, listeners);
    }
}

/// Store a loaded module reference on a pending or blocked chunk.
pub(crate) fn resolve_module_chunk(chunk: &Chunk, module: ModuleDescriptor, session: &Weak<Session>) {
    if !matches!(chunk.status(), ChunkStatus::Pending | ChunkStatus::Blocked) {
        tracing::warn!(specifier = %module.specifier, "module row for a chunk that already settled");
        return;
    }
    let listeners = match chunk.replace_state(ChunkState::ResolvedModule {
        module,
        session: session.clone(),
    }) {
        ChunkState::Pending(listeners) | ChunkState::Blocked(listeners) => listeners,
        _ => Vec::new(),
    };
    if !listeners.is_empty() {
        initialize_module_chunk(chunk);
        wake_chunk_if_initialized(chunk, listeners);
    }
}

/// Fulfill a pending or blocked chunk with a ready value.
///
/// Returns `false` when the chunk had already moved on.
pub(crate) fn resolve_chunk_value(chunk: &Chunk, value: Value) -> bool {
    match chunk.status() {
        ChunkStatus::Pending | ChunkStatus::Blocked => {
            chunk.complete(value);
            true
        }
        _ => false,
    }
}

/// Install an open stream on a pending chunk.
pub(crate) fn resolve_stream_chunk(chunk: &Chunk, value: Value, sink: Rc<dyn StreamSink>) {
    match chunk.replace_state(ChunkState::Fulfilled {
        value: value.clone(),
        sink: Some(sink),
    }) {
        ChunkState::Pending(listeners) => wake_chunk(listeners, &value),
        previous => {
            tracing::warn!("stream row for a chunk that already settled");
            chunk.replace_state(previous);
        }
    }
}

/// Mark a chunk as never completing. Its listeners are dropped.
pub(crate) fn halt_chunk(chunk: &Chunk) {
    if matches!(chunk.status(), ChunkStatus::Pending | ChunkStatus::Blocked) {
        let dropped = chunk.replace_state(ChunkState::Halted);
        drop(dropped);
    }
}

fn initialize_model_chunk(chunk: &Chunk) {
    let (json, session) = match chunk.replace_state(ChunkState::Blocked(Vec::new())) {
        ChunkState::ResolvedModel { json, session } => (json, session),
        other => {
            chunk.replace_state(other);
            return;
        }
    };
    let Some(session) = session.upgrade() else {
        chunk.fail(RowwireError::SessionReleased);
        return;
    };

    let mut walker = Walker::new(&session);
    let value = match walker.parse(&json) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(error = %err, "model failed to decode");
            chunk.fail(err);
            return;
        }
    };

    // Listeners added during the walk point back into this chunk.
    wake_chunk(chunk.take_listeners(), &value);

    if let Some(handler) = walker.into_handler() {
        if let Some(err) = handler.error() {
            chunk.fail(err);
            return;
        }
        if handler.deps() > 0 {
            handler.block(chunk, value);
            return;
        }
    }
    chunk.complete(value);
}

fn initialize_module_chunk(chunk: &Chunk) {
    let (module, session) = match chunk.replace_state(ChunkState::Blocked(Vec::new())) {
        ChunkState::ResolvedModule { module, session } => (module, session),
        other => {
            chunk.replace_state(other);
            return;
        }
    };
    let loaded = session
        .upgrade()
        .ok_or(RowwireError::SessionReleased)
        .and_then(|session| session.require_module(&module));
    match loaded {
        Ok(value) => chunk.complete(value),
        Err(err) => {
            tracing::debug!(specifier = %module.specifier, error = %err, "module failed to load");
            chunk.fail(err);
        }
    }
}
