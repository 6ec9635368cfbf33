//! Deferred slot filling for references that point at unfinished chunks.
//!
//! While a model is walked, every reference to a chunk that is not ready
//! yet leaves a placeholder behind and registers a [`Reference`] listener
//! on the target chunk. All references created by one walk share a single
//! [`Handler`], which counts the outstanding dependencies. The owning chunk
//! stays blocked until that count drops to zero, or is rejected as soon as
//! any dependency fails.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::{Rc, Weak};

use crate::chunk::{trigger_error_on_chunk, Chunk, ChunkPoll, ChunkStatus, Listener};
use crate::error::RowwireError;
use crate::materialize::{build, settle_ready, Builder, Built, Continuation};
use crate::session::Session;
use crate::value::{Array, Object, Value};

/// Completion state shared by the references of one model walk.
pub(crate) struct Handler {
    /// The blocked chunk to fulfill once every dependency resolved.
    chunk: RefCell<Option<Chunk>>,
    value: RefCell<Value>,
    reason: RefCell<Option<RowwireError>>,
    deps: Cell<usize>,
    errored: Cell<bool>,
}

impl Handler {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self {
            chunk: RefCell::new(None),
            value: RefCell::new(Value::Null),
            reason: RefCell::new(None),
            deps: Cell::new(0),
            errored: Cell::new(false),
        })
    }

    #[inline]
    pub(crate) fn add_dep(&self) {
        self.deps.set(self.deps.get() + 1);
    }

    #[inline]
    pub(crate) fn deps(&self) -> usize {
        self.deps.get()
    }

    pub(crate) fn value(&self) -> Value {
        self.value.borrow().clone()
    }

    /// First failure seen by any reference, if one occurred.
    pub(crate) fn error(&self) -> Option<RowwireError> {
        if self.errored.get() {
            self.reason.borrow().clone()
        } else {
            None
        }
    }

    fn owns(&self, chunk: &Chunk) -> bool {
        self.chunk
            .borrow()
            .as_ref()
            .map_or(false, |own| own.ptr_eq(chunk))
    }

    /// Park the walked value on a chunk that still has dependencies.
    pub(crate) fn block(&self, chunk: &Chunk, value: Value) {
        {
            let mut current = self.value.borrow_mut();
            // A root-level reference may already have installed the value.
            if !value.is_null() || current.is_null() {
                *current = value;
            }
        }
        *self.chunk.borrow_mut() = Some(chunk.clone());
    }

    /// Mark the walk as failed. Only the first failure is kept.
    pub(crate) fn fail(&self, err: RowwireError) {
        if self.errored.replace(true) {
            return;
        }
        *self.value.borrow_mut() = Value::Null;
        *self.reason.borrow_mut() = Some(err.clone());
        let chunk = self.chunk.borrow().clone();
        if let Some(chunk) = chunk {
            if chunk.status() == ChunkStatus::Blocked {
                trigger_error_on_chunk(&chunk, err);
            }
        }
    }

    /// One dependency resolved. The last one fulfills the blocked chunk.
    pub(crate) fn release(&self) {
        let remaining = self.deps.get().saturating_sub(1);
        self.deps.set(remaining);
        if remaining > 0 {
            return;
        }
        let chunk = self.chunk.borrow().clone();
        if let Some(chunk) = chunk {
            if chunk.status() == ChunkStatus::Blocked {
                chunk.complete(self.value());
            }
        }
    }
}

/// Where a resolved reference gets written.
#[derive(Clone)]
pub(crate) enum Slot {
    /// The top-level value of the chunk being walked.
    Root,
    Array(Array, usize),
    Object(Object, String),
}

impl Slot {
    pub(crate) fn install(&self, handler: &Handler, value: Value) {
        match self {
            Slot::Root => {
                let mut current = handler.value.borrow_mut();
                if current.is_null() {
                    *current = value;
                }
            }
            Slot::Array(array, index) => array.set(*index, value),
            Slot::Object(object, key) if value.is_undefined() => {
                object.remove(key);
            }
            Slot::Object(object, key) => object.insert(key.clone(), value),
        }
    }
}

/// A placeholder waiting for another chunk.
pub(crate) struct Reference {
    pub(crate) session: Weak<Session>,
    pub(crate) handler: Rc<Handler>,
    pub(crate) slot: Slot,
    pub(crate) builder: Builder,
    /// Property keys still to walk once the target is available.
    pub(crate) path: RefCell<Vec<String>>,
}

impl Reference {
    fn wait_on(self: &Rc<Self>, chunk: &Chunk, remaining: &[String]) {
        *self.path.borrow_mut() = remaining.to_vec();
        chunk.add_listener(Listener::Reference(self.clone()));
    }
}

/// The referenced chunk produced `value`: walk the rest of the path, build,
/// and fill the slot.
pub(crate) fn fulfill_reference(reference: &Rc<Reference>, value: Value) {
    let handler = &reference.handler;
    let path = reference.path.borrow().clone();
    let mut value = value;

    for (i, key) in path.iter().enumerate() {
        loop {
            let chunk = match &value {
                Value::Lazy(chunk) => chunk.clone(),
                _ => break,
            };
            if handler.owns(&chunk) {
                value = handler.value();
                continue;
            }
            match chunk.poll() {
                ChunkPoll::Ready(inner) => value = inner,
                ChunkPoll::Failed(err) => {
                    reject_reference(reference, err);
                    return;
                }
                ChunkPoll::Pending => match chunk.status() {
                    ChunkStatus::Blocked => match resolve_blocked_cycle(&chunk, reference) {
                        Some(cyclic) => value = cyclic.value(),
                        None => {
                            reference.wait_on(&chunk, &path[i..]);
                            return;
                        }
                    },
                    ChunkStatus::Pending => {
                        reference.wait_on(&chunk, &path[i..]);
                        return;
                    }
                    // Halted: the slot keeps its placeholder for good.
                    _ => return,
                },
            }
        }
        value = value.get(key);
    }

    while let Value::Lazy(chunk) = &value {
        let chunk = chunk.clone();
        if handler.owns(&chunk) {
            value = handler.value();
            break;
        }
        match chunk.poll() {
            ChunkPoll::Ready(inner) => value = inner,
            _ => break,
        }
    }

    let Some(session) = reference.session.upgrade() else {
        handler.fail(RowwireError::SessionReleased);
        return;
    };
    match build(&session, &reference.builder, value, &reference.slot).and_then(settle_ready) {
        Ok(Built::Ready(value)) => {
            reference.slot.install(handler, value);
            handler.release();
        }
        Ok(Built::Wait(chunk, next)) => {
            wait_built(handler.clone(), reference.slot.clone(), chunk, next)
        }
        Err(err) => handler.fail(err),
    }
}

pub(crate) fn reject_reference(reference: &Reference, err: RowwireError) {
    reference.handler.fail(err);
}

/// Finish a builder that is waiting on another chunk, then fill the slot.
pub(crate) fn wait_built(handler: Rc<Handler>, slot: Slot, chunk: Chunk, next: Continuation) {
    let on_reject = handler.clone();
    chunk.then(
        move |value| match next(value).and_then(settle_ready) {
            Ok(Built::Ready(value)) => {
                slot.install(&handler, value);
                handler.release();
            }
            Ok(Built::Wait(chunk, next)) => wait_built(handler, slot, chunk, next),
            Err(err) => handler.fail(err),
        },
        move |err| on_reject.fail(err),
    );
}

/// Find a handler whose blocked chunk is `target` by following reference
/// listeners from `reference`.
///
/// Such a handler means `reference` ultimately waits on `target` itself,
/// so the partially built value is the best answer there will ever be.
pub(crate) fn resolve_blocked_cycle(target: &Chunk, reference: &Reference) -> Option<Rc<Handler>> {
    let mut visited = HashSet::new();
    find_cycle(target, reference, &mut visited)
}

fn find_cycle(
    target: &Chunk,
    reference: &Reference,
    visited: &mut HashSet<*const Handler>,
) -> Option<Rc<Handler>> {
    let owner = reference.handler.chunk.borrow().clone()?;
    if owner.ptr_eq(target) {
        return Some(reference.handler.clone());
    }
    if !visited.insert(Rc::as_ptr(&reference.handler)) {
        return None;
    }
    owner
        .reference_listeners()
        .iter()
        .find_map(|next| find_cycle(target, next, visited))
}
