//! Callable references: remote procedures and native functions.
//!
//! A [`ServerReference`] stands for a procedure that lives on the server.
//! Calling it forwards the id and arguments to the session's
//! `on_remote_call` callback, unless the reference was resolved through a
//! server map, in which case the loaded module export is invoked directly.
//!
//! # Example
//!
//! ```ignore
//! let action = value.get("action");
//! if let Value::ServerReference(action) = action {
//!     let bound = action.bind(vec![Value::from("first")]);
//!     let result = bound.call(vec![Value::from("second")]).await?;
//! }
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use super::Value;
use crate::error::{Result, RowwireError};

/// Callback that performs a remote procedure call: `(id, args) -> result`.
pub type RemoteCall = Rc<dyn Fn(&str, Vec<Value>) -> Result<Value>>;

/// Native function value.
#[derive(Clone)]
pub struct Callable(Rc<dyn Fn(Vec<Value>) -> Result<Value>>);

impl Callable {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value> + 'static,
    {
        Self(Rc::new(f))
    }

    pub fn call(&self, args: Vec<Value>) -> Result<Value> {
        (self.0)(args)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callable")
    }
}

/// Proxy for a procedure hosted by the producer.
#[derive(Clone)]
pub struct ServerReference {
    id: Rc<str>,
    /// Bound arguments from the wire: an array or a promise of one.
    bound: Option<Value>,
    /// Arguments added locally with `bind`.
    extra: Vec<Value>,
    /// Loaded export when resolved through a server map.
    target: Option<Value>,
    caller: Option<RemoteCall>,
}

impl ServerReference {
    pub(crate) fn new(
        id: &str,
        bound: Option<Value>,
        target: Option<Value>,
        caller: Option<RemoteCall>,
    ) -> Self {
        Self {
            id: Rc::from(id),
            bound,
            extra: Vec::new(),
            target,
            caller,
        }
    }

    /// Procedure id as sent by the producer.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Loaded module export, when resolved through a server map.
    pub fn target(&self) -> Option<&Value> {
        self.target.as_ref()
    }

    /// All bound arguments, waiting for them if they are still in flight.
    pub async fn bound_args(&self) -> Result<Vec<Value>> {
        let mut args = match &self.bound {
            None | Some(Value::Null) | Some(Value::Undefined) => Vec::new(),
            Some(Value::Array(a)) => a.to_vec(),
            Some(Value::Promise(chunk)) | Some(Value::Lazy(chunk)) => {
                match chunk.settled().await? {
                    Value::Array(a) => a.to_vec(),
                    other => {
                        return Err(RowwireError::Unsupported(format!(
                            "Bound arguments must be an array, got {}",
                            other.type_name()
                        )))
                    }
                }
            }
            Some(other) => {
                return Err(RowwireError::Unsupported(format!(
                    "Bound arguments must be an array, got {}",
                    other.type_name()
                )))
            }
        };
        args.extend(self.extra.iter().cloned());
        Ok(args)
    }

    /// Invoke the procedure with the bound arguments followed by `args`.
    ///
    /// # Errors
    ///
    /// `MissingRemoteCall` when neither a loaded export nor an
    /// `on_remote_call` callback is available.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        let mut all = self.bound_args().await?;
        all.extend(args);
        match (&self.target, &self.caller) {
            (Some(Value::Callable(f)), _) => f.call(all),
            (Some(other), _) => Err(RowwireError::Unsupported(format!(
                "Server reference \"{}\" resolved to a {}, which is not callable",
                self.id,
                other.type_name()
            ))),
            (None, Some(caller)) => caller(&*self.id, all),
            (None, None) => Err(RowwireError::MissingRemoteCall(self.id.to_string())),
        }
    }

    /// New reference with `args` appended to the bound arguments.
    pub fn bind(&self, args: Vec<Value>) -> ServerReference {
        let mut next = self.clone();
        next.extra.extend(args);
        next
    }
}

impl fmt::Debug for ServerReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerReference")
            .field("id", &self.id)
            .field("bound", &self.bound)
            .field("extra", &self.extra)
            .finish()
    }
}

/// Values the caller sent along with a reply, addressed by key.
///
/// The set is shared: the caller keeps a clone and the session reads from it.
#[derive(Clone, Default)]
pub struct TemporaryReferenceSet(Rc<RefCell<HashMap<String, Value>>>);

impl TemporaryReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.0.borrow_mut().insert(key.into(), value);
    }

    /// Value stored under `key`, `Undefined` when missing.
    pub fn get(&self, key: &str) -> Value {
        self.0.borrow().get(key).cloned().unwrap_or(Value::Undefined)
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn recording_caller(seen: Rc<RefCell<Vec<(String, usize)>>>) -> RemoteCall {
        Rc::new(move |id: &str, args: Vec<Value>| -> Result<Value> {
            seen.borrow_mut().push((id.to_string(), args.len()));
            Ok(Value::from(args.len() as f64))
        })
    }

    #[tokio::test]
    async fn test_call_forwards_bound_and_args() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let bound = Value::from(vec![Value::from("a")]);
        let reference =
            ServerReference::new("act#1", Some(bound), None, Some(recording_caller(seen.clone())));

        let result = reference.call(vec![Value::from("b")]).await.unwrap();

        assert_eq!(result.as_f64(), Some(2.0));
        assert_eq!(seen.borrow()[0], ("act#1".to_string(), 2));
    }

    #[tokio::test]
    async fn test_bind_appends_arguments() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let reference = ServerReference::new("x", None, None, Some(recording_caller(seen.clone())));
        let bound = reference.bind(vec![Value::Null, Value::Null]);

        assert_eq!(bound.bound_args().await.unwrap().len(), 2);
        assert!(reference.bound_args().await.unwrap().is_empty());

        bound.call(vec![Value::Null]).await.unwrap();
        assert_eq!(seen.borrow()[0].1, 3);
    }

    #[tokio::test]
    async fn test_call_without_caller() {
        let reference = ServerReference::new("missing", None, None, None);
        let err = reference.call(Vec::new()).await.unwrap_err();
        assert!(matches!(err, RowwireError::MissingRemoteCall(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_call_uses_loaded_target() {
        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        let target = Value::Callable(Callable::new(move |args| {
            counter.set(counter.get() + 1);
            Ok(Value::from(args.len() as f64))
        }));
        let reference = ServerReference::new("mod#fn", None, Some(target), None);

        let result = reference.call(vec![Value::Null]).await.unwrap();
        assert_eq!(result.as_f64(), Some(1.0));
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_temporary_reference_set() {
        let set = TemporaryReferenceSet::new();
        set.insert("$1", Value::from("held"));
        let shared = set.clone();
        assert_eq!(shared.get("$1").as_str(), Some("held"));
        assert!(shared.get("$2").is_undefined());
    }
}
