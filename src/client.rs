//! Session builder and the root handle.
//!
//! The [`SessionBuilder`] provides a fluent API for configuring a session.
//! Building it yields:
//! 1. A [`RootHandle`] for the value of row 0
//! 2. A [`TransportSink`] to push protocol data into
//!
//! # Example
//!
//! ```ignore
//! use rowwire_client::{transport::pump, Manifest, SessionBuilder};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (root, sink) = SessionBuilder::new()
//!         .manifest(Manifest::from_json(MANIFEST)?)
//!         .on_remote_call(|id, args| call_server(id, args))
//!         .build();
//!
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:3000").await?;
//!     let (read, value) = tokio::join!(pump(&sink, stream), root.value());
//!     read?;
//!     println!("{:?}", value?);
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::rc::Rc;

use crate::chunk::{Chunk, ChunkPoll, ChunkStatus};
use crate::error::Result;
use crate::modules::{Manifest, ModuleLoader, StaticModuleLoader};
use crate::protocol::DEFAULT_MAX_ROW_LENGTH;
use crate::session::Session;
use crate::transport::{Transport, TransportSink};
use crate::value::{RemoteCall, TemporaryReferenceSet, Value};

/// Default label for errors and logs that do not name their environment.
pub const DEFAULT_ENVIRONMENT_NAME: &str = "Server";

/// Callback receiving replayed console entries.
pub type ConsoleCallback = Rc<dyn Fn(Value)>;

/// Callback receiving resource hints: `(code, model)`.
pub type HintCallback = Rc<dyn Fn(&str, &serde_json::Value)>;

/// Per-session configuration.
#[derive(Clone)]
pub struct SessionOptions {
    /// Invoked when a remote procedure without a loaded target is called.
    pub on_remote_call: Option<RemoteCall>,
    /// Passed to the module loader with every preload.
    pub nonce: Option<String>,
    /// Values that temporary references resolve against.
    pub temporary_references: Option<TemporaryReferenceSet>,
    /// Replay console rows. Default: false
    pub replay_logs: bool,
    /// Default: `"Server"`
    pub environment_name: String,
    /// Receives replayed console entries instead of the log.
    pub on_console: Option<ConsoleCallback>,
    /// Receives resource hints instead of the log.
    pub on_hint: Option<HintCallback>,
    /// Largest line-terminated row accepted. Default: 1 GiB
    pub max_row_length: usize,
    /// Default: an empty [`StaticModuleLoader`]
    pub module_loader: Option<Rc<dyn ModuleLoader>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            on_remote_call: None,
            nonce: None,
            temporary_references: None,
            replay_logs: false,
            environment_name: DEFAULT_ENVIRONMENT_NAME.to_string(),
            on_console: None,
            on_hint: None,
            max_row_length: DEFAULT_MAX_ROW_LENGTH,
            module_loader: None,
        }
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("nonce", &self.nonce)
            .field("replay_logs", &self.replay_logs)
            .field("environment_name", &self.environment_name)
            .field("max_row_length", &self.max_row_length)
            .finish_non_exhaustive()
    }
}

/// Builder for configuring and creating a session.
#[derive(Default)]
pub struct SessionBuilder {
    manifest: Manifest,
    options: SessionOptions,
}

impl SessionBuilder {
    /// Create a builder with an empty manifest and default options.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = manifest;
        self
    }

    /// Replace all options at once.
    pub fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn module_loader(mut self, loader: Rc<dyn ModuleLoader>) -> Self {
        self.options.module_loader = Some(loader);
        self
    }

    /// Set the callback used by remote procedures: `(id, args) -> result`.
    pub fn on_remote_call<F>(mut self, call: F) -> Self
    where
        F: Fn(&str, Vec<Value>) -> Result<Value> + 'static,
    {
        self.options.on_remote_call = Some(Rc::new(call));
        self
    }

    pub fn nonce(mut self, nonce: impl Into<String>) -> Self {
        self.options.nonce = Some(nonce.into());
        self
    }

    pub fn temporary_references(mut self, set: TemporaryReferenceSet) -> Self {
        self.options.temporary_references = Some(set);
        self
    }

    pub fn replay_logs(mut self, enabled: bool) -> Self {
        self.options.replay_logs = enabled;
        self
    }

    pub fn environment_name(mut self, name: impl Into<String>) -> Self {
        self.options.environment_name = name.into();
        self
    }

    pub fn on_console<F>(mut self, callback: F) -> Self
    where
        F: Fn(Value) + 'static,
    {
        self.options.on_console = Some(Rc::new(callback));
        self
    }

    pub fn on_hint<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &serde_json::Value) + 'static,
    {
        self.options.on_hint = Some(Rc::new(callback));
        self
    }

    /// Set the largest line-terminated row accepted.
    ///
    /// Longer rows are a protocol error.
    /// Default: 1 GiB
    pub fn max_row_length(mut self, limit: usize) -> Self {
        self.options.max_row_length = limit;
        self
    }

    /// Create the session. Push data through the returned sink.
    pub fn build(self) -> (RootHandle, TransportSink) {
        let loader: Rc<dyn ModuleLoader> = match &self.options.module_loader {
            Some(loader) => loader.clone(),
            None => Rc::new(StaticModuleLoader::new()),
        };
        let session = Session::new(self.manifest, self.options, loader);
        let sink = TransportSink::new(&session);
        (RootHandle::new(session), sink)
    }

    /// Create the session and attach `transport` to it.
    pub fn open<T: Transport>(self, transport: T) -> RootHandle {
        let (root, sink) = self.build();
        transport.attach(sink);
        root
    }
}

/// Open a session over `transport`.
pub fn open<T: Transport>(transport: T, manifest: Manifest, options: SessionOptions) -> RootHandle {
    SessionBuilder::new()
        .manifest(manifest)
        .options(options)
        .open(transport)
}

/// Consumer handle for the root value (row 0).
///
/// Holding the handle keeps the session alive. Dropping it releases the
/// session: values still outstanding fail with `SessionReleased` and the
/// transport's sink stops accepting data.
pub struct RootHandle {
    session: Rc<Session>,
    root: Chunk,
}

impl RootHandle {
    fn new(session: Rc<Session>) -> Self {
        let root = session.get_chunk(0);
        // Decode the root as soon as its row arrives.
        root.then(|_| {}, |_| {});
        Self { session, root }
    }

    pub fn chunk(&self) -> &Chunk {
        &self.root
    }

    pub fn status(&self) -> ChunkStatus {
        self.root.status()
    }

    /// Root value if it is complete.
    pub fn poll(&self) -> ChunkPoll {
        self.root.poll()
    }

    /// Wait for the root value.
    pub async fn value(&self) -> Result<Value> {
        self.root.settled().await
    }

    pub fn session(&self) -> &Rc<Session> {
        &self.session
    }

    /// Drop the session now.
    pub fn release(self) {
        tracing::debug!("releasing session");
    }
}

impl fmt::Debug for RootHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootHandle")
            .field("status", &self.root.status())
            .finish()
    }
}
