//! # rowwire-client
//!
//! Client-side decoder for a streaming, row-oriented value-transfer
//! protocol.
//!
//! A producer serializes a value graph into rows. Each row carries one
//! piece of the graph under a numeric id; rows may reference each other,
//! arrive out of order, and be split across transport fragments however
//! the network sees fit. This crate reassembles the rows and materializes
//! the graph incrementally, exposing unfinished parts as pending values.
//!
//! ## Architecture
//!
//! - **Framing** ([`protocol`]): row reassembly from binary or text fragments
//! - **Chunks** ([`Chunk`]): one resolution cell per row id
//! - **Materialization**: JSON models with `$`-prefixed references become [`Value`]s
//! - **Streams** ([`stream`]): readable streams and async iterables fed by later rows
//! - **Modules** ([`modules`]): manifest lookup and the loader boundary
//!
//! Sessions are single-threaded (`Rc` based). Drive them from one task,
//! e.g. a current-thread runtime or a `LocalSet`.
//!
//! ## Example
//!
//! ```ignore
//! use rowwire_client::SessionBuilder;
//!
//! let (root, sink) = SessionBuilder::new().build();
//! sink.push_bytes(b"1:\"hello\"\n0:{\"greeting\":\"$1\"}\n")?;
//!
//! let value = root.poll().ready().unwrap();
//! assert_eq!(value.get("greeting").as_str(), Some("hello"));
//! ```

pub mod error;
pub mod modules;
pub mod protocol;
pub mod stream;
pub mod transport;
pub mod value;

mod chunk;
mod client;
mod materialize;
mod resolver;
mod session;

pub use chunk::{Chunk, ChunkPoll, ChunkStatus, Deferred};
pub use client::{
    open, ConsoleCallback, HintCallback, RootHandle, SessionBuilder, SessionOptions,
    DEFAULT_ENVIRONMENT_NAME,
};
pub use error::{RemoteError, Result, RowwireError};
pub use modules::{Manifest, ModuleDescriptor, ModuleLoader, StaticModuleLoader};
pub use session::Session;
pub use transport::{pump, Transport, TransportSink};
pub use value::Value;
