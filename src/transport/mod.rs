//! Transport module - the boundary between a byte source and a session.
//!
//! Provides:
//! - [`Transport`]: anything that can be attached to a session's sink
//! - [`TransportSink`]: the push side handed to a transport
//! - [`pump`]: drive a sink from any `AsyncRead`

mod sink;

pub use sink::{pump, TransportSink, READ_BUFFER_SIZE};

/// A source of protocol data.
///
/// `attach` receives the sink to push fragments into. It may push
/// synchronously, or keep the sink and push later from an event loop.
pub trait Transport {
    fn attach(self, sink: TransportSink);
}

impl<F> Transport for F
where
    F: FnOnce(TransportSink),
{
    fn attach(self, sink: TransportSink) {
        self(sink)
    }
}
