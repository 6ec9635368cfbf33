//! Push side of a session and the async read loop.
//!
//! # Example
//!
//! ```ignore
//! use rowwire_client::{transport::pump, SessionBuilder};
//!
//! let (root, sink) = SessionBuilder::new().build();
//! let (read, value) = tokio::join!(pump(&sink, reader), root.value());
//! ```

use std::rc::{Rc, Weak};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, RowwireError};
use crate::session::Session;

/// Bytes requested per read in [`pump`].
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Handle a transport uses to deliver data to its session.
///
/// The sink does not keep the session alive. Once every consumer handle is
/// gone, pushes are dropped and [`is_released`](Self::is_released) reports
/// `true` so the transport can stop reading.
#[derive(Clone)]
pub struct TransportSink {
    session: Weak<Session>,
}

impl TransportSink {
    pub(crate) fn new(session: &Rc<Session>) -> Self {
        Self {
            session: Rc::downgrade(session),
        }
    }

    /// Deliver a binary fragment. Fragments may split rows anywhere.
    ///
    /// # Errors
    ///
    /// Framing violations. The session is closed with the same error.
    pub fn push_bytes(&self, data: &[u8]) -> Result<()> {
        match self.session.upgrade() {
            Some(session) => session.process_bytes(data),
            None => {
                tracing::debug!(len = data.len(), "session released, dropping data");
                Ok(())
            }
        }
    }

    /// Deliver a text fragment holding whole rows.
    ///
    /// # Errors
    ///
    /// Framing violations, including rows split across fragments.
    pub fn push_text(&self, text: &str) -> Result<()> {
        match self.session.upgrade() {
            Some(session) => session.process_text(text),
            None => {
                tracing::debug!(len = text.len(), "session released, dropping text");
                Ok(())
            }
        }
    }

    /// The transport failed: fail everything still outstanding.
    pub fn fail(&self, err: RowwireError) {
        if let Some(session) = self.session.upgrade() {
            session.close(err);
        }
    }

    /// Clean end of data. Anything still outstanding will never arrive.
    pub fn end(&self) {
        self.fail(RowwireError::ConnectionClosed);
    }

    pub fn is_released(&self) -> bool {
        self.session.strong_count() == 0
    }
}

/// Read `reader` to the end, pushing every fragment into `sink`.
///
/// Ends the session on EOF and fails it on a read error. Returns early,
/// without error, if the session is released while reading.
pub async fn pump<R>(sink: &TransportSink, mut reader: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        if sink.is_released() {
            tracing::debug!("session released, stopping read loop");
            return Ok(());
        }
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                sink.end();
                return Ok(());
            }
            Ok(n) => n,
            Err(e) => {
                let err = RowwireError::from(e);
                tracing::error!(error = %err, "transport read failed");
                sink.fail(err.clone());
                return Err(err);
            }
        };
        sink.push_bytes(&buf[..n])?;
    }
}
