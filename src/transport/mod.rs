//! Local stream endpoints.
//!
//! Both producers reach the relay over a local stream transport. The relay only
//! ever polls: [`StreamListener::try_accept`] and [`StreamConnection::try_read`]
//! return immediately, and "nothing yet" is an ordinary outcome rather than an
//! error.
//!
//! - [`unix`]: Unix domain sockets, used in production.
//! - [`memory`]: scripted in-process endpoints for tests and dry runs.

pub mod memory;
pub mod unix;

use std::io;

pub use memory::{MemoryConnection, MemoryConnector, MemoryListener, MemoryProducer};
pub use unix::{UnixConnection, UnixStreamListener};

/// Result of one non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were copied into the buffer.
    Data(usize),
    /// Nothing available this tick.
    Empty,
    /// The producer closed its end.
    Closed,
}

/// An accepted producer connection.
pub trait StreamConnection: Send {
    /// Read whatever is available without waiting.
    ///
    /// `buf` must not be empty.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome>;
}

/// A named endpoint producers connect to.
pub trait StreamListener: Send {
    /// Connection type handed out by this listener.
    type Connection: StreamConnection;

    /// Accept a pending connection, if any, without waiting.
    fn try_accept(&mut self) -> io::Result<Option<Self::Connection>>;

    /// Human-readable endpoint name for logs.
    fn endpoint(&self) -> String;
}
