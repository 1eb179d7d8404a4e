//! In-process stream endpoints.
//!
//! A [`MemoryListener`] is paired with a [`MemoryConnector`]. Each
//! [`MemoryConnector::connect`] queues a connection for the listener and returns
//! the [`MemoryProducer`] that feeds it. Chunks written by the producer are read
//! back in order; dropping or closing the producer ends the stream once the queued
//! chunks are drained.
//!
//! ```
//! use soil_relay::transport::{MemoryListener, ReadOutcome, StreamConnection, StreamListener};
//!
//! let (mut listener, connector) = MemoryListener::new("teros");
//! let producer = connector.connect();
//! producer.write(b"1,0,0.3,20.1,120\n");
//! producer.close();
//!
//! let mut conn = listener.try_accept().unwrap().unwrap();
//! let mut buf = [0u8; 64];
//! assert_eq!(conn.try_read(&mut buf).unwrap(), ReadOutcome::Data(17));
//! assert_eq!(conn.try_read(&mut buf).unwrap(), ReadOutcome::Closed);
//! ```

use super::{ReadOutcome, StreamConnection, StreamListener};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Pipe {
    chunks: VecDeque<Vec<u8>>,
    closed: bool,
}

type SharedPipe = Arc<Mutex<Pipe>>;
type Backlog = Arc<Mutex<VecDeque<MemoryConnection>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Listener side of an in-process endpoint.
#[derive(Debug)]
pub struct MemoryListener {
    name: String,
    backlog: Backlog,
}

impl MemoryListener {
    /// Create a listener and the connector producers use to reach it.
    pub fn new(name: impl Into<String>) -> (Self, MemoryConnector) {
        let backlog = Backlog::default();
        let listener = Self {
            name: name.into(),
            backlog: Arc::clone(&backlog),
        };
        (listener, MemoryConnector { backlog })
    }
}

impl StreamListener for MemoryListener {
    type Connection = MemoryConnection;

    fn try_accept(&mut self) -> io::Result<Option<MemoryConnection>> {
        Ok(lock(&self.backlog).pop_front())
    }

    fn endpoint(&self) -> String {
        format!("memory:{}", self.name)
    }
}

/// Cloneable handle producers use to open connections.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    backlog: Backlog,
}

impl MemoryConnector {
    /// Queue a new connection and return its writing end.
    pub fn connect(&self) -> MemoryProducer {
        let pipe = SharedPipe::default();
        lock(&self.backlog).push_back(MemoryConnection {
            pipe: Arc::clone(&pipe),
        });
        MemoryProducer { pipe }
    }

    /// Connections queued but not yet accepted.
    pub fn pending(&self) -> usize {
        lock(&self.backlog).len()
    }
}

/// Writing end of one in-process connection. Closes the stream on drop.
#[derive(Debug)]
pub struct MemoryProducer {
    pipe: SharedPipe,
}

impl MemoryProducer {
    /// Queue one chunk. Each chunk is delivered by at most as many reads as the
    /// reader's buffer requires.
    pub fn write(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let mut pipe = lock(&self.pipe);
        if !pipe.closed {
            pipe.chunks.push_back(chunk.to_vec());
        }
    }

    /// End the stream once queued chunks are drained.
    pub fn close(&self) {
        lock(&self.pipe).closed = true;
    }

    /// Chunks not yet read.
    pub fn queued(&self) -> usize {
        lock(&self.pipe).chunks.len()
    }
}

impl Drop for MemoryProducer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reading end of one in-process connection.
#[derive(Debug)]
pub struct MemoryConnection {
    pipe: SharedPipe,
}

impl StreamConnection for MemoryConnection {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let mut guard = lock(&self.pipe);
        let pipe = &mut *guard;
        let Some(front) = pipe.chunks.front_mut() else {
            return Ok(if pipe.closed {
                ReadOutcome::Closed
            } else {
                ReadOutcome::Empty
            });
        };

        let n = front.len().min(buf.len());
        buf[..n].copy_from_slice(&front[..n]);
        if n == front.len() {
            pipe.chunks.pop_front();
        } else {
            front.drain(..n);
        }
        Ok(ReadOutcome::Data(n))
    }
}
