//! Unix domain socket endpoints.

use super::{ReadOutcome, StreamConnection, StreamListener};
use crate::error::{RelayError, RelayResult};
use futures::FutureExt;
use std::io;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

/// Listening socket bound to a filesystem path.
///
/// The socket file is removed again when the listener is dropped.
#[derive(Debug)]
pub struct UnixStreamListener {
    listener: UnixListener,
    path: PathBuf,
}

impl UnixStreamListener {
    /// Bind `path`, replacing a stale socket file left by an earlier run.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(path: impl AsRef<Path>) -> RelayResult<Self> {
        let path = path.as_ref().to_path_buf();
        let setup_err = |source| RelayError::EndpointSetup {
            path: path.clone(),
            source,
        };

        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(setup_err(e)),
        }

        let listener = UnixListener::bind(&path).map_err(setup_err)?;
        info!(path = %path.display(), "listening");
        Ok(Self { listener, path })
    }

    /// Socket file this listener owns.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StreamListener for UnixStreamListener {
    type Connection = UnixConnection;

    fn try_accept(&mut self) -> io::Result<Option<UnixConnection>> {
        match self.listener.accept().now_or_never() {
            Some(Ok((stream, _addr))) => Ok(Some(UnixConnection { stream })),
            Some(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    fn endpoint(&self) -> String {
        self.path.display().to_string()
    }
}

impl Drop for UnixStreamListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// One accepted producer.
#[derive(Debug)]
pub struct UnixConnection {
    stream: UnixStream,
}

impl StreamConnection for UnixConnection {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        match self.stream.try_read(buf) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::Empty),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    async fn accept_within(listener: &mut UnixStreamListener) -> UnixConnection {
        for _ in 0..200 {
            if let Some(conn) = listener.try_accept().unwrap() {
                return conn;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no connection accepted");
    }

    async fn read_within(conn: &mut UnixConnection, buf: &mut [u8]) -> ReadOutcome {
        for _ in 0..200 {
            match conn.try_read(buf).unwrap() {
                ReadOutcome::Empty => tokio::time::sleep(Duration::from_millis(5)).await,
                other => return other,
            }
        }
        ReadOutcome::Empty
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.socket");
        std::fs::write(&path, b"left over").unwrap();

        let listener = UnixStreamListener::bind(&path).unwrap();
        assert_eq!(listener.path(), path.as_path());
    }

    #[tokio::test]
    async fn bind_into_missing_directory_is_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("x.socket");
        let err = UnixStreamListener::bind(&path).unwrap_err();
        assert!(matches!(err, RelayError::EndpointSetup { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn accept_read_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.socket");
        let mut listener = UnixStreamListener::bind(&path).unwrap();

        assert!(listener.try_accept().unwrap().is_none());

        let mut producer = UnixStream::connect(&path).await.unwrap();
        let mut conn = accept_within(&mut listener).await;

        let mut buf = [0u8; 64];
        assert_eq!(conn.try_read(&mut buf).unwrap(), ReadOutcome::Empty);

        producer.write_all(b"1,2,3\n").await.unwrap();
        assert_eq!(read_within(&mut conn, &mut buf).await, ReadOutcome::Data(6));
        assert_eq!(&buf[..6], b"1,2,3\n");

        drop(producer);
        assert_eq!(read_within(&mut conn, &mut buf).await, ReadOutcome::Closed);
    }

    #[tokio::test]
    async fn drop_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.socket");
        let listener = UnixStreamListener::bind(&path).unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }
}
