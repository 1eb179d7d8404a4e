//! Replay a recorded stream file into a relay socket.
//!
//! Stands in for a producer during bench testing: the file is written to the
//! socket in fixed-size chunks, optionally paced, and the connection is closed
//! at the end just as a real logger closes after its run.

use crate::error::{RelayError, RelayResult};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::info;

/// Default chunk size, matching the relay's read buffer.
pub const DEFAULT_CHUNK_BYTES: usize = 1024;

/// Pacing for a replay.
#[derive(Debug, Clone, Copy)]
pub struct ReplayOptions {
    /// Largest write, in bytes.
    pub chunk_bytes: usize,
    /// Pause after each chunk.
    pub delay: Duration,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            delay: Duration::ZERO,
        }
    }
}

/// Connect to `socket` and stream `file` into it. Returns the bytes written.
pub async fn replay_file(file: &Path, socket: &Path, options: ReplayOptions) -> RelayResult<u64> {
    let source = tokio::fs::File::open(file).await?;
    let mut stream = UnixStream::connect(socket)
        .await
        .map_err(|source| RelayError::EndpointSetup {
            path: socket.to_path_buf(),
            source,
        })?;
    info!(file = %file.display(), socket = %socket.display(), "replaying");

    let written = copy_chunked(source, &mut stream, options).await?;
    stream.shutdown().await?;
    info!(bytes = written, "replay finished");
    Ok(written)
}

/// Copy `reader` to `writer` in chunks of at most `options.chunk_bytes`.
pub async fn copy_chunked<R, W>(mut reader: R, writer: &mut W, options: ReplayOptions) -> RelayResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; options.chunk_bytes.max(1)];
    let mut written = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        written += n as u64;
        if !options.delay.is_zero() {
            tokio::time::sleep(options.delay).await;
        }
    }
    writer.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_everything_in_bounded_chunks() {
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let mut out = Vec::new();
        let options = ReplayOptions {
            chunk_bytes: 1024,
            ..ReplayOptions::default()
        };
        let written = copy_chunked(&data[..], &mut out, options).await.unwrap();
        assert_eq!(written, 2500);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn writes_one_chunk_at_a_time() {
        let mut socket = tokio_test::io::Builder::new()
            .write(b"ts,v1")
            .write(b",v2\n1")
            .write(b",2,3\n")
            .build();
        let options = ReplayOptions {
            chunk_bytes: 5,
            ..ReplayOptions::default()
        };
        let written = copy_chunked(&b"ts,v1,v2\n1,2,3\n"[..], &mut socket, options)
            .await
            .unwrap();
        assert_eq!(written, 15);
    }

    #[tokio::test]
    async fn missing_socket_is_endpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("run.csv");
        std::fs::write(&file, b"1,2,3\n").unwrap();

        let err = replay_file(&file, &dir.path().join("none.socket"), ReplayOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::EndpointSetup { .. }));
    }
}
