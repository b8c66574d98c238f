//! Bounded in-memory byte pipe between a producer task and a reader.
//!
//! The producer blocks when the pipe is full and the reader blocks when it
//! is empty. Dropping the writer (on success or failure) ends the stream,
//! so a reader never waits on a producer that is gone.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

use super::SourceError;

/// Default pipe capacity in bytes.
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Secondary sink receiving a copy of every byte written to the pipe.
pub type TeeSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Create a pipe holding at most `capacity` unread bytes.
pub fn pipe(capacity: usize) -> (PipeWriter, SourceStream) {
    let (write_half, read_half) = tokio::io::duplex(capacity.max(1));
    let failure = Arc::new(OnceLock::new());
    (
        PipeWriter {
            inner: write_half,
            tee: None,
            failure: Arc::clone(&failure),
        },
        SourceStream {
            inner: read_half,
            failure,
        },
    )
}

/// Producer end of a pipe, optionally tee-ing to a diagnostic sink.
pub struct PipeWriter {
    inner: DuplexStream,
    tee: Option<TeeSink>,
    failure: Arc<OnceLock<String>>,
}

impl PipeWriter {
    pub fn set_tee(&mut self, tee: TeeSink) {
        self.tee = Some(tee);
    }

    pub fn has_tee(&self) -> bool {
        self.tee.is_some()
    }

    /// Write one chunk, waiting while the reader lags behind.
    ///
    /// A failing tee is detached; only primary-stream errors are returned.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        if let Some(tee) = self.tee.as_mut() {
            if let Err(e) = tee.write_all(chunk).await {
                tracing::warn!("Detaching tee sink after write failure: {}", e);
                self.tee = None;
            }
        }

        self.inner.write_all(chunk).await
    }

    /// Record a producer failure for the reader and close the pipe.
    pub async fn fail(self, message: String) {
        let _ = self.failure.set(message);
        self.close().await;
    }

    /// Flush the tee and close the pipe.
    pub async fn close(mut self) {
        if let Some(tee) = self.tee.as_mut() {
            if let Err(e) = tee.shutdown().await {
                tracing::warn!("Failed to close tee sink: {}", e);
            }
        }
        let _ = self.inner.shutdown().await;
    }
}

/// Reader end of a data source pipe.
pub struct SourceStream {
    inner: DuplexStream,
    failure: Arc<OnceLock<String>>,
}

impl SourceStream {
    /// Producer failure, if the producer ended with one.
    ///
    /// Only meaningful once the stream has reached end-of-stream.
    pub fn failure(&self) -> Option<&str> {
        self.failure.get().map(String::as_str)
    }

    /// Drain the stream, reporting a producer failure as an error.
    ///
    /// The writer still blocks whenever the pipe is full, so the producer
    /// never runs more than the pipe's capacity ahead of this loop.
    pub async fn read_all(mut self) -> Result<Vec<u8>, SourceError> {
        let mut bytes = Vec::new();
        self.inner
            .read_to_end(&mut bytes)
            .await
            .map_err(|source| SourceError::Io {
                location: "pipe".to_string(),
                source,
            })?;

        match self.failure() {
            Some(message) => Err(SourceError::Failed(message.to_string())),
            None => Ok(bytes),
        }
    }
}

impl AsyncRead for SourceStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
