//! Newline-delimited JSON framing over a byte stream (the worker's stdio).
//!
//! * [`FrameWriter`]: cloneable, serialises all writes so frames never
//!   interleave; every frame is flushed immediately.
//! * [`FrameReader`]: lazily yields one [`TransportEvent`] per input line.
//!
//! A line longer than [`MAX_LINE_BYTES`] is fatal in either direction: the
//! reader yields [`TransportError::LineTooLong`] once and then ends; the
//! writer refuses the frame and closes itself.  Malformed JSON is *not*
//! fatal: it is reported as [`TransportEvent::ParseError`] and the owner
//! decides what to do with it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// Maximum length of one line, excluding the terminating newline (1 MiB).
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// TransportError / TransportEvent
// ---------------------------------------------------------------------------

/// Fatal transport conditions.  Any of these ends the channel.
#[derive(Debug, Error)]
pub enum TransportError {
    /// An inbound line exceeded the framing limit.
    #[error("inbound line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    /// An outbound frame would exceed the framing limit.
    #[error("outbound frame of {len} bytes exceeds {limit} bytes")]
    FrameTooLong { len: usize, limit: usize },

    /// The writer was closed (oversize frame, broken pipe or shutdown).
    #[error("transport closed")]
    Closed,

    #[error("failed to encode frame: {0}")]
    Encode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One decoded inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A well-formed JSON value.
    Frame(Value),
    /// The line was not valid JSON (or not UTF-8).
    ParseError(String),
}

// ---------------------------------------------------------------------------
// FrameWriter
// ---------------------------------------------------------------------------

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of the transport.  Cheap to clone; all clones share one lock.
#[derive(Clone)]
pub struct FrameWriter {
    inner: Arc<Mutex<BoxedWriter>>,
    closed: Arc<AtomicBool>,
    max_line: usize,
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl FrameWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
            closed: Arc::new(AtomicBool::new(false)),
            max_line: MAX_LINE_BYTES,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Encode `value` as one line and flush it.
    pub async fn send(&self, value: &Value) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut frame =
            serde_json::to_vec(value).map_err(|e| TransportError::Encode(e.to_string()))?;
        if frame.len() > self.max_line {
            log::error!(
                "rpc: refusing {}-byte outbound frame, closing transport",
                frame.len()
            );
            self.close().await;
            return Err(TransportError::FrameTooLong {
                len: frame.len(),
                limit: self.max_line,
            });
        }
        frame.push(b'\n');

        let mut writer = self.inner.lock().await;
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            self.closed.store(true, Ordering::SeqCst);
            return Err(TransportError::Io(e));
        }
        Ok(())
    }

    /// Mark closed and shut the underlying stream down.  Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.inner.lock().await;
        if let Err(e) = writer.shutdown().await {
            log::debug!("rpc: writer shutdown: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// FrameReader
// ---------------------------------------------------------------------------

/// Read half of the transport.  One instance per worker process; it ends
/// for good after EOF or a fatal error.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    max_line: usize,
    done: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_limit(reader, MAX_LINE_BYTES)
    }

    /// Build a reader with a non-default limit (tests).
    pub fn with_limit(reader: R, max_line: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
            max_line,
            done: false,
        }
    }

    /// Next event, `None` once the stream has ended.
    ///
    /// Blank lines are skipped.  A final line without a trailing newline is
    /// still decoded.
    pub async fn next(&mut self) -> Option<Result<TransportEvent, TransportError>> {
        loop {
            if self.done {
                return None;
            }

            self.buf.clear();
            // Room for the limit plus a `\r\n` terminator.
            let limit = self.max_line as u64 + 2;
            let read = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut self.buf)
                .await;

            let n = match read {
                Ok(n) => n,
                Err(e) => {
                    self.done = true;
                    return Some(Err(TransportError::Io(e)));
                }
            };
            if n == 0 {
                self.done = true;
                return None;
            }

            let terminated = self.buf.last() == Some(&b'\n');
            let mut line: &[u8] = &self.buf;
            if terminated {
                line = &line[..line.len() - 1];
            }
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            if (!terminated && n as u64 == limit) || line.len() > self.max_line {
                self.done = true;
                log::error!("rpc: inbound line exceeds {} bytes, closing", self.max_line);
                return Some(Err(TransportError::LineTooLong {
                    limit: self.max_line,
                }));
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let event = match serde_json::from_slice::<Value>(line) {
                Ok(value) => TransportEvent::Frame(value),
                Err(e) => TransportEvent::ParseError(e.to_string()),
            };
            return Some(Ok(event));
        }
    }
}

/// Split a worker's stdio into the two transport halves.
pub fn framed<R, W>(reader: R, writer: W) -> (FrameReader<R>, FrameWriter)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    (FrameReader::new(reader), FrameWriter::new(writer))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
