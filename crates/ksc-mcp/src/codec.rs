//! Newline-delimited JSON framing over a byte stream.
//!
//! Outbound frames are queued to a single writer task that owns the sink, so
//! a frame is always written whole and a caller can stop waiting at any time
//! without leaving half a line on the wire. Inbound lines are bounded; a line
//! that is too long, not UTF-8, or not a valid envelope is reported on its own
//! and the stream carries on.

use crate::error::McpError;
use crate::jsonrpc::Envelope;
use bytes::BytesMut;
use std::io;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

/// Longest inbound line accepted (10 MiB). Tool results can be large.
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Frames allowed to wait for the writer task.
const WRITE_QUEUE: usize = 64;

/// How long `close` lets queued frames drain before aborting the writer.
const CLOSE_GRACE: Duration = Duration::from_millis(200);

type BoxedWrite = Pin<Box<dyn AsyncWrite + Send>>;
type BoxedRead = Pin<Box<dyn AsyncRead + Send>>;

/// The write half of a transport, before its writer task is running.
pub struct FrameSink {
    inner: BoxedWrite,
}

impl FrameSink {
    pub fn new(sink: impl AsyncWrite + Send + 'static) -> Self {
        Self {
            inner: Box::pin(sink),
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await
    }
}

enum Outbound {
    Frame {
        line: Vec<u8>,
        written: oneshot::Sender<io::Result<()>>,
    },
    Shutdown,
}

/// Handle for queueing envelopes to a server's input.
pub struct FrameWriter {
    server: String,
    queue: mpsc::Sender<Outbound>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FrameWriter {
    /// Start the writer task for `sink`.
    ///
    /// `on_failure` runs once, inside the task, when a write fails; frames
    /// queued after that are refused.
    pub fn spawn<F>(server: impl Into<String>, sink: FrameSink, on_failure: F) -> Self
    where
        F: FnOnce(&io::Error) + Send + 'static,
    {
        let server = server.into();
        let (queue, mut rx) = mpsc::channel::<Outbound>(WRITE_QUEUE);
        let name = server.clone();
        let task = tokio::spawn(async move {
            let mut sink = sink;
            while let Some(outbound) = rx.recv().await {
                match outbound {
                    Outbound::Frame { line, written } => {
                        if let Err(e) = sink.write_frame(&line).await {
                            on_failure(&e);
                            let _ = written.send(Err(e));
                            return;
                        }
                        let _ = written.send(Ok(()));
                    }
                    Outbound::Shutdown => break,
                }
            }
            if let Err(e) = sink.inner.shutdown().await {
                tracing::debug!(server = %name, "closing writer: {e}");
            }
        });
        Self {
            server,
            queue,
            task: Mutex::new(Some(task)),
        }
    }

    /// Write one envelope followed by a newline, resolving once it is flushed.
    ///
    /// Dropping the returned future never tears a frame: a frame already
    /// queued is still written in full.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), McpError> {
        let mut line = serde_json::to_vec(envelope)?;
        line.push(b'\n');

        let (written, done) = oneshot::channel();
        self.queue
            .send(Outbound::Frame { line, written })
            .await
            .map_err(|_| self.writer_gone())?;
        match done.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(McpError::Transport {
                server: self.server.clone(),
                source,
            }),
            Err(_) => Err(self.writer_gone()),
        }
    }

    /// Stop the writer, signalling EOF to the peer if the queue drains in
    /// time. Never waits longer than a short grace period.
    pub async fn close(&self) {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(mut task) = task else {
            return;
        };
        if self.queue.try_send(Outbound::Shutdown).is_err() {
            task.abort();
            return;
        }
        if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
            tracing::debug!(server = %self.server, "writer still blocked, aborting it");
            task.abort();
        }
    }

    fn writer_gone(&self) -> McpError {
        McpError::Transport {
            server: self.server.clone(),
            source: io::Error::new(io::ErrorKind::BrokenPipe, "writer stopped"),
        }
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        let task = self.task.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// Line-oriented reader for inbound envelopes.
pub struct FrameReader {
    source: BoxedRead,
    codec: LinesCodec,
    max_line_bytes: usize,
    buf: BytesMut,
}

impl FrameReader {
    pub fn new(source: impl AsyncRead + Send + 'static) -> Self {
        Self::with_max_line_bytes(source, MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(source: impl AsyncRead + Send + 'static, max: usize) -> Self {
        Self {
            source: Box::pin(source),
            codec: LinesCodec::new_with_max_length(max),
            max_line_bytes: max,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Read the next frame.
    ///
    /// - `Ok(Some(Ok(_)))`: one decoded envelope
    /// - `Ok(Some(Err(_)))`: one bad line, already skipped past
    /// - `Ok(None)`: end of stream
    /// - `Err(_)`: the stream itself failed
    pub async fn next_frame(&mut self) -> io::Result<Option<Result<Envelope, McpError>>> {
        loop {
            match self.codec.decode(&mut self.buf) {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Ok(Some(Envelope::from_line(&line)));
                }
                Ok(None) => {}
                Err(e) => return Ok(Some(Err(self.line_error(e)))),
            }

            self.buf.reserve(READ_CHUNK);
            if self.source.read_buf(&mut self.buf).await? == 0 {
                return match self.codec.decode_eof(&mut self.buf) {
                    Ok(Some(line)) if !line.trim().is_empty() => {
                        Ok(Some(Envelope::from_line(&line)))
                    }
                    Ok(_) => Ok(None),
                    Err(e) => Ok(Some(Err(self.line_error(e)))),
                };
            }
        }
    }

    fn line_error(&self, e: LinesCodecError) -> McpError {
        match e {
            LinesCodecError::MaxLineLengthExceeded => McpError::Protocol(format!(
                "line longer than {} bytes discarded",
                self.max_line_bytes
            )),
            LinesCodecError::Io(e) => McpError::Protocol(format!("unreadable line: {e}")),
        }
    }
}
