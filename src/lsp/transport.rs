//! Framed byte transport over a pair of async byte channels.
//!
//! Framing follows the LSP base protocol: every message is a header block
//! terminated by an empty line, followed by exactly `Content-Length` bytes
//! of body.
//!
//! ```text
//! Content-Length: 52\r\n
//! Content-Type: application/vscode-jsonrpc; charset=utf-8\r\n   (optional)
//! \r\n
//! {"jsonrpc":"2.0","method":"initialized","params":{}}
//! ```
//!
//! Header names are matched case-insensitively and unknown headers are
//! ignored. Bodies are opaque bytes here; decoding JSON-RPC is the
//! session's job.

use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::TransportError;

/// Largest accepted frame body (4 MiB).
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Reads frames from an async byte source.
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: Option<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wraps a byte source.
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(BufReader::new(reader)),
        }
    }

    /// Reads the next frame body.
    ///
    /// Returns `Ok(None)` on EOF between frames.
    ///
    /// ## Errors
    /// - [`TransportError::ReadFailed`] on I/O failure, EOF inside a frame,
    ///   or after [`close`](Self::close)
    /// - [`TransportError::MalformedFrame`] on bad or oversized headers
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| TransportError::ReadFailed("transport is closed".to_string()))?;

        let Some(content_length) = read_headers(reader).await? else {
            return Ok(None);
        };

        if content_length > MAX_FRAME_BYTES {
            return Err(TransportError::MalformedFrame(format!(
                "Content-Length {content_length} exceeds maximum {MAX_FRAME_BYTES}"
            )));
        }

        let mut body = vec![0u8; content_length];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| TransportError::ReadFailed(format!("reading frame body: {e}")))?;

        Ok(Some(body))
    }

    /// Drops the source. Closing twice is a no-op.
    pub fn close(&mut self) {
        self.reader = None;
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.reader.is_none()
    }

    /// Turns the reader into a lazy stream of frames.
    ///
    /// The stream ends at clean EOF. After yielding an error it ends as well;
    /// a broken stream cannot be resynchronized.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<u8>, TransportError>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            match reader.read_frame().await {
                Ok(Some(frame)) => Some((Ok(frame), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

/// Parses headers up to the blank separator line.
///
/// Returns the `Content-Length` value, or `None` on EOF before any header byte.
async fn read_headers<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> Result<Option<usize>, TransportError> {
    let mut content_length: Option<usize> = None;
    let mut line = Vec::new();
    let mut saw_any_header_bytes = false;

    loop {
        line.clear();
        let bytes_read = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| TransportError::ReadFailed(format!("reading header line: {e}")))?;

        if bytes_read == 0 {
            if !saw_any_header_bytes {
                return Ok(None);
            }
            return Err(TransportError::ReadFailed(
                "unexpected EOF while reading headers".to_string(),
            ));
        }
        saw_any_header_bytes = true;

        let text = std::str::from_utf8(&line).map_err(|_| {
            TransportError::MalformedFrame("header line is not valid UTF-8".to_string())
        })?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            break;
        }

        let Some((key, value)) = trimmed.split_once(':') else {
            return Err(TransportError::MalformedFrame(format!(
                "header line without ':' separator: {trimmed:?}"
            )));
        };
        if key.trim().eq_ignore_ascii_case("Content-Length") {
            let len = value.trim().parse::<usize>().map_err(|_| {
                TransportError::MalformedFrame(format!(
                    "invalid Content-Length value: {:?}",
                    value.trim()
                ))
            })?;
            content_length = Some(len);
        }
    }

    content_length
        .map(Some)
        .ok_or_else(|| TransportError::MalformedFrame("missing Content-Length header".to_string()))
}

/// Writes frames to an async byte sink.
#[derive(Debug)]
pub struct FrameWriter<W> {
    writer: Option<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wraps a byte sink.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    /// Writes one frame: header, blank line, body, then flushes.
    ///
    /// ## Errors
    /// [`TransportError::WriteFailed`] on I/O failure or after [`close`](Self::close).
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<(), TransportError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| TransportError::WriteFailed("transport is closed".to_string()))?;

        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        let mut frame = Vec::with_capacity(header.len() + body.len());
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(body);

        writer
            .write_all(&frame)
            .await
            .map_err(|e| TransportError::WriteFailed(format!("writing frame: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::WriteFailed(format!("flushing frame: {e}")))?;
        Ok(())
    }

    /// Shuts down and drops the sink. Closing twice is a no-op.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }
}

/// A bidirectional framed channel over a read half and a write half.
#[derive(Debug)]
pub struct Transport<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
}

impl<R, W> Transport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Wraps the server's stdout (`reader`) and stdin (`writer`).
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        }
    }

    /// Sends one message body.
    ///
    /// ## Errors
    /// [`TransportError::WriteFailed`]
    pub async fn send(&mut self, body: &[u8]) -> Result<(), TransportError> {
        self.writer.write_frame(body).await
    }

    /// Receives the next message body, `None` at EOF.
    ///
    /// ## Errors
    /// [`TransportError::ReadFailed`] or [`TransportError::MalformedFrame`]
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        self.reader.read_frame().await
    }

    /// Closes both directions. Idempotent.
    pub async fn close(&mut self) {
        self.reader.close();
        self.writer.close().await;
    }

    /// Whether the transport has been closed.
    pub fn is_closed(&self) -> bool {
        self.reader.is_closed() && self.writer.is_closed()
    }

    /// Splits into independently owned halves so reading and writing can
    /// run on separate tasks.
    pub fn into_parts(self) -> (FrameReader<R>, FrameWriter<W>) {
        (self.reader, self.writer)
    }
}
