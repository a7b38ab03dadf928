//! Line-delimited session transport over any byte stream.
//!
//! One session owns a [`LineReader`] and a [`LineWriter`]. On the server the
//! writer is shared with the keepalive broadcaster through a [`SharedWriter`].

use crate::error::{ProtocolError, SessionError};
use crate::protocol::MAX_LINE_LENGTH;
use bytes::BytesMut;
use futures::StreamExt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

type BoxRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half shared between a connection handler and the broadcaster.
pub type SharedWriter = Arc<Mutex<LineWriter>>;

/// Split a stream into its reading and writing halves.
pub fn split<S>(stream: S) -> (LineReader, LineWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    (
        LineReader {
            lines: FramedRead::new(
                Box::new(reader) as BoxRead,
                LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            ),
        },
        LineWriter {
            inner: Box::new(writer),
            interrupted: false,
        },
    )
}

/// Reads one line at a time with the terminator stripped.
///
/// At most `MAX_LINE_LENGTH` bytes are buffered while waiting for a newline.
pub struct LineReader {
    lines: FramedRead<BoxRead, LinesCodec>,
}

impl LineReader {
    /// Next line from the peer; `Ok(None)` when the peer closed the stream.
    ///
    /// Cancel-safe: dropping the future before it completes loses no data.
    pub async fn next_line(&mut self) -> Result<Option<String>, SessionError> {
        match self.lines.next().await {
            None => Ok(None),
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                Err(ProtocolError::LineTooLong(MAX_LINE_LENGTH).into())
            }
            Some(Err(LinesCodecError::Io(e))) if e.kind() == io::ErrorKind::InvalidData => {
                Err(ProtocolError::InvalidUtf8.into())
            }
            Some(Err(LinesCodecError::Io(e))) => Err(SessionError::Transport(e)),
        }
    }
}

/// Writes framed lines and flushes after each one.
pub struct LineWriter {
    inner: BoxWrite,
    /// Set while a send is in flight. Still set on entry means the previous
    /// send was cancelled part way and the stream may hold half a line.
    interrupted: bool,
}

impl LineWriter {
    /// Write one already-framed message and wait for it to drain.
    ///
    /// Fails with `BrokenPipe` once an earlier send has been cancelled.
    pub async fn send(&mut self, frame: &BytesMut) -> io::Result<()> {
        if self.interrupted {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "an earlier write was interrupted",
            ));
        }
        self.interrupted = true;
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        self.interrupted = false;
        Ok(())
    }

    /// Close the write side of the stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }

    pub fn into_shared(self) -> SharedWriter {
        Arc::new(Mutex::new(self))
    }
}
