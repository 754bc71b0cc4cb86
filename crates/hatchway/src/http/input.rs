//! Rewindable request body.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::bytes::BytesMut;

pub type BoxInput = Box<dyn AsyncRead + Send + Unpin>;

/// Request input that keeps every byte it has read so the application can
/// [`rewind`](RewindableInput::rewind) and read the body again.
///
/// The framer closes it when the request ends, whatever the outcome; after
/// that reads return EOF and the source stream is dropped.
pub struct RewindableInput {
    source: Option<BoxInput>,
    seen: BytesMut,
    pos: usize,
}

impl RewindableInput {
    pub fn new(source: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            source: Some(Box::new(source)),
            seen: BytesMut::new(),
            pos: 0,
        }
    }

    pub fn empty() -> Self {
        Self::new(tokio::io::empty())
    }

    /// Replay from the first byte. Bytes not read yet still come from the source.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Bytes pulled from the source so far.
    pub fn buffered_len(&self) -> usize {
        self.seen.len()
    }

    pub fn close(&mut self) {
        if self.source.take().is_some() {
            tracing::trace!(buffered = self.seen.len(), "Closing request input");
        }
        self.seen = BytesMut::new();
        self.pos = 0;
    }

    pub fn is_closed(&self) -> bool {
        self.source.is_none()
    }
}

impl AsyncRead for RewindableInput {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.pos < this.seen.len() {
            let n = (this.seen.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.seen[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }

        let Some(source) = this.source.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let before = buf.filled().len();
        ready!(Pin::new(source).poll_read(cx, buf))?;
        this.seen.extend_from_slice(&buf.filled()[before..]);
        this.pos = this.seen.len();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn rewind_replays_consumed_bytes() {
        let mut input = RewindableInput::new(&b"name=value&x=1"[..]);

        let mut head = [0u8; 4];
        input.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"name");

        input.rewind();
        let mut all = String::new();
        input.read_to_string(&mut all).await.unwrap();
        assert_eq!(all, "name=value&x=1");
        assert_eq!(input.buffered_len(), 14);

        input.rewind();
        let mut again = String::new();
        input.read_to_string(&mut again).await.unwrap();
        assert_eq!(again, "name=value&x=1");
    }

    #[tokio::test]
    async fn closed_input_reads_eof() {
        let mut input = RewindableInput::new(&b"abc"[..]);
        let mut first = [0u8; 1];
        input.read_exact(&mut first).await.unwrap();

        input.close();
        assert!(input.is_closed());
        input.rewind();
        let mut rest = Vec::new();
        input.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(input.buffered_len(), 0);
    }
}
