//! Ordered frame I/O over one duplex stream.
//!
//! Tuples, scalars and descriptors interleave on the same socket, so the read
//! side never buffers past the end of the frame it was asked for. A stray
//! read-ahead would swallow the data byte of a following descriptor frame and
//! the kernel would drop the descriptor with it.

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::Encoder;

use super::codec::{ExactFrame, ScalarCodec, Tuple, TupleCodec};
use super::protocol::{GOT_IO, PASS_IO};
use super::transport::DescriptorTransport;

/// A duplex endpoint carrying tuple, scalar and descriptor frames.
///
/// Owns the stream, and with it the socket. Methods take `&mut self`, so one
/// caller at a time drives the channel.
pub struct Channel<S> {
    stream: S,
    tuples: TupleCodec,
    scalars: ScalarCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self::with_scalar_limit(stream, super::codec::DEFAULT_MAX_SCALAR_LEN)
    }

    pub fn with_scalar_limit(stream: S, max_scalar_len: usize) -> Self {
        Self {
            stream,
            tuples: TupleCodec::new(),
            scalars: ScalarCodec::new(max_scalar_len),
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Read one tuple. `None` means the peer closed the stream cleanly
    /// between frames.
    pub async fn read_tuple(&mut self) -> io::Result<Option<Tuple>> {
        read_exact_frame(&mut self.stream, &mut self.read_buf, &mut self.tuples).await
    }

    pub async fn write_tuple(&mut self, tuple: &Tuple) -> io::Result<()> {
        self.tuples.encode(tuple, &mut self.write_buf)?;
        self.flush_frame().await
    }

    /// Read one scalar. `None` means the peer closed the stream cleanly
    /// between frames.
    pub async fn read_scalar(&mut self) -> io::Result<Option<Bytes>> {
        read_exact_frame(&mut self.stream, &mut self.read_buf, &mut self.scalars).await
    }

    pub async fn write_scalar(&mut self, data: impl Into<Bytes>) -> io::Result<()> {
        self.scalars.encode(data.into(), &mut self.write_buf)?;
        self.flush_frame().await
    }

    async fn flush_frame(&mut self) -> io::Result<()> {
        let frame = self.write_buf.split();
        self.stream.write_all(&frame).await?;
        self.stream.flush().await
    }

    async fn expect_marker(&mut self, marker: &str) -> io::Result<()> {
        match self.read_tuple().await? {
            Some(t) if t.len() == 1 && t.field_is(0, marker) => Ok(()),
            Some(t) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "expected {:?} during descriptor negotiation, got {:?}",
                    marker,
                    t.text(0).unwrap_or_default()
                ),
            )),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "channel closed during descriptor negotiation",
            )),
        }
    }
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + DescriptorTransport + Unpin,
{
    /// Send a descriptor frame.
    ///
    /// With `negotiate`, waits for the receiver's `pass IO` before sending and
    /// its `got IO` after; only then is the descriptor considered delivered.
    pub async fn send_descriptor(&mut self, fd: BorrowedFd<'_>, negotiate: bool) -> io::Result<()> {
        if negotiate {
            self.expect_marker(PASS_IO).await?;
        }
        self.stream.send_descriptor(fd).await?;
        if negotiate {
            self.expect_marker(GOT_IO).await?;
        }
        Ok(())
    }

    /// Receive a descriptor frame; the mirror of [`Channel::send_descriptor`].
    pub async fn recv_descriptor(&mut self, negotiate: bool) -> io::Result<OwnedFd> {
        debug_assert!(self.read_buf.is_empty(), "read buffer holds a partial frame");
        if negotiate {
            self.write_tuple(&Tuple::from(vec![PASS_IO])).await?;
        }
        let fd = self.stream.recv_descriptor().await?;
        if negotiate {
            self.write_tuple(&Tuple::from(vec![GOT_IO])).await?;
        }
        Ok(fd)
    }
}

/// Read exactly one frame for `codec`, never more.
async fn read_exact_frame<S, D>(
    stream: &mut S,
    buf: &mut BytesMut,
    codec: &mut D,
) -> io::Result<Option<D::Item>>
where
    S: AsyncRead + Unpin,
    D: ExactFrame,
{
    loop {
        let missing = codec.missing(buf)?;
        if missing == 0 {
            return match codec.decode(buf)? {
                Some(item) => Ok(Some(item)),
                None => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "complete frame failed to decode",
                )),
            };
        }

        let start = buf.len();
        buf.resize(start + missing, 0);
        let mut filled = start;
        while filled < start + missing {
            let n = match stream.read(&mut buf[filled..start + missing]).await {
                Ok(n) => n,
                Err(e) => {
                    buf.truncate(filled);
                    return Err(e);
                }
            };
            if n == 0 {
                buf.truncate(filled);
                if filled == 0 {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "channel closed in the middle of a frame",
                ));
            }
            filled += n;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;
    use tokio::net::UnixStream;

    fn pair() -> (Channel<UnixStream>, Channel<UnixStream>) {
        let (a, b) = UnixStream::pair().unwrap();
        (Channel::new(a), Channel::new(b))
    }

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (mut a, mut b) = pair();

        a.write_tuple(&Tuple::from(vec!["version", "1"])).await.unwrap();
        a.write_scalar(Bytes::from_static(b"admin")).await.unwrap();
        a.write_scalar(Bytes::new()).await.unwrap();

        let t = b.read_tuple().await.unwrap().unwrap();
        assert_eq!(t, Tuple::from(vec!["version", "1"]));
        assert_eq!(&b.read_scalar().await.unwrap().unwrap()[..], b"admin");
        assert!(b.read_scalar().await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let (a, mut b) = pair();
        drop(a);
        assert!(b.read_tuple().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_mid_frame_is_unexpected_eof() {
        let (mut a, b) = UnixStream::pair().unwrap();
        // Header promises 8 body bytes, only 3 arrive.
        a.write_all(&[0x00, 0x08, 0x00, 0x06, b'a']).await.unwrap();
        drop(a);

        let mut b = Channel::new(b);
        let err = b.read_tuple().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn oversized_scalar_rejected_without_reading_body() {
        let (mut a, b) = pair();
        let mut b = Channel::with_scalar_limit(b.into_inner(), 8);
        a.write_scalar(Bytes::from_static(b"0123456789")).await.unwrap();

        let err = b.read_scalar().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn descriptor_after_tuple_is_not_swallowed() {
        let (mut a, mut b) = pair();
        let file = tempfile::tempfile().unwrap();

        let sender = async {
            a.write_tuple(&Tuple::from(vec!["here it comes"])).await.unwrap();
            a.get_ref().send_descriptor(file.as_fd()).await.unwrap();
            a.write_tuple(&Tuple::from(vec!["done"])).await.unwrap();
        };
        let receiver = async {
            let first = b.read_tuple().await.unwrap().unwrap();
            assert!(first.field_is(0, "here it comes"));
            let _fd = b.recv_descriptor(false).await.unwrap();
            let last = b.read_tuple().await.unwrap().unwrap();
            assert!(last.field_is(0, "done"));
        };
        tokio::join!(sender, receiver);
    }

    #[tokio::test]
    async fn negotiated_descriptor_transfer() {
        let (mut a, mut b) = pair();
        let file = tempfile::tempfile().unwrap();

        let (sent, received) = tokio::join!(
            a.send_descriptor(file.as_fd(), true),
            b.recv_descriptor(true)
        );
        sent.unwrap();
        received.unwrap();
    }

    #[tokio::test]
    async fn negotiation_rejects_wrong_marker() {
        let (mut a, mut b) = pair();
        let file = tempfile::tempfile().unwrap();

        b.write_tuple(&Tuple::from(vec!["something else"])).await.unwrap();
        let err = a.send_descriptor(file.as_fd(), true).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
