//! Client connection abstraction.

use std::io::{self, IoSlice};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// A client socket as the framer sees it: duplex, with vectored writes and an
/// explicit flush (both from `AsyncWrite`).
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// An owned connection that can change hands on hijack.
pub type BoxConnection = Box<dyn Connection>;

/// Write every buffer in `bufs`, retrying partial vectored writes.
pub async fn write_all_vectored<W>(writer: &mut W, mut bufs: &mut [IoSlice<'_>]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    // Drop leading empty slices so a zero-length write means a dead peer.
    IoSlice::advance_slices(&mut bufs, 0);
    while !bufs.is_empty() {
        let n = writer.write_vectored(&*bufs).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "connection accepted no more bytes",
            ));
        }
        IoSlice::advance_slices(&mut bufs, n);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::MockConnection;

    #[tokio::test]
    async fn vectored_write_survives_short_writes() {
        let (mut conn, recorded) = MockConnection::new();
        conn.max_write = Some(3);

        let mut bufs = [
            IoSlice::new(b""),
            IoSlice::new(b"head"),
            IoSlice::new(b""),
            IoSlice::new(b"body!"),
        ];
        write_all_vectored(&mut conn, &mut bufs).await.unwrap();
        assert_eq!(recorded.written(), b"headbody!");
    }

    #[tokio::test]
    async fn boxed_connection_is_writable() {
        let (conn, recorded) = MockConnection::new();
        let mut boxed: BoxConnection = Box::new(conn);
        boxed.write_all(b"ok").await.unwrap();
        boxed.flush().await.unwrap();
        assert_eq!(recorded.written(), b"ok");
        assert_eq!(recorded.flushes(), 1);
    }
}
