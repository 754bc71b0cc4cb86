//! HTTP response framing for worker-side request handling.
//!
//! - **env**: per-request environment and the hijack slot
//! - **input**: rewindable request body
//! - **response**: status, headers and body returned by the application
//! - **framer**: serializes a response onto the client connection
//! - **classify**: decides whether a failure is re-raised, swallowed or reported
//! - **connection**: the client socket abstraction

pub mod classify;
pub mod connection;
pub mod env;
pub mod framer;
pub mod input;
pub mod response;

pub use classify::{ConnectionState, Disposition, FramerError, WorkerAbort, classify};
pub use connection::{BoxConnection, Connection};
pub use env::Env;
pub use framer::{Application, ErrorReport, ErrorReporter, Framer, Handled, NullReporter};
pub use input::{BoxInput, RewindableInput};
pub use response::{Body, HIJACK_HEADER, HeaderValue, Headers, Response};

#[cfg(test)]
pub(crate) mod testing {
    use std::io::{self, IoSlice};
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    #[derive(Debug, Default)]
    struct Log {
        written: Vec<u8>,
        flushes: usize,
        vectored_writes: usize,
    }

    /// Handle for inspecting what a [`MockConnection`] received.
    #[derive(Debug, Clone, Default)]
    pub struct Recorded(Arc<Mutex<Log>>);

    impl Recorded {
        pub fn written(&self) -> Vec<u8> {
            self.0.lock().unwrap().written.clone()
        }

        pub fn written_str(&self) -> String {
            String::from_utf8(self.written()).unwrap()
        }

        pub fn flushes(&self) -> usize {
            self.0.lock().unwrap().flushes
        }

        pub fn vectored_writes(&self) -> usize {
            self.0.lock().unwrap().vectored_writes
        }
    }

    /// In-memory client connection. Reads hit EOF; writes are recorded.
    pub struct MockConnection {
        log: Recorded,
        /// Cap on bytes accepted per write call.
        pub max_write: Option<usize>,
        /// Fail writes with this kind once `fail_after` bytes were accepted.
        pub fail_with: Option<io::ErrorKind>,
        pub fail_after: usize,
    }

    impl MockConnection {
        pub fn new() -> (Self, Recorded) {
            let log = Recorded::default();
            let conn = Self {
                log: log.clone(),
                max_write: None,
                fail_with: None,
                fail_after: 0,
            };
            (conn, log)
        }

        pub fn failing(kind: io::ErrorKind) -> (Self, Recorded) {
            let (mut conn, log) = Self::new();
            conn.fail_with = Some(kind);
            (conn, log)
        }

        /// Accepts `n` bytes, then fails every write with `kind`.
        pub fn failing_after(kind: io::ErrorKind, n: usize) -> (Self, Recorded) {
            let (mut conn, log) = Self::failing(kind);
            conn.fail_after = n;
            (conn, log)
        }

        fn accept(&mut self, bufs: &[IoSlice<'_>], vectored: bool) -> io::Result<usize> {
            let mut log = self.log.0.lock().unwrap();
            let mut budget = self.max_write.unwrap_or(usize::MAX);
            if let Some(kind) = self.fail_with {
                let left = self.fail_after.saturating_sub(log.written.len());
                if left == 0 {
                    return Err(io::Error::new(kind, "mock connection failure"));
                }
                budget = budget.min(left);
            }
            if vectored {
                log.vectored_writes += 1;
            }
            let mut accepted = 0;
            for buf in bufs {
                let n = buf.len().min(budget);
                log.written.extend_from_slice(&buf[..n]);
                accepted += n;
                budget -= n;
                if budget == 0 {
                    break;
                }
            }
            Ok(accepted)
        }
    }

    impl AsyncRead for MockConnection {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for MockConnection {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(self.get_mut().accept(&[IoSlice::new(buf)], false))
        }

        fn poll_write_vectored(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            bufs: &[IoSlice<'_>],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(self.get_mut().accept(bufs, true))
        }

        fn is_write_vectored(&self) -> bool {
            true
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            if let Some(kind) = this.fail_with {
                return Poll::Ready(Err(io::Error::new(kind, "mock connection failure")));
            }
            this.log.0.lock().unwrap().flushes += 1;
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }
}
