//! Turns an application's response into bytes on the client connection.
//!
//! Per request the framer invokes the application, then picks one path:
//!
//! - full hijack: the application took the connection, nothing is written
//! - partial hijack: headers only, then the connection goes to the callback
//! - bodyless status (< 100, 204, 205, 304): headers only
//! - application-managed framing (`Content-Length` or `Transfer-Encoding` set): body as-is
//! - list or string body: `Content-Length`, one vectored write
//! - lazy body: `Transfer-Encoding: chunked`
//!
//! The body's release hook runs exactly once on every path, and the request
//! input is closed when `handle` returns.

use std::any::Any;
use std::backtrace::BacktraceStatus;
use std::fmt::Write as _;
use std::io::{self, IoSlice};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::bytes::Bytes;

use super::classify::{self, ConnectionState, Disposition, FramerError};
use super::connection::{BoxConnection, write_all_vectored};
use super::env::Env;
use super::response::{Body, BodyContent, HIJACK_HEADER, HeaderValue, Headers, Response};

const CHUNKED_TERMINATOR: &[u8] = b"0\r\n\r\n";
const CRLF: &[u8] = b"\r\n";

/// The hosted application.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    /// Handle one request.
    ///
    /// The application may take the raw connection with [`Env::hijack`], or
    /// request a partial hijack through [`Headers::set_hijack`].
    async fn call(&self, env: &mut Env) -> anyhow::Result<Response>;
}

/// Receives failures the framer logged and continued past.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, report: &ErrorReport);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub message: String,
    pub backtrace: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub headers_sent: bool,
}

/// Drops every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl ErrorReporter for NullReporter {
    fn report(&self, _report: &ErrorReport) {}
}

/// How a request ended.
pub enum Handled {
    /// The framer is done; the caller owns and should close the connection.
    Completed(BoxConnection),
    /// The connection was handed to the application. Do not touch it.
    Hijacked,
}

impl Handled {
    pub fn is_hijacked(&self) -> bool {
        matches!(self, Self::Hijacked)
    }
}

impl std::fmt::Debug for Handled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed(_) => f.write_str("Completed(..)"),
            Self::Hijacked => f.write_str("Hijacked"),
        }
    }
}

pub struct Framer<A> {
    app: Arc<A>,
    reporter: Arc<dyn ErrorReporter>,
    concurrency: usize,
}

impl<A> Clone for Framer<A> {
    fn clone(&self) -> Self {
        Self {
            app: Arc::clone(&self.app),
            reporter: Arc::clone(&self.reporter),
            concurrency: self.concurrency,
        }
    }
}

impl<A: Application> Framer<A> {
    pub fn new(app: Arc<A>) -> Self {
        Self::with_reporter(app, Arc::new(NullReporter))
    }

    pub fn with_reporter(app: Arc<A>, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            app,
            reporter,
            concurrency: 1,
        }
    }

    /// Number of requests this process serves at once. Above one, the
    /// application sees [`Env::multithread`] as true.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn app(&self) -> &Arc<A> {
        &self.app
    }

    /// Serve one request on `connection`.
    ///
    /// With `full_http_response`, a `HTTP/1.1` status line and
    /// `Connection: close` precede the CGI `Status:` line.
    ///
    /// Only failures the classifier marks [`Disposition::Reraise`] come back as
    /// `Err`; everything else is logged or dropped here.
    pub async fn handle(
        &self,
        mut env: Env,
        connection: BoxConnection,
        full_http_response: bool,
    ) -> Result<Handled, FramerError> {
        env.set_concurrency(self.concurrency);
        env.install_connection(connection);
        let handled = self.serve(&mut env, full_http_response).await;
        env.close_input();
        handled
    }

    async fn serve(&self, env: &mut Env, full_http_response: bool) -> Result<Handled, FramerError> {
        let result = match AssertUnwindSafe(self.app.call(env))
            .catch_unwind()
            .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(FramerError::Application(e)),
            Err(panic) => Err(FramerError::Application(anyhow::anyhow!(
                "application panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };

        let Some(mut conn) = env.reclaim_connection() else {
            // Full hijack. Dropping the response releases its body.
            tracing::debug!(path = env.path_info(), "Connection hijacked by application");
            return match result {
                Ok(_response) => Ok(Handled::Hijacked),
                Err(e) => self
                    .dispose(e, ConnectionState::default(), env)
                    .map(|()| Handled::Hijacked),
            };
        };

        let Response {
            status,
            mut headers,
            mut body,
        } = match result {
            Ok(response) => response,
            Err(e) => {
                return self
                    .dispose(e, ConnectionState::default(), env)
                    .map(|()| Handled::Completed(conn));
            }
        };

        let mut state = ConnectionState::default();

        if let Some(callback) = headers.take_hijack() {
            let head = render_head(status, &headers, None, full_http_response);
            let sent = send_head_only(&mut conn, &head, &mut state).await;
            body.release();
            return match sent {
                Ok(()) => {
                    tracing::debug!(status, "Handing connection to partial hijack callback");
                    match AssertUnwindSafe(callback(conn)).catch_unwind().await {
                        Ok(()) => Ok(Handled::Hijacked),
                        Err(panic) => {
                            let e = FramerError::Application(anyhow::anyhow!(
                                "hijack callback panicked: {}",
                                panic_message(panic.as_ref())
                            ));
                            self.dispose(e, state, env).map(|()| Handled::Hijacked)
                        }
                    }
                }
                Err(e) => self.dispose(e, state, env).map(|()| Handled::Completed(conn)),
            };
        }

        let sent = send_response(
            &mut conn,
            status,
            &headers,
            &mut body,
            full_http_response,
            &mut state,
        )
        .await;
        body.release();

        match sent {
            Ok(()) => Ok(Handled::Completed(conn)),
            Err(e) => self.dispose(e, state, env).map(|()| Handled::Completed(conn)),
        }
    }

    fn dispose(
        &self,
        error: FramerError,
        state: ConnectionState,
        env: &Env,
    ) -> Result<(), FramerError> {
        match classify::classify(&error, &state) {
            Disposition::Reraise => Err(error),
            Disposition::Swallow => {
                tracing::debug!(error = %error, "Client disconnected, dropping failure");
                Ok(())
            }
            Disposition::LogAndContinue => {
                let backtrace = backtrace_of(&error);
                tracing::error!(
                    error = %error,
                    method = env.request_method(),
                    path = env.path_info(),
                    headers_sent = state.headers_sent,
                    "Request failed"
                );
                if let Some(bt) = &backtrace {
                    tracing::debug!(backtrace = %bt, "Request failure backtrace");
                }
                self.reporter.report(&ErrorReport {
                    message: error.to_string(),
                    backtrace,
                    method: env.request_method().map(str::to_string),
                    path: env.path_info().map(str::to_string),
                    headers_sent: state.headers_sent,
                });
                Ok(())
            }
        }
    }
}

fn is_bodyless(status: u16) -> bool {
    status < 100 || matches!(status, 204 | 205 | 304)
}

/// Status lines, headers, an optional framing header, and the blank line.
fn render_head(
    status: u16,
    headers: &Headers,
    length_header: Option<&str>,
    full_http_response: bool,
) -> String {
    let mut head = String::with_capacity(256);
    // Writing into a String cannot fail.
    if full_http_response {
        let _ = write!(head, "HTTP/1.1 {status} Whatever\r\nConnection: close\r\n");
    }
    let _ = write!(head, "Status: {status} Whatever\r\n");
    for (name, value) in headers.iter() {
        if name == HIJACK_HEADER {
            continue;
        }
        match value {
            HeaderValue::Text(text) => {
                for line in text.lines() {
                    let _ = write!(head, "{name}: {line}\r\n");
                }
            }
            HeaderValue::List(values) => {
                for line in values.iter().flat_map(|v| v.lines()) {
                    let _ = write!(head, "{name}: {line}\r\n");
                }
            }
            HeaderValue::Hijack(_) => {}
        }
    }
    if let Some(line) = length_header {
        head.push_str(line);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head
}

async fn send_head_only(
    conn: &mut BoxConnection,
    head: &str,
    state: &mut ConnectionState,
) -> Result<(), FramerError> {
    state.headers_sent = true;
    track(state, conn.write_all(head.as_bytes()).await)?;
    track(state, conn.flush().await)
}

async fn send_response(
    conn: &mut BoxConnection,
    status: u16,
    headers: &Headers,
    body: &mut Body,
    full_http_response: bool,
    state: &mut ConnectionState,
) -> Result<(), FramerError> {
    if is_bodyless(status) {
        let head = render_head(status, headers, None, full_http_response);
        return send_head_only(conn, &head, state).await;
    }

    let content = body.take_content();

    if headers.has_length_header() {
        let head = render_head(status, headers, None, full_http_response);
        state.headers_sent = true;
        track(state, conn.write_all(head.as_bytes()).await)?;
        match content {
            BodyContent::Chunks(chunks) => {
                let mut slices: Vec<IoSlice<'_>> = chunks.iter().map(|c| IoSlice::new(c)).collect();
                track(state, write_all_vectored(conn, &mut slices).await)?;
            }
            BodyContent::Bytes(bytes) => track(state, conn.write_all(&bytes).await)?,
            BodyContent::Stream(mut stream) => {
                while let Some(chunk) = next_chunk(&mut stream).await? {
                    track(state, conn.write_all(&chunk).await)?;
                }
            }
        }
        return track(state, conn.flush().await);
    }

    match content {
        BodyContent::Chunks(chunks) => {
            write_with_length(conn, status, headers, &chunks, full_http_response, state).await
        }
        BodyContent::Bytes(bytes) => {
            let chunks = [bytes];
            write_with_length(conn, status, headers, &chunks, full_http_response, state).await
        }
        BodyContent::Stream(mut stream) => {
            let head = render_head(
                status,
                headers,
                Some("Transfer-Encoding: chunked"),
                full_http_response,
            );
            state.headers_sent = true;
            track(state, conn.write_all(head.as_bytes()).await)?;
            while let Some(chunk) = next_chunk(&mut stream).await? {
                if chunk.is_empty() {
                    continue;
                }
                let size = format!("{:x}\r\n", chunk.len());
                let mut slices = [
                    IoSlice::new(size.as_bytes()),
                    IoSlice::new(&chunk),
                    IoSlice::new(CRLF),
                ];
                track(state, write_all_vectored(conn, &mut slices).await)?;
            }
            track(state, conn.write_all(CHUNKED_TERMINATOR).await)?;
            track(state, conn.flush().await)
        }
    }
}

async fn write_with_length(
    conn: &mut BoxConnection,
    status: u16,
    headers: &Headers,
    chunks: &[Bytes],
    full_http_response: bool,
    state: &mut ConnectionState,
) -> Result<(), FramerError> {
    let length: usize = chunks.iter().map(Bytes::len).sum();
    let length_header = format!("Content-Length: {length}");
    let head = render_head(status, headers, Some(&length_header), full_http_response);

    let mut slices = Vec::with_capacity(chunks.len() + 1);
    slices.push(IoSlice::new(head.as_bytes()));
    slices.extend(chunks.iter().map(|c| IoSlice::new(c)));
    state.headers_sent = true;
    track(state, write_all_vectored(conn, &mut slices).await)?;
    track(state, conn.flush().await)
}

/// Pull the next chunk, turning a panicking producer into a body error.
async fn next_chunk(stream: &mut super::response::BodyStream) -> Result<Option<Bytes>, FramerError> {
    match AssertUnwindSafe(stream.next()).catch_unwind().await {
        Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
        Ok(Some(Err(e))) => Err(FramerError::Body(e)),
        Ok(None) => Ok(None),
        Err(panic) => Err(FramerError::Body(anyhow::anyhow!(
            "response body panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

/// Map a connection write result, noting when the peer has gone away.
fn track<T>(state: &mut ConnectionState, result: io::Result<T>) -> Result<T, FramerError> {
    result.map_err(|e| {
        if classify::is_disconnect(e.kind()) {
            state.peer_gone = true;
        }
        FramerError::Connection(e)
    })
}

fn backtrace_of(error: &FramerError) -> Option<String> {
    match error {
        FramerError::Application(e) | FramerError::Body(e) => {
            let bt = e.backtrace();
            (bt.status() == BacktraceStatus::Captured).then(|| bt.to_string())
        }
        FramerError::Connection(_) => None,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
