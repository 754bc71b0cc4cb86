//! Application response: status, headers, and a body in one of three shapes.

use std::fmt;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio_util::bytes::Bytes;

use super::connection::BoxConnection;

/// Reserved header key carrying a partial-hijack callback. Never written out.
pub const HIJACK_HEADER: &str = "rack.hijack";

/// Receives the raw connection after the framer has flushed the headers.
pub type HijackCallback = Box<dyn FnOnce(BoxConnection) -> BoxFuture<'static, ()> + Send>;

pub type BodyStream = BoxStream<'static, anyhow::Result<Bytes>>;

type ReleaseFn = Box<dyn FnOnce() + Send>;

pub enum HeaderValue {
    /// One string; embedded line breaks yield repeated header lines.
    Text(String),
    List(Vec<String>),
    Hijack(HijackCallback),
}

impl fmt::Debug for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Self::List(v) => f.debug_tuple("List").field(v).finish(),
            Self::Hijack(_) => f.write_str("Hijack(..)"),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(v: Vec<String>) -> Self {
        Self::List(v)
    }
}

impl From<Vec<&str>> for HeaderValue {
    fn from(v: Vec<&str>) -> Self {
        Self::List(v.into_iter().map(str::to_string).collect())
    }
}

/// Ordered header mapping.
#[derive(Debug, Default)]
pub struct Headers {
    entries: Vec<(String, HeaderValue)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name`, replacing an entry with the exact same name in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<HeaderValue>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Request a partial hijack.
    pub fn set_hijack<F>(&mut self, callback: F)
    where
        F: FnOnce(BoxConnection) -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.insert(HIJACK_HEADER, HeaderValue::Hijack(Box::new(callback)));
    }

    pub fn take_hijack(&mut self) -> Option<HijackCallback> {
        let idx = self
            .entries
            .iter()
            .position(|(n, v)| n == HIJACK_HEADER && matches!(v, HeaderValue::Hijack(_)))?;
        match self.entries.remove(idx).1 {
            HeaderValue::Hijack(callback) => Some(callback),
            _ => None,
        }
    }

    /// Case-insensitive presence check.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// True when the application already chose its own framing.
    pub fn has_length_header(&self) -> bool {
        self.contains("Content-Length") || self.contains("Transfer-Encoding")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<HeaderValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

pub enum BodyContent {
    /// A finite list of chunks.
    Chunks(Vec<Bytes>),
    /// One byte string.
    Bytes(Bytes),
    /// A single-pass sequence of unknown total length.
    Stream(BodyStream),
}

impl BodyContent {
    /// Exact byte length, when knowable without consuming anything.
    pub fn known_length(&self) -> Option<u64> {
        match self {
            Self::Chunks(chunks) => Some(chunks.iter().map(|c| c.len() as u64).sum()),
            Self::Bytes(b) => Some(b.len() as u64),
            Self::Stream(_) => None,
        }
    }
}

impl fmt::Debug for BodyContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chunks(c) => f.debug_tuple("Chunks").field(&c.len()).finish(),
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Response body with an optional release hook.
///
/// The hook runs exactly once: on [`Body::release`], or on drop if release was
/// never called.
pub struct Body {
    content: BodyContent,
    release: Option<ReleaseFn>,
}

impl Body {
    pub fn chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self::from_content(BodyContent::Chunks(
            chunks.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Self::from_content(BodyContent::Bytes(bytes.into()))
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = anyhow::Result<Bytes>> + Send + 'static,
    {
        Self::from_content(BodyContent::Stream(stream.boxed()))
    }

    pub fn empty() -> Self {
        Self::from_content(BodyContent::Chunks(Vec::new()))
    }

    fn from_content(content: BodyContent) -> Self {
        Self {
            content,
            release: None,
        }
    }

    /// Run `f` when the framer is done with this body.
    pub fn on_release(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(f));
        self
    }

    pub fn content(&self) -> &BodyContent {
        &self.content
    }

    pub fn known_length(&self) -> Option<u64> {
        self.content.known_length()
    }

    /// Move the content out, leaving an empty list. The release hook stays.
    pub(crate) fn take_content(&mut self) -> BodyContent {
        std::mem::replace(&mut self.content, BodyContent::Chunks(Vec::new()))
    }

    pub fn release(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("content", &self.content)
            .field("has_release", &self.release.is_some())
            .finish()
    }
}

/// What the application returns for one request.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Headers,
    pub body: Body,
}

impl Response {
    pub fn new(status: u16, headers: Headers, body: Body) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn release_runs_once_when_called_explicitly() {
        let (count, hook) = counter();
        let body = Body::bytes("x").on_release(hook);
        body.release();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_runs_on_drop() {
        let (count, hook) = counter();
        {
            let mut body = Body::chunks(["a", "b"]).on_release(hook);
            let _content = body.take_content();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn known_length_counts_bytes_not_chars() {
        assert_eq!(Body::chunks(["foo", "bar"]).known_length(), Some(6));
        assert_eq!(Body::bytes("héllo").known_length(), Some(6));
        assert_eq!(Body::stream(futures::stream::empty()).known_length(), None);
    }

    #[test]
    fn headers_keep_order_and_replace_in_place() {
        let mut headers: Headers = [("Content-Type", "text/html"), ("X-A", "1")]
            .into_iter()
            .collect();
        headers.insert("Content-Type", "text/plain");
        let names: Vec<_> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Content-Type", "X-A"]);
        assert!(headers.contains("content-type"));
    }

    #[test]
    fn length_header_detection_is_case_insensitive() {
        assert!(Headers::new().with("content-length", "3").has_length_header());
        assert!(Headers::new().with("TRANSFER-ENCODING", "chunked").has_length_header());
        assert!(!Headers::new().with("Content-Type", "x").has_length_header());
    }

    #[test]
    fn hijack_callback_is_taken_once() {
        let mut headers = Headers::new().with("Upgrade", "websocket");
        headers.set_hijack(|_conn| Box::pin(async {}));
        assert!(headers.contains(HIJACK_HEADER));

        assert!(headers.take_hijack().is_some());
        assert!(headers.take_hijack().is_none());
        assert_eq!(headers.len(), 1);
    }
}
