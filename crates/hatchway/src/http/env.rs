//! Per-request environment handed to the application.
//!
//! Request line and headers arrive already decoded as CGI-style variables
//! (`REQUEST_METHOD`, `PATH_INFO`, `HTTP_*`, ...). The framer adds the hijack
//! slot and the concurrency flags before invoking the application.

use std::collections::HashMap;
use std::fmt;

use tokio::io::AsyncRead;

use super::connection::BoxConnection;
use super::input::RewindableInput;

pub struct Env {
    vars: HashMap<String, String>,
    input: RewindableInput,
    hijack_supported: bool,
    connection: Option<BoxConnection>,
    multithread: bool,
}

impl Env {
    pub fn new(vars: HashMap<String, String>) -> Self {
        Self {
            vars,
            input: RewindableInput::empty(),
            hijack_supported: false,
            connection: None,
            multithread: false,
        }
    }

    /// Attach the request body stream.
    pub fn with_input(mut self, input: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.input = RewindableInput::new(input);
        self
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    pub fn request_method(&self) -> Option<&str> {
        self.var("REQUEST_METHOD")
    }

    pub fn path_info(&self) -> Option<&str> {
        self.var("PATH_INFO")
    }

    /// Request header by its HTTP name, e.g. `header("Content-Type")`.
    pub fn header(&self, name: &str) -> Option<&str> {
        let key = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
        self.var(&key)
    }

    pub fn url_scheme(&self) -> &'static str {
        match self.var("HTTPS") {
            Some("yes" | "on" | "1") => "https",
            _ => "http",
        }
    }

    /// Request body. Everything read is kept, so [`RewindableInput::rewind`]
    /// replays it.
    pub fn input(&mut self) -> &mut RewindableInput {
        &mut self.input
    }

    /// Whether other requests may run in this process at the same time.
    pub fn multithread(&self) -> bool {
        self.multithread
    }

    /// Always true: the gateway runs several worker processes.
    pub fn multiprocess(&self) -> bool {
        true
    }

    /// Always false: workers serve many requests.
    pub fn run_once(&self) -> bool {
        false
    }

    pub(crate) fn set_concurrency(&mut self, concurrency: usize) {
        self.multithread = concurrency > 1;
    }

    pub(crate) fn close_input(&mut self) {
        self.input.close();
    }

    /// Whether this request offers [`Env::hijack`].
    pub fn hijack_supported(&self) -> bool {
        self.hijack_supported
    }

    /// Take over the raw connection.
    ///
    /// Once taken, the framer writes nothing for this request. Returns `None`
    /// when hijacking is unavailable or already happened.
    pub fn hijack(&mut self) -> Option<BoxConnection> {
        let connection = self.connection.take();
        if connection.is_some() {
            tracing::debug!(path = self.path_info(), "Application hijacked the connection");
        }
        connection
    }

    pub fn is_hijacked(&self) -> bool {
        self.hijack_supported && self.connection.is_none()
    }

    pub(crate) fn install_connection(&mut self, connection: BoxConnection) {
        self.hijack_supported = true;
        self.connection = Some(connection);
    }

    /// The connection back from the slot, or `None` if it was hijacked.
    pub(crate) fn reclaim_connection(&mut self) -> Option<BoxConnection> {
        self.connection.take()
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("vars", &self.vars)
            .field("hijack_supported", &self.hijack_supported)
            .field("hijacked", &self.is_hijacked())
            .field("multithread", &self.multithread)
            .finish_non_exhaustive()
    }
}

impl<K, V> FromIterator<(K, V)> for Env
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::MockConnection;
    use tokio::io::AsyncReadExt;

    #[test]
    fn reads_cgi_variables() {
        let env: Env = [
            ("REQUEST_METHOD", "POST"),
            ("PATH_INFO", "/upload"),
            ("HTTP_CONTENT_TYPE", "text/plain"),
        ]
        .into_iter()
        .collect();

        assert_eq!(env.request_method(), Some("POST"));
        assert_eq!(env.path_info(), Some("/upload"));
        assert_eq!(env.header("Content-Type"), Some("text/plain"));
        assert_eq!(env.header("X-Missing"), None);
    }

    #[test]
    fn url_scheme_follows_https_flag() {
        for (flag, scheme) in [("on", "https"), ("yes", "https"), ("1", "https"), ("off", "http")] {
            let env: Env = [("HTTPS", flag)].into_iter().collect();
            assert_eq!(env.url_scheme(), scheme, "HTTPS={flag}");
        }
        assert_eq!(Env::new(HashMap::new()).url_scheme(), "http");
    }

    #[tokio::test]
    async fn input_stream_is_readable() {
        let mut env = Env::new(HashMap::new()).with_input(&b"name=value"[..]);
        let mut body = String::new();
        env.input().read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "name=value");

        env.input().rewind();
        let mut again = String::new();
        env.input().read_to_string(&mut again).await.unwrap();
        assert_eq!(again, "name=value");
    }

    #[test]
    fn concurrency_flags() {
        let mut env = Env::new(HashMap::new());
        assert!(!env.multithread());
        assert!(env.multiprocess());
        assert!(!env.run_once());

        env.set_concurrency(4);
        assert!(env.multithread());
        env.set_concurrency(1);
        assert!(!env.multithread());
    }

    #[test]
    fn hijack_is_one_shot() {
        let mut env = Env::new(HashMap::new());
        assert!(!env.hijack_supported());
        assert!(env.hijack().is_none());

        let (conn, _recorded) = MockConnection::new();
        env.install_connection(Box::new(conn));
        assert!(env.hijack_supported());
        assert!(!env.is_hijacked());

        assert!(env.hijack().is_some());
        assert!(env.is_hijacked());
        assert!(env.hijack().is_none());
        assert!(env.reclaim_connection().is_none());
    }
}
