//! Authenticated client side of the control channel.
//!
//! A [`Session`] is created by a successful handshake and dies on the first
//! I/O failure: the socket is closed, the session forgets it, and the original
//! error is returned. There is no reconnect; callers open a new session and
//! decide their own retry policy.

use std::fmt;
use std::io;
use std::os::fd::OwnedFd;

use tokio_util::bytes::Bytes;

use super::config::{ClientConfig, ControlEndpoint};
use super::error::ClientError;
use crate::bridge::channel::Channel;
use crate::bridge::codec::Tuple;
use crate::bridge::protocol::{
    AUTH_OK, ControlRequest, PASSED_SECURITY, PROTOCOL_VERSION, ReplyShape, TRUE, VERSION_MARKER,
};
use crate::bridge::transport::{ControlAddress, ControlStream};

/// Opens sessions against a controller.
#[derive(Debug, Clone, Default)]
pub struct ControlClient {
    config: ClientConfig,
}

impl ControlClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect to `address` and authenticate.
    pub async fn connect(
        &self,
        address: &ControlAddress,
        username: &str,
        password: &str,
    ) -> Result<Session, ClientError> {
        let stream = address.connect().await?;
        Session::handshake(stream, username, password, &self.config).await
    }

    pub async fn connect_endpoint(endpoint: &ControlEndpoint) -> Result<Session, ClientError> {
        Self::new(endpoint.client.clone())
            .connect(&endpoint.address, &endpoint.username, &endpoint.password)
            .await
    }
}

/// Result of a remote call, shaped by the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Boolean(bool),
    Text(String),
}

/// An authenticated control session bound to one socket.
pub struct Session {
    channel: Option<Channel<ControlStream>>,
    protocol_version: String,
    authenticated: bool,
    negotiate_descriptors: bool,
}

impl Session {
    /// Run the handshake over an already connected stream.
    ///
    /// Any failure drops the stream, closing the socket.
    pub async fn handshake(
        stream: ControlStream,
        username: &str,
        password: &str,
        config: &ClientConfig,
    ) -> Result<Self, ClientError> {
        let mut channel = Channel::with_scalar_limit(stream, config.max_scalar_len);
        let protocol_version = match authenticate(&mut channel, username, password).await {
            Ok(version) => version,
            Err(e) => {
                tracing::debug!(error = %e, "Control handshake failed, closing socket");
                return Err(e);
            }
        };
        tracing::debug!(%protocol_version, username, "Control session authenticated");

        Ok(Self {
            channel: Some(channel),
            protocol_version,
            authenticated: true,
            negotiate_descriptors: config.negotiate_descriptors,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Close the socket. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.channel.take().is_some() {
            tracing::debug!("Control session closed");
        }
        self.authenticated = false;
    }

    // Helper agent operations

    pub async fn detach_process(&mut self, pid: u32) -> Result<bool, ClientError> {
        self.call_boolean(&ControlRequest::DetachProcess { pid }).await
    }

    pub async fn detach_process_by_key(&mut self, key: &str) -> Result<bool, ClientError> {
        self.call_boolean(&ControlRequest::DetachProcessByKey {
            key: key.to_string(),
        })
        .await
    }

    pub async fn pool_status<K, V>(
        &mut self,
        options: impl IntoIterator<Item = (K, V)>,
    ) -> Result<String, ClientError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let options = options
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.call_text(&ControlRequest::Inspect { options }).await
    }

    pub async fn pool_xml(&mut self) -> Result<String, ClientError> {
        self.call_text(&ControlRequest::ToXml).await
    }

    pub async fn requests(&mut self) -> Result<String, ClientError> {
        self.call_text(&ControlRequest::Requests).await
    }

    pub async fn backtraces(&mut self) -> Result<String, ClientError> {
        self.call_text(&ControlRequest::Backtraces).await
    }

    pub async fn logging_agent_status(&mut self) -> Result<String, ClientError> {
        self.call_text(&ControlRequest::LoggingAgentStatus).await
    }

    /// Send `request`, pass the security check when it needs one, and read
    /// the reply in the operation's shape.
    pub async fn call(&mut self, request: &ControlRequest) -> Result<Reply, ClientError> {
        if !self.authenticated {
            return Err(ClientError::Disconnected);
        }
        tracing::trace!(op = request.op_name(), "Control call");

        self.write_tuple(&request.to_tuple()).await?;
        if request.requires_security_check() {
            self.check_security_response().await?;
        }

        match request.reply_shape() {
            ReplyShape::Boolean => {
                let reply = self.read_tuple().await?;
                let reply = self.expect_frame(reply)?;
                Ok(Reply::Boolean(reply.field_is(0, TRUE)))
            }
            ReplyShape::Text => {
                let reply = self.read_scalar().await?;
                let reply = self.expect_frame(reply)?;
                Ok(Reply::Text(String::from_utf8_lossy(&reply).into_owned()))
            }
        }
    }

    async fn call_boolean(&mut self, request: &ControlRequest) -> Result<bool, ClientError> {
        match self.call(request).await? {
            Reply::Boolean(b) => Ok(b),
            Reply::Text(_) => Err(ClientError::protocol("expected a boolean reply")),
        }
    }

    async fn call_text(&mut self, request: &ControlRequest) -> Result<String, ClientError> {
        match self.call(request).await? {
            Reply::Text(text) => Ok(text),
            Reply::Boolean(_) => Err(ClientError::protocol("expected a text reply")),
        }
    }

    /// Read the controller's verdict on the call just written.
    pub async fn check_security_response(&mut self) -> Result<(), ClientError> {
        match self.read_tuple().await? {
            Some(reply) if reply.field_is(0, PASSED_SECURITY) => Ok(()),
            Some(reply) => Err(ClientError::Security(reply.text(0).unwrap_or_default())),
            None => {
                self.auto_disconnect("end of stream during security check");
                Err(ClientError::Security("end of stream".to_string()))
            }
        }
    }

    // Low level I/O. Every failure here disconnects the session.

    pub async fn read_tuple(&mut self) -> Result<Option<Tuple>, ClientError> {
        let result = self.channel()?.read_tuple().await;
        self.guard(result)
    }

    pub async fn write_tuple(&mut self, tuple: &Tuple) -> Result<(), ClientError> {
        let result = self.channel()?.write_tuple(tuple).await;
        self.guard(result)
    }

    pub async fn read_scalar(&mut self) -> Result<Option<Bytes>, ClientError> {
        let result = self.channel()?.read_scalar().await;
        self.guard(result)
    }

    pub async fn write_scalar(&mut self, data: impl Into<Bytes>) -> Result<(), ClientError> {
        let result = self.channel()?.write_scalar(data).await;
        self.guard(result)
    }

    /// Receive a descriptor frame, negotiated per the session's config.
    pub async fn recv_descriptor(&mut self) -> Result<OwnedFd, ClientError> {
        let negotiate = self.negotiate_descriptors;
        let result = self.channel()?.recv_descriptor(negotiate).await;
        self.guard(result)
    }

    fn channel(&mut self) -> Result<&mut Channel<ControlStream>, ClientError> {
        self.channel.as_mut().ok_or(ClientError::Disconnected)
    }

    fn guard<T>(&mut self, result: io::Result<T>) -> Result<T, ClientError> {
        result.map_err(|e| {
            self.auto_disconnect(&e);
            ClientError::Io(e)
        })
    }

    fn expect_frame<T>(&mut self, frame: Option<T>) -> Result<T, ClientError> {
        frame.ok_or_else(|| {
            self.auto_disconnect("end of stream");
            ClientError::Eof
        })
    }

    fn auto_disconnect(&mut self, cause: impl fmt::Display) {
        // Dropping the channel closes the socket; a second call finds nothing.
        if self.channel.take().is_some() {
            tracing::warn!(cause = %cause, "Control session disconnected");
        }
        self.authenticated = false;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("connected", &self.is_connected())
            .field("authenticated", &self.authenticated)
            .field("protocol_version", &self.protocol_version)
            .finish()
    }
}

async fn authenticate(
    channel: &mut Channel<ControlStream>,
    username: &str,
    password: &str,
) -> Result<String, ClientError> {
    let hello = channel.read_tuple().await?.ok_or(ClientError::Eof)?;
    if hello.len() != 2 || !hello.field_is(0, VERSION_MARKER) {
        return Err(ClientError::protocol(
            "controller did not send a valid version identifier",
        ));
    }
    let version = hello.text(1).unwrap_or_default();
    if version != PROTOCOL_VERSION {
        return Err(ClientError::UnsupportedVersion(version));
    }

    channel
        .write_scalar(Bytes::copy_from_slice(username.as_bytes()))
        .await?;
    channel
        .write_scalar(Bytes::copy_from_slice(password.as_bytes()))
        .await?;

    let verdict = channel.read_tuple().await?.ok_or(ClientError::Eof)?;
    if !verdict.field_is(0, AUTH_OK) {
        return Err(ClientError::Authentication(
            verdict.text(0).unwrap_or_default(),
        ));
    }
    Ok(version)
}
