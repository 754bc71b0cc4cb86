//! Control channel errors.

use std::io;

/// Errors surfaced by a control session.
///
/// Protocol and authentication failures carry the reason the controller sent
/// (or the one determined locally). I/O failures are passed through unchanged
/// after the session has disconnected itself.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The controller closed the channel where a frame was expected.
    #[error("controller closed the connection")]
    Eof,

    /// The controller sent something the protocol does not allow here.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unsupported controller protocol version {0:?}")]
    UnsupportedVersion(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("security check failed: {0}")]
    Security(String),

    /// The session already tore down its socket after an earlier failure.
    #[error("session is disconnected")]
    Disconnected,
}

impl ClientError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// True for failures that killed the underlying socket.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Eof | Self::Disconnected)
    }
}
