//! Decides what to do with a failure raised while serving one request.

use std::io;

/// A failure raised while handling a request, tagged by where it came from.
#[derive(Debug, thiserror::Error)]
pub enum FramerError {
    #[error("application failed: {0:#}")]
    Application(anyhow::Error),

    #[error("response body failed: {0:#}")]
    Body(anyhow::Error),

    #[error("client connection failed: {0}")]
    Connection(#[source] io::Error),
}

impl FramerError {
    fn chain(&self) -> Box<dyn Iterator<Item = &(dyn std::error::Error + 'static)> + '_> {
        match self {
            Self::Application(e) | Self::Body(e) => Box::new(e.chain()),
            Self::Connection(e) => Box::new(std::iter::once(e as &(dyn std::error::Error + 'static))),
        }
    }

    /// Whether a [`WorkerAbort`] appears anywhere in the cause chain.
    pub fn is_worker_abort(&self) -> bool {
        self.chain().any(|e| e.is::<WorkerAbort>())
    }
}

/// Raised by an application to terminate the worker. Never swallowed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("worker abort: {reason}")]
pub struct WorkerAbort {
    pub reason: String,
}

impl WorkerAbort {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// What the framer knows about the client connection when a failure lands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionState {
    /// Writing the response head has started, so the client may have seen part of it.
    pub headers_sent: bool,
    /// A write already failed with a disconnect error.
    pub peer_gone: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Propagate to the caller.
    Reraise,
    /// The client went away; drop the failure silently.
    Swallow,
    /// Log, report, and keep the worker serving.
    LogAndContinue,
}

/// I/O error kinds that mean the client hung up.
pub fn is_disconnect(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
    )
}

pub fn classify(error: &FramerError, state: &ConnectionState) -> Disposition {
    if error.is_worker_abort() {
        return Disposition::Reraise;
    }
    match error {
        FramerError::Connection(e) if is_disconnect(e.kind()) => Disposition::Swallow,
        FramerError::Connection(_) => Disposition::Reraise,
        FramerError::Application(_) | FramerError::Body(_) => {
            let wraps_disconnect = error
                .chain()
                .filter_map(|e| e.downcast_ref::<io::Error>())
                .any(|e| is_disconnect(e.kind()));
            if state.peer_gone || wraps_disconnect {
                Disposition::Swallow
            } else {
                Disposition::LogAndContinue
            }
        }
    }
}
