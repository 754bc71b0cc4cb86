//! Control channel transport.
//!
//! - **ControlAddress**: `unix:<path>` or `tcp://<host>:<port>`
//! - **ControlStream**: connected Unix-domain or TCP socket
//! - **DescriptorTransport**: descriptor passing via `SCM_RIGHTS` (Unix only)

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, Interest, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

/// Where the controller listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ControlAddress {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl ControlAddress {
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(AddressError::new(s, "empty socket path"));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| AddressError::new(s, "missing port"))?;
            if host.is_empty() {
                return Err(AddressError::new(s, "missing host"));
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| AddressError::new(s, "invalid port"))?;
            return Ok(Self::Tcp {
                host: host.to_string(),
                port,
            });
        }
        Err(AddressError::new(s, "expected unix:<path> or tcp://<host>:<port>"))
    }

    pub async fn connect(&self) -> io::Result<ControlStream> {
        tracing::debug!(address = %self, "Connecting to controller");
        match self {
            Self::Unix(path) => Ok(ControlStream::Unix(UnixStream::connect(path).await?)),
            Self::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Ok(ControlStream::Tcp(stream))
            }
        }
    }
}

impl fmt::Display for ControlAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

impl TryFrom<String> for ControlAddress {
    type Error = AddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ControlAddress> for String {
    fn from(addr: ControlAddress) -> Self {
        addr.to_string()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid control address {address:?}: {reason}")]
pub struct AddressError {
    address: String,
    reason: &'static str,
}

impl AddressError {
    fn new(address: &str, reason: &'static str) -> Self {
        Self {
            address: address.to_string(),
            reason,
        }
    }
}

/// A connected control socket.
#[derive(Debug)]
pub enum ControlStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsRawFd for ControlStream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Unix(s) => s.as_raw_fd(),
            Self::Tcp(s) => s.as_raw_fd(),
        }
    }
}

impl AsyncRead for ControlStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ControlStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Streams that can carry open descriptors as ancillary data.
///
/// A descriptor frame is one data byte with a single `SCM_RIGHTS` message
/// attached. The kernel duplicates the descriptor into the receiver; the
/// sender keeps its own copy.
#[async_trait::async_trait]
pub trait DescriptorTransport {
    async fn send_descriptor(&self, fd: BorrowedFd<'_>) -> io::Result<()>;

    async fn recv_descriptor(&self) -> io::Result<OwnedFd>;
}

const DESCRIPTOR_FRAME_BYTE: u8 = 0;

/// Received descriptors are close-on-exec from the moment they arrive.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

#[async_trait::async_trait]
impl DescriptorTransport for UnixStream {
    async fn send_descriptor(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        let sock = self.as_raw_fd();
        let raw = [fd.as_raw_fd()];
        let sent = self
            .async_io(Interest::WRITABLE, || {
                let payload = [DESCRIPTOR_FRAME_BYTE];
                let iov = [io::IoSlice::new(&payload)];
                let cmsgs = [ControlMessage::ScmRights(&raw)];
                sendmsg::<()>(sock, &iov, &cmsgs, MsgFlags::empty(), None).map_err(io::Error::from)
            })
            .await?;
        if sent == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "descriptor frame not sent",
            ));
        }
        tracing::trace!(fd = raw[0], "Sent descriptor frame");
        Ok(())
    }

    async fn recv_descriptor(&self) -> io::Result<OwnedFd> {
        let sock = self.as_raw_fd();
        let fds = self
            .async_io(Interest::READABLE, || {
                let mut payload = [0u8; 1];
                let mut iov = [io::IoSliceMut::new(&mut payload)];
                let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
                let msg = recvmsg::<()>(sock, &mut iov, Some(&mut cmsg_buf), RECV_FLAGS)
                    .map_err(io::Error::from)?;
                if msg.bytes == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "channel closed while waiting for descriptor",
                    ));
                }
                let mut fds = Vec::new();
                for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(received) = cmsg {
                        fds.extend(received);
                    }
                }
                Ok(fds)
            })
            .await?;

        // SAFETY: SCM_RIGHTS installed these descriptors in this process and
        // nothing else holds them yet.
        let mut owned: Vec<OwnedFd> = fds
            .into_iter()
            .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
            .collect();
        if owned.len() > 1 {
            tracing::warn!(count = owned.len(), "Descriptor frame carried extra descriptors, closing them");
            owned.truncate(1);
        }
        let fd = owned.pop().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "descriptor frame arrived without a descriptor",
            )
        })?;
        tracing::trace!(fd = fd.as_raw_fd(), "Received descriptor frame");
        Ok(fd)
    }
}

#[async_trait::async_trait]
impl DescriptorTransport for ControlStream {
    async fn send_descriptor(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        match self {
            Self::Unix(s) => s.send_descriptor(fd).await,
            Self::Tcp(_) => Err(descriptors_unsupported()),
        }
    }

    async fn recv_descriptor(&self) -> io::Result<OwnedFd> {
        match self {
            Self::Unix(s) => s.recv_descriptor().await,
            Self::Tcp(_) => Err(descriptors_unsupported()),
        }
    }
}

fn descriptors_unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "descriptor passing requires a unix-domain control socket",
    )
}
