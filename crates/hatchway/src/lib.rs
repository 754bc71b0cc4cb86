//! hatchway: worker-side plumbing for an application-server gateway.
//!
//! - [`bridge`]: length-prefixed tuple, scalar and descriptor frames on a duplex socket
//! - [`control`]: authenticated client session against the gateway controller
//! - [`http`]: response framing, hijack handoff and failure classification
//! - [`telemetry`]: tracing subscriber setup

pub mod bridge;
pub mod control;
pub mod http;
pub mod telemetry;

pub use bridge::channel::Channel;
pub use bridge::codec::Tuple;
pub use bridge::transport::{ControlAddress, ControlStream, DescriptorTransport};
pub use control::{ClientConfig, ClientError, ControlClient, ControlEndpoint, Reply, Session};
pub use http::{
    Application, Body, Env, ErrorReporter, Framer, FramerError, Handled, Headers, Response,
    WorkerAbort,
};
pub use telemetry::init_tracing;
