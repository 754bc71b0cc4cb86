//! Control channel client: handshake, security-checked calls, auto-disconnect.

pub mod client;
pub mod config;
pub mod error;

pub use client::{ControlClient, Reply, Session};
pub use config::{ClientConfig, ConfigError, ControlEndpoint};
pub use error::ClientError;
