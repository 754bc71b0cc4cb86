//! Frame bridge between a worker and its controller.
//!
//! # Architecture
//!
//! - **codec**: Tuple and Scalar framing for AsyncRead/AsyncWrite
//! - **channel**: strictly ordered frame I/O plus descriptor frames
//! - **protocol**: version, markers and the typed remote operations
//! - **transport**: addresses, Unix/TCP streams, `SCM_RIGHTS` passing

pub mod channel;
pub mod codec;
pub mod protocol;
pub mod transport;
