//! Control channel message vocabulary.
//!
//! Handshake (controller speaks first):
//! - controller → `["version", PROTOCOL_VERSION]`
//! - client → Scalar(username), Scalar(password)
//! - controller → `["ok"]` or `[<reason>]`
//!
//! Each call: client → `[<op>, <args>...]`, controller → `["Passed security"]`
//! or `[<reason>]`, then the result as a Tuple or Scalar.

use tokio_util::bytes::Bytes;

use super::codec::Tuple;

pub const PROTOCOL_VERSION: &str = "1";
pub const VERSION_MARKER: &str = "version";
pub const AUTH_OK: &str = "ok";
pub const PASSED_SECURITY: &str = "Passed security";
pub const TRUE: &str = "true";

/// Descriptor negotiation markers, written by the receiving side.
pub const PASS_IO: &str = "pass IO";
pub const GOT_IO: &str = "got IO";

/// How the controller answers a call once the security check passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// A tuple whose first field is `"true"` or something else.
    Boolean,
    /// A scalar carrying bulk text.
    Text,
}

/// Operations a session can request from the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    DetachProcess { pid: u32 },
    DetachProcessByKey { key: String },
    /// Pool status; options are sent flattened as key, value, key, value.
    Inspect { options: Vec<(String, String)> },
    /// Pool status as XML.
    ToXml,
    Requests,
    Backtraces,
    /// Logging agent status. Served on a lower-privilege path.
    LoggingAgentStatus,
}

impl ControlRequest {
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::DetachProcess { .. } => "detach_process",
            Self::DetachProcessByKey { .. } => "detach_process_by_key",
            Self::Inspect { .. } => "inspect",
            Self::ToXml => "toXml",
            Self::Requests => "requests",
            Self::Backtraces => "backtraces",
            Self::LoggingAgentStatus => "status",
        }
    }

    pub fn requires_security_check(&self) -> bool {
        !matches!(self, Self::LoggingAgentStatus)
    }

    pub fn reply_shape(&self) -> ReplyShape {
        match self {
            Self::DetachProcess { .. } | Self::DetachProcessByKey { .. } => ReplyShape::Boolean,
            _ => ReplyShape::Text,
        }
    }

    pub fn to_tuple(&self) -> Tuple {
        let mut fields: Vec<Bytes> = vec![Bytes::from_static(self.op_name().as_bytes())];
        match self {
            Self::DetachProcess { pid } => fields.push(Bytes::from(pid.to_string())),
            Self::DetachProcessByKey { key } => fields.push(Bytes::from(key.clone())),
            Self::Inspect { options } => {
                for (key, value) in options {
                    fields.push(Bytes::from(key.clone()));
                    fields.push(Bytes::from(value.clone()));
                }
            }
            Self::ToXml => fields.push(Bytes::from_static(TRUE.as_bytes())),
            Self::Requests | Self::Backtraces | Self::LoggingAgentStatus => {}
        }
        Tuple::new(fields)
    }
}
