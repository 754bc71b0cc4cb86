//! Control session configuration.
//!
//! The supervisor hands each worker its controller endpoint as JSON in
//! `HATCHWAY_CONTROL`:
//!
//! ```json
//! {"address": "unix:/run/gw/socket", "username": "worker", "password": "..."}
//! ```
//!
//! `address` defaults to `unix:<HATCHWAY_TMPDIR or system temp dir>/socket`.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bridge::codec::DEFAULT_MAX_SCALAR_LEN;
use crate::bridge::transport::ControlAddress;

pub const CONTROL_ENV: &str = "HATCHWAY_CONTROL";
pub const TMPDIR_ENV: &str = "HATCHWAY_TMPDIR";

/// Tunables for a control session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Wrap descriptor frames in the `pass IO` / `got IO` exchange.
    pub negotiate_descriptors: bool,
    /// Largest scalar frame accepted from the controller.
    pub max_scalar_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            negotiate_descriptors: true,
            max_scalar_len: DEFAULT_MAX_SCALAR_LEN,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{var} is not valid: {source}")]
    Invalid {
        var: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything needed to open an authenticated session.
#[derive(Clone, Serialize)]
pub struct ControlEndpoint {
    pub address: ControlAddress,
    pub username: String,
    pub password: String,
    pub client: ClientConfig,
}

#[derive(Deserialize)]
struct RawEndpoint {
    address: Option<ControlAddress>,
    username: String,
    password: String,
    #[serde(default)]
    client: ClientConfig,
}

impl ControlEndpoint {
    /// Load from `HATCHWAY_CONTROL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let json = lookup(CONTROL_ENV).ok_or(ConfigError::Missing(CONTROL_ENV))?;
        let raw: RawEndpoint =
            serde_json::from_str(&json).map_err(|source| ConfigError::Invalid {
                var: CONTROL_ENV,
                source,
            })?;

        let address = raw
            .address
            .unwrap_or_else(|| default_address(lookup(TMPDIR_ENV)));
        tracing::debug!(%address, username = %raw.username, "Loaded control endpoint");

        Ok(Self {
            address,
            username: raw.username,
            password: raw.password,
            client: raw.client,
        })
    }
}

impl fmt::Debug for ControlEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlEndpoint")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("client", &self.client)
            .finish()
    }
}

/// The controller socket inside the gateway's temp directory.
pub fn default_address(tmpdir: Option<String>) -> ControlAddress {
    let dir = tmpdir
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    ControlAddress::Unix(dir.join("socket"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn client_config_defaults() {
        insta::assert_json_snapshot!(ClientConfig::default(), @r#"
        {
          "negotiate_descriptors": true,
          "max_scalar_len": 67108864
        }
        "#);
    }

    #[test]
    fn endpoint_with_explicit_address() {
        let endpoint = ControlEndpoint::from_lookup(lookup(&[(
            CONTROL_ENV,
            r#"{"address":"tcp://10.0.0.2:3000","username":"w","password":"s3cret","client":{"negotiate_descriptors":false}}"#,
        )]))
        .unwrap();

        assert_eq!(
            endpoint.address,
            ControlAddress::Tcp {
                host: "10.0.0.2".to_string(),
                port: 3000
            }
        );
        assert!(!endpoint.client.negotiate_descriptors);
        assert_eq!(endpoint.client.max_scalar_len, DEFAULT_MAX_SCALAR_LEN);
    }

    #[test]
    fn endpoint_address_defaults_to_tmpdir_socket() {
        let endpoint = ControlEndpoint::from_lookup(lookup(&[
            (CONTROL_ENV, r#"{"username":"w","password":"p"}"#),
            (TMPDIR_ENV, "/var/run/gw-1234"),
        ]))
        .unwrap();
        assert_eq!(endpoint.address.to_string(), "unix:/var/run/gw-1234/socket");
    }

    #[test]
    fn missing_and_invalid_env() {
        let err = ControlEndpoint::from_lookup(lookup(&[])).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"HATCHWAY_CONTROL is not set");

        let err = ControlEndpoint::from_lookup(lookup(&[(CONTROL_ENV, "{")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn debug_output_hides_password() {
        let endpoint = ControlEndpoint {
            address: default_address(Some("/tmp".into())),
            username: "w".into(),
            password: "hunter2".into(),
            client: ClientConfig::default(),
        };
        let rendered = format!("{endpoint:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
