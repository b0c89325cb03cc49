use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{ClientError, Result};
use crate::host::ProtocolId;

/// How long to wait for a response after a request is sent
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest frame accepted in either direction
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 << 20;

/// [crate::Client] options, fixed at construction.
///
/// Build one with the `with_*` methods or load it from TOML; keys that are left out keep their
/// defaults.
///
/// ```toml
/// fallback_protocols = ["/indexer/ingest/0.9.0"]
/// read_timeout_secs = 2.5
/// max_message_size = 1048576
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Protocols accepted after the primary one, most preferred first
    pub fallback_protocols: Vec<ProtocolId>,

    /// Window for reading a response, measured from the start of the read
    #[serde(rename = "read_timeout_secs", deserialize_with = "secs_to_duration")]
    pub read_timeout: Duration,

    /// Max frame length for requests and responses
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            fallback_protocols: Vec::new(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn with_fallback_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ProtocolId>,
    {
        self.fallback_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Parse a config from a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ClientError::Config(e.to_string()))
    }

    /// Full preference list with `primary` in front, rejecting anything unusable
    pub(crate) fn protocols(&self, primary: ProtocolId) -> Result<Vec<ProtocolId>> {
        if self.read_timeout.is_zero() {
            return Err(ClientError::Config("read timeout must be non-zero".into()));
        }
        if self.max_message_size == 0 {
            return Err(ClientError::Config(
                "max message size must be non-zero".into(),
            ));
        }

        let mut protocols = vec![primary];
        for p in self.fallback_protocols.iter() {
            if protocols.contains(p) {
                return Err(ClientError::Config(format!("protocol {p} listed twice")));
            }
            protocols.push(p.clone());
        }
        if protocols.iter().any(|p| p.as_str().is_empty()) {
            return Err(ClientError::Config("protocol id must not be empty".into()));
        }

        Ok(protocols)
    }
}

fn secs_to_duration<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
    let secs = f64::deserialize(d)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}
