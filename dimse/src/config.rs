//! Configuration surface of the DIMSE layer.
//!
//! These are plain values read once at association setup:
//! maximum PDU lengths, timeouts, the linger period,
//! and the bound on concurrently served peers.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use radlink_ul::pdu::DEFAULT_MAX_PDU;

/// Configuration of a requester (SCU) session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Maximum PDU length this node admits for receiving
    #[serde(default = "default_max_pdu")]
    pub max_pdu_length: u32,

    /// Whether received PDUs may not surpass the maximum PDU length
    #[serde(default = "default_true")]
    pub strict: bool,

    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Bound on each socket write in milliseconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// How long to await the peer's release confirmation, in milliseconds
    #[serde(default = "default_release_timeout")]
    pub release_timeout_ms: u64,

    /// Default deadline applied to each request, in milliseconds
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,

    /// Idle period after which an established association
    /// with no requests in flight is proactively released, in milliseconds
    #[serde(default)]
    pub linger_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            max_pdu_length: default_max_pdu(),
            strict: true,
            connect_timeout_ms: default_connect_timeout(),
            write_timeout_ms: default_write_timeout(),
            release_timeout_ms: default_release_timeout(),
            request_timeout_ms: None,
            linger_ms: None,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger_ms.map(Duration::from_millis)
    }
}

/// Configuration of an acceptor (SCP) server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Maximum PDU length this node admits for receiving
    #[serde(default = "default_max_pdu")]
    pub max_pdu_length: u32,

    /// Whether received PDUs may not surpass the maximum PDU length
    #[serde(default = "default_true")]
    pub strict: bool,

    /// Maximum number of concurrently served associations;
    /// further TCP accepts are refused until one drops
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Bound on each socket write in milliseconds
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_pdu_length: default_max_pdu(),
            strict: true,
            max_clients: default_max_clients(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

fn default_max_pdu() -> u32 {
    DEFAULT_MAX_PDU
}

fn default_connect_timeout() -> u64 {
    30_000
}

fn default_write_timeout() -> u64 {
    30_000
}

fn default_release_timeout() -> u64 {
    10_000
}

fn default_max_clients() -> usize {
    16
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = ClientConfig::default();
        assert_eq!(config.max_pdu_length, DEFAULT_MAX_PDU);
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.linger(), None);

        let config = ServerConfig::default();
        assert_eq!(config.max_clients, 16);
        assert!(config.strict);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: ClientConfig = toml::from_str(
            r#"
            max_pdu_length = 131072
            request_timeout_ms = 5000
            linger_ms = 2000
            "#,
        )
        .unwrap();
        assert_eq!(config.max_pdu_length, 131_072);
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.linger(), Some(Duration::from_secs(2)));
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));

        let config: ServerConfig = toml::from_str("max_clients = 2").unwrap();
        assert_eq!(config.max_clients, 2);
        assert_eq!(config.max_pdu_length, DEFAULT_MAX_PDU);
    }
}
