//! Broker connection configuration

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;

use super::{expand_env, ConfigError};
use crate::mqtt::BrokerAddr;
use crate::protocol::{ProtocolVersion, QoS};

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker URI, e.g. "tcp://[::1]:1883" or "mqtts://broker.example.com"
    pub uri: String,
    /// MQTT client identifier (empty lets the broker assign one)
    pub client_id: String,
    /// Username for broker authentication
    pub username: Option<String>,
    /// File holding the broker password, used byte-for-byte.
    /// `$VAR` and `${VAR}` in the path are expanded.
    pub password_file: Option<String>,
    /// MQTT protocol level: 4 (v3.1.1) or 5 (v5.0)
    pub protocol_version: u8,
    /// QoS applied to every publish (0, 1, or 2)
    pub qos: u8,
    /// Keep alive in seconds (0 disables PINGREQ)
    pub keep_alive: u16,
    /// Clean session (v3.1.1) / clean start (v5.0)
    pub clean_start: bool,
    /// Retry the initial connection in the background instead of failing
    pub connect_retry: bool,
    /// Reconnect automatically after an established connection is lost
    pub auto_reconnect: bool,
    /// Initial delay between connection attempts
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
    /// Upper bound for the exponential backoff
    #[serde(with = "humantime_serde")]
    pub max_reconnect_interval: Duration,
    /// Bound on TCP connect, TLS handshake and CONNACK wait
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Bound on the wait for a publish acknowledgement (0 = no bound)
    #[serde(with = "humantime_serde")]
    pub publish_timeout: Duration,
    /// Time given to in-flight publishes on shutdown
    #[serde(with = "humantime_serde")]
    pub disconnect_grace: Duration,
    /// Maximum unacknowledged QoS 1/2 publishes
    pub max_inflight: u16,
    /// Maximum size of packets accepted from the broker
    pub max_packet_size: usize,
    /// TLS settings for ssl://, tls://, mqtts:// and tcps:// URIs
    pub tls: BrokerTlsConfig,
}

/// TLS settings for the broker connection
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BrokerTlsConfig {
    /// Extra CA certificates (PEM) trusted alongside the platform roots
    pub ca_file: Option<PathBuf>,
    /// Client certificate chain (PEM) for mutual TLS
    pub client_cert: Option<PathBuf>,
    /// Client private key (PEM) for mutual TLS
    pub client_key: Option<PathBuf>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            uri: "tcp://[::1]:1883".to_string(),
            client_id: String::new(),
            username: None,
            password_file: None,
            protocol_version: 4,
            qos: 0,
            keep_alive: 30,
            clean_start: true,
            connect_retry: true,
            auto_reconnect: true,
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(30),
            disconnect_grace: Duration::from_millis(250),
            max_inflight: 1000,
            max_packet_size: 1024 * 1024,
            tls: BrokerTlsConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// QoS as the protocol type. Only valid after `validate()`.
    pub fn qos(&self) -> QoS {
        QoS::from_u8(self.qos).unwrap_or_default()
    }

    /// Protocol version as the protocol type. Only valid after `validate()`.
    pub fn protocol_version(&self) -> ProtocolVersion {
        ProtocolVersion::from_u8(self.protocol_version).unwrap_or_default()
    }

    /// Publish timeout, `None` when disabled
    pub fn publish_timeout(&self) -> Option<Duration> {
        (!self.publish_timeout.is_zero()).then_some(self.publish_timeout)
    }

    /// Read the password file, if one is configured.
    ///
    /// The content is returned as-is, trailing newlines included.
    pub fn load_password(&self) -> Result<Option<Bytes>, ConfigError> {
        let Some(ref path) = self.password_file else {
            return Ok(None);
        };
        if path.is_empty() {
            return Ok(None);
        }
        let expanded = expand_env(path);
        let content = std::fs::read(&expanded).map_err(|e| {
            ConfigError::Io(std::io::Error::new(
                e.kind(),
                format!("reading password file {}: {}", expanded, e),
            ))
        })?;
        Ok(Some(Bytes::from(content)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.qos > 2 {
            return Err(ConfigError::Validation(
                "broker.qos must be 0, 1, or 2".to_string(),
            ));
        }

        if ProtocolVersion::from_u8(self.protocol_version).is_none() {
            return Err(ConfigError::Validation(format!(
                "broker.protocol_version must be 4 (v3.1.1) or 5 (v5.0), got {}",
                self.protocol_version
            )));
        }

        BrokerAddr::parse(&self.uri)
            .map_err(|e| ConfigError::Validation(format!("broker.uri: {}", e)))?;

        if self.max_inflight == 0 {
            return Err(ConfigError::Validation(
                "broker.max_inflight must be greater than 0".to_string(),
            ));
        }

        if self.max_packet_size == 0 {
            return Err(ConfigError::Validation(
                "broker.max_packet_size must be greater than 0".to_string(),
            ));
        }

        if self.reconnect_interval.is_zero() {
            return Err(ConfigError::Validation(
                "broker.reconnect_interval must be greater than 0".to_string(),
            ));
        }

        if self.max_reconnect_interval < self.reconnect_interval {
            return Err(ConfigError::Validation(
                "broker.max_reconnect_interval must not be shorter than reconnect_interval"
                    .to_string(),
            ));
        }

        match (&self.tls.client_cert, &self.tls.client_key) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(ConfigError::Validation(
                    "broker.tls.client_cert and client_key must be set together".to_string(),
                ));
            }
            _ => {}
        }

        Ok(())
    }
}
