//! Broker Connection Manager
//!
//! Owns the single long-lived MQTT connection used by the bridge. A
//! background task drives the socket; callers talk to it over a command
//! channel and wait on a oneshot for the acknowledgement their QoS asks for.

mod client;
mod connection;
mod inflight;
mod transport;


use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{BrokerConfig, BrokerTlsConfig};
use crate::protocol::{DecodeError, EncodeError, ProtocolVersion, QoS, ReasonCode};

pub use client::BrokerClient;
pub use transport::{BrokerAddr, TlsError};

/// Status of the broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not connected and not trying to (before connect, after shutdown,
    /// or after a loss with auto-reconnect disabled)
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and operational
    Connected,
    /// Connection failed, backing off before retry
    Backoff,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Backoff => "backoff",
        };
        f.write_str(text)
    }
}

/// Error establishing the broker connection
#[derive(Debug)]
pub enum ConnectError {
    /// Broker URI could not be parsed
    InvalidUri(String),
    /// Socket error
    Io(std::io::Error),
    /// TLS setup or handshake error
    Tls(TlsError),
    /// TCP connect, TLS handshake or CONNACK did not complete in time
    Timeout,
    /// Broker refused the connection
    Refused(ReasonCode),
    /// Broker sent something other than a valid CONNACK
    Protocol(String),
    /// CONNECT could not be encoded
    Encode(EncodeError),
    /// CONNACK could not be decoded
    Decode(DecodeError),
    /// `connect()` was already called on this client
    AlreadyStarted,
    /// The connection task exited before reporting a result
    Closed,
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::InvalidUri(msg) => write!(f, "invalid broker URI: {}", msg),
            ConnectError::Io(e) => write!(f, "IO error: {}", e),
            ConnectError::Tls(e) => write!(f, "TLS error: {}", e),
            ConnectError::Timeout => write!(f, "connection timed out"),
            ConnectError::Refused(reason) => write!(f, "connection refused: {}", reason),
            ConnectError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            ConnectError::Encode(e) => write!(f, "encode error: {}", e),
            ConnectError::Decode(e) => write!(f, "decode error: {}", e),
            ConnectError::AlreadyStarted => write!(f, "connection already started"),
            ConnectError::Closed => write!(f, "connection task stopped"),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::Io(e) => Some(e),
            ConnectError::Tls(e) => Some(e),
            ConnectError::Encode(e) => Some(e),
            ConnectError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConnectError {
    fn from(e: std::io::Error) -> Self {
        ConnectError::Io(e)
    }
}

impl From<TlsError> for ConnectError {
    fn from(e: TlsError) -> Self {
        ConnectError::Tls(e)
    }
}

impl From<EncodeError> for ConnectError {
    fn from(e: EncodeError) -> Self {
        ConnectError::Encode(e)
    }
}

impl From<DecodeError> for ConnectError {
    fn from(e: DecodeError) -> Self {
        ConnectError::Decode(e)
    }
}

/// Error publishing a single message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The connection was down when the publish was issued
    NotConnected,
    /// The connection dropped before the publish was acknowledged
    ConnectionLost,
    /// The broker answered with an error reason code
    Rejected(ReasonCode),
    /// No acknowledgement within the publish timeout
    Timeout,
    /// The packet exceeds the broker's maximum packet size
    PacketTooLarge,
    /// No packet identifier is available within the in-flight window
    InflightFull,
    /// Topic or payload cannot be encoded
    Encode(EncodeError),
    /// The client is disconnecting
    ShuttingDown,
}

impl PublishError {
    /// Short label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishError::NotConnected => "not_connected",
            PublishError::ConnectionLost => "connection_lost",
            PublishError::Rejected(_) => "rejected",
            PublishError::Timeout => "timeout",
            PublishError::PacketTooLarge => "packet_too_large",
            PublishError::InflightFull => "inflight_full",
            PublishError::Encode(_) => "encode",
            PublishError::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::NotConnected => write!(f, "not connected to broker"),
            PublishError::ConnectionLost => write!(f, "connection to broker lost"),
            PublishError::Rejected(reason) => write!(f, "rejected by broker: {}", reason),
            PublishError::Timeout => write!(f, "timed out waiting for acknowledgement"),
            PublishError::PacketTooLarge => write!(f, "packet exceeds broker maximum size"),
            PublishError::InflightFull => write!(f, "too many messages in flight"),
            PublishError::Encode(e) => write!(f, "cannot encode message: {}", e),
            PublishError::ShuttingDown => write!(f, "client is shutting down"),
        }
    }
}

impl std::error::Error for PublishError {}

impl From<EncodeError> for PublishError {
    fn from(e: EncodeError) -> Self {
        PublishError::Encode(e)
    }
}

/// Something that can publish a message and wait for it to be acknowledged
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `payload` on `topic`, resolving once the broker has
    /// acknowledged it at the level `qos` requires
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), PublishError>;
}

/// Connection parameters resolved from configuration
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub addr: BrokerAddr,
    pub protocol_version: ProtocolVersion,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub keep_alive: u16,
    pub clean_start: bool,
    pub connect_retry: bool,
    pub auto_reconnect: bool,
    pub reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    pub connect_timeout: Duration,
    pub publish_timeout: Option<Duration>,
    pub max_inflight: u16,
    pub max_packet_size: usize,
    pub tls: BrokerTlsConfig,
}

impl ClientOptions {
    /// Build options from the broker section and the password read at startup
    pub fn from_config(
        config: &BrokerConfig,
        password: Option<Bytes>,
    ) -> Result<Self, ConnectError> {
        Ok(Self {
            addr: BrokerAddr::parse(&config.uri)?,
            protocol_version: config.protocol_version(),
            client_id: config.client_id.clone(),
            username: config.username.clone(),
            password,
            keep_alive: config.keep_alive,
            clean_start: config.clean_start,
            connect_retry: config.connect_retry,
            auto_reconnect: config.auto_reconnect,
            reconnect_interval: config.reconnect_interval,
            max_reconnect_interval: config.max_reconnect_interval,
            connect_timeout: config.connect_timeout,
            publish_timeout: config.publish_timeout(),
            max_inflight: config.max_inflight,
            max_packet_size: config.max_packet_size,
            tls: config.tls.clone(),
        })
    }
}
