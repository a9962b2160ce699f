//! httpmq - HTTP to MQTT publish bridge
//!
//! Accepts `PUT`/`POST` requests and republishes their bodies on an MQTT
//! v3.1.1/v5.0 broker, mapping the URL path to the topic. Each request is
//! answered once the broker has acknowledged the message.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod metrics;
pub mod mqtt;
pub mod protocol;

pub use bridge::{BridgeConfig, BridgeHandler, HttpServer};
pub use config::Config;
pub use metrics::{Metrics, MetricsServer};
pub use mqtt::{BrokerClient, ClientOptions, ConnectionStatus, PublishError, Publisher};
pub use protocol::{ProtocolVersion, QoS};
