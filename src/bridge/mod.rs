//! HTTP to MQTT bridge
//!
//! Every `PUT` or `POST` request becomes one publish. The topic is the
//! configured prefix joined with the request path and cleaned lexically:
//!
//! ```text
//! prefix = "/sensors/"
//! PUT /room1/../room2/temp   ->   sensors/room2/temp
//! ```
//!
//! The request is answered only after the broker has acknowledged the
//! message at the configured QoS.

mod handler;
mod server;
pub mod sniff;
pub mod topic;

#[cfg(test)]
mod tests;

/// Tracing target of the per-message log line
pub const MESSAGE_TARGET: &str = "httpmq::message";

pub use handler::{publish_error_status, BridgeConfig, BridgeHandler};
pub use server::HttpServer;
pub use sniff::detect_content_type;
pub use topic::derive_topic;
