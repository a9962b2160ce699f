use std::net::{Ipv4Addr, SocketAddr};

use serde::Deserialize;

/// Prometheus scrape and health endpoints; off unless enabled
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: (Ipv4Addr::LOCALHOST, 9090).into(),
        }
    }
}
