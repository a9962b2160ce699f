//! Prometheus metrics for httpmq
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability,
//! alongside liveness and readiness checks.

use prometheus::core::Collector;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

mod server;

#[cfg(test)]
mod tests;

pub use server::MetricsServer;

/// All httpmq metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // HTTP metrics
    pub http_requests_total: IntCounterVec,

    // Publish metrics
    pub publishes_total: IntCounterVec,
    pub publish_bytes_total: IntCounter,
    pub publish_latency: Histogram,

    // Broker connection metrics
    pub broker_connected: IntGauge,
    pub broker_connections_total: IntCounter,
    pub broker_connect_failures_total: IntCounter,
    pub inflight_messages: IntGauge,

    // Packet metrics (by type, for Prometheus labels)
    pub packets_received_total: IntCounterVec,
    pub packets_sent_total: IntCounterVec,
}

/// Register a collector, returning it for storage in `Metrics`.
/// Names are static, so a failure here is a programming error.
fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> C {
    registry
        .register(Box::new(collector.clone()))
        .expect("metric names are unique");
    collector
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let http_requests_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "httpmq_http_requests_total",
                    "HTTP requests handled, by response status",
                ),
                &["status"],
            )
            .expect("valid metric"),
        );

        let publishes_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "httpmq_publishes_total",
                    "Publish attempts, by QoS and outcome",
                ),
                &["qos", "outcome"],
            )
            .expect("valid metric"),
        );

        let publish_bytes_total = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "httpmq_publish_bytes_total",
                "Payload bytes successfully published",
            ))
            .expect("valid metric"),
        );

        let publish_latency = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new(
                    "httpmq_publish_latency_seconds",
                    "Time from publish request to broker acknowledgement",
                )
                .buckets(vec![
                    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
                ]),
            )
            .expect("valid metric"),
        );

        let broker_connected = register(
            &registry,
            IntGauge::with_opts(Opts::new(
                "httpmq_broker_connected",
                "1 while the broker connection is established",
            ))
            .expect("valid metric"),
        );

        let broker_connections_total = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "httpmq_broker_connections_total",
                "Successful broker connections since startup",
            ))
            .expect("valid metric"),
        );

        let broker_connect_failures_total = register(
            &registry,
            IntCounter::with_opts(Opts::new(
                "httpmq_broker_connect_failures_total",
                "Failed broker connection attempts since startup",
            ))
            .expect("valid metric"),
        );

        let inflight_messages = register(
            &registry,
            IntGauge::with_opts(Opts::new(
                "httpmq_inflight_messages",
                "QoS 1/2 publishes awaiting acknowledgement",
            ))
            .expect("valid metric"),
        );

        let packets_received_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "httpmq_packets_received_total",
                    "MQTT packets received from the broker, by type",
                ),
                &["type"],
            )
            .expect("valid metric"),
        );

        let packets_sent_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "httpmq_packets_sent_total",
                    "MQTT packets sent to the broker, by type",
                ),
                &["type"],
            )
            .expect("valid metric"),
        );

        Metrics {
            registry,
            http_requests_total,
            publishes_total,
            publish_bytes_total,
            publish_latency,
            broker_connected,
            broker_connections_total,
            broker_connect_failures_total,
            inflight_messages,
            packets_received_total,
            packets_sent_total,
        }
    }

    // Helper methods for common operations

    pub fn http_request(&self, status: u16) {
        let status = status.to_string();
        self.http_requests_total
            .with_label_values(&[status.as_str()])
            .inc();
    }

    pub fn publish_completed(&self, qos: &str, outcome: &str, bytes: usize, seconds: f64) {
        self.publishes_total
            .with_label_values(&[qos, outcome])
            .inc();
        self.publish_latency.observe(seconds);
        if outcome == "ok" {
            self.publish_bytes_total.inc_by(bytes as u64);
        }
    }

    pub fn broker_up(&self) {
        self.broker_connected.set(1);
        self.broker_connections_total.inc();
    }

    pub fn broker_down(&self) {
        self.broker_connected.set(0);
        self.inflight_messages.set(0);
    }

    pub fn broker_connect_failed(&self) {
        self.broker_connect_failures_total.inc();
    }

    pub fn is_broker_connected(&self) -> bool {
        self.broker_connected.get() == 1
    }

    pub fn set_inflight(&self, count: usize) {
        self.inflight_messages.set(count as i64);
    }

    pub fn packet_received(&self, packet_type: &str) {
        self.packets_received_total
            .with_label_values(&[packet_type])
            .inc();
    }

    pub fn packet_sent(&self, packet_type: &str) {
        self.packets_sent_total
            .with_label_values(&[packet_type])
            .inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
