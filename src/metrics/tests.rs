use http_body_util::BodyExt;
use hyper::StatusCode;

use super::server::route;
use super::Metrics;

async fn body_string(response: hyper::Response<http_body_util::Full<hyper::body::Bytes>>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[test]
fn test_health_always_ok() {
    let metrics = Metrics::new();
    assert_eq!(route("/health", &metrics).status(), StatusCode::OK);
    assert_eq!(route("/healthz", &metrics).status(), StatusCode::OK);
}

#[test]
fn test_ready_follows_broker_connection() {
    let metrics = Metrics::new();
    assert_eq!(
        route("/ready", &metrics).status(),
        StatusCode::SERVICE_UNAVAILABLE
    );

    metrics.broker_up();
    assert_eq!(route("/readyz", &metrics).status(), StatusCode::OK);

    metrics.broker_down();
    assert_eq!(
        route("/ready", &metrics).status(),
        StatusCode::SERVICE_UNAVAILABLE
    );
}

#[test]
fn test_unknown_path() {
    let metrics = Metrics::new();
    assert_eq!(route("/", &metrics).status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_exposition() {
    let metrics = Metrics::new();
    metrics.http_request(200);
    metrics.publish_completed("1", "ok", 42, 0.003);
    metrics.packet_sent("publish");

    let response = route("/metrics", &metrics);
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(body.contains("httpmq_http_requests_total{status=\"200\"} 1"));
    assert!(body.contains("httpmq_publishes_total{outcome=\"ok\",qos=\"1\"} 1"));
    assert!(body.contains("httpmq_publish_bytes_total 42"));
    assert!(body.contains("httpmq_packets_sent_total{type=\"publish\"} 1"));
}

#[test]
fn test_failed_publish_bytes_not_counted() {
    let metrics = Metrics::new();
    metrics.publish_completed("0", "not_connected", 100, 0.0);
    assert_eq!(metrics.publish_bytes_total.get(), 0);
    assert_eq!(
        metrics
            .publishes_total
            .with_label_values(&["0", "not_connected"])
            .get(),
        1
    );
}
