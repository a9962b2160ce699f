//! Translation of a single HTTP write request into a broker publish

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Method, Request, Response, StatusCode};
use tracing::{debug, info, warn};

use super::sniff::detect_content_type;
use super::topic::{decode_path, derive_topic};
use super::MESSAGE_TARGET;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::mqtt::{PublishError, Publisher};
use crate::protocol::QoS;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Per-request settings shared by every handler invocation
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Joined in front of each request path to form the topic
    pub prefix: String,
    /// QoS applied to every publish
    pub qos: QoS,
    /// Largest accepted body in bytes (0 = unlimited)
    pub max_body_size: usize,
}

impl BridgeConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            prefix: config.http.prefix.clone(),
            qos: config.broker.qos(),
            max_body_size: config.http.max_body_size,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            prefix: "/".to_string(),
            qos: QoS::AtMostOnce,
            max_body_size: 0,
        }
    }
}

/// Turns PUT/POST requests into publishes on the derived topic
#[derive(Clone)]
pub struct BridgeHandler {
    config: Arc<BridgeConfig>,
    publisher: Arc<dyn Publisher>,
    metrics: Option<Arc<Metrics>>,
}

impl BridgeHandler {
    pub fn new(config: BridgeConfig, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            config: Arc::new(config),
            publisher,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Handle one request. Never fails: every outcome maps to a response.
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        let response = self.process(req).await;
        if let Some(metrics) = &self.metrics {
            metrics.http_request(response.status().as_u16());
        }
        response
    }

    async fn process<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        if *req.method() != Method::PUT && *req.method() != Method::POST {
            let mut response = error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "only POST and PUT are supported",
            );
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("POST, PUT"));
            return response;
        }

        let (parts, body) = req.into_parts();

        let payload = match self.read_body(body).await {
            Ok(payload) => payload,
            Err(BodyError::TooLarge) => {
                debug!(
                    "Rejecting {} body over {} bytes",
                    parts.uri.path(),
                    self.config.max_body_size
                );
                return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
            }
            Err(BodyError::Read(e)) => {
                warn!("Failed to read request body: {}", e);
                return error_response(StatusCode::BAD_REQUEST, "error while reading body");
            }
        };

        let Some(path) = decode_path(parts.uri.path()) else {
            return error_response(StatusCode::BAD_REQUEST, "invalid request path");
        };

        let Some(topic) = derive_topic(&self.config.prefix, &path) else {
            return error_response(StatusCode::BAD_REQUEST, "got empty path without prefix");
        };

        info!(
            target: MESSAGE_TARGET,
            "[MSG] topic=\"{}\" length={} mime=\"{}\"",
            topic,
            payload.len(),
            detect_content_type(&payload)
        );

        let qos = self.config.qos;
        let length = payload.len();
        let started = Instant::now();
        let result = self.publisher.publish(&topic, qos, false, payload).await;

        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(()) => "ok",
                Err(e) => e.as_str(),
            };
            metrics.publish_completed(
                qos.as_str(),
                outcome,
                length,
                started.elapsed().as_secs_f64(),
            );
        }

        match result {
            Ok(()) => Response::new(Full::new(Bytes::new())),
            Err(e) => {
                warn!("Failed to publish to {}: {}", topic, e);
                publish_error_response(&e)
            }
        }
    }

    async fn read_body<B>(&self, body: B) -> Result<Bytes, BodyError>
    where
        B: Body,
        B::Error: Into<BoxError>,
    {
        if self.config.max_body_size == 0 {
            return body
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .map_err(|e| BodyError::Read(e.into()));
        }

        match Limited::new(body, self.config.max_body_size).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.is::<LengthLimitError>() => Err(BodyError::TooLarge),
            Err(e) => Err(BodyError::Read(e)),
        }
    }
}

enum BodyError {
    TooLarge,
    Read(BoxError),
}

/// Map a publish failure onto the HTTP status the caller sees
pub fn publish_error_status(error: &PublishError) -> StatusCode {
    match error {
        PublishError::NotConnected
        | PublishError::ConnectionLost
        | PublishError::ShuttingDown
        | PublishError::InflightFull => StatusCode::SERVICE_UNAVAILABLE,
        PublishError::Rejected(_) => StatusCode::BAD_GATEWAY,
        PublishError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        PublishError::PacketTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        PublishError::Encode(_) => StatusCode::BAD_REQUEST,
    }
}

fn publish_error_response(error: &PublishError) -> Response<Full<Bytes>> {
    let mut response = error_response(publish_error_status(error), &error.to_string());
    if matches!(error, PublishError::InflightFull) {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from_static("1"));
    }
    response
}

/// Plain-text error body terminated by a newline
fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(format!("{}\n", message))));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
