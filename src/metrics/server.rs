//! Scrape and health endpoints
//!
//! `/metrics` renders the registry in the Prometheus text format.
//! `/health` always answers 200; `/ready` answers 200 only while the broker
//! session is up, so an orchestrator can hold traffic back during reconnects.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::Metrics;

pub struct MetricsServer {
    metrics: Arc<Metrics>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Serve until the listener fails
    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Serving metrics on http://{}/metrics", listener.local_addr()?);

        loop {
            let (stream, peer) = listener.accept().await?;
            let metrics = Arc::clone(&self.metrics);

            tokio::spawn(async move {
                let service = service_fn(|req: hyper::Request<hyper::body::Incoming>| {
                    let response = route(req.uri().path(), &metrics);
                    async move { Ok::<_, Infallible>(response) }
                });
                let served = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
                if let Err(e) = served {
                    debug!("Metrics connection from {} failed: {}", peer, e);
                }
            });
        }
    }
}

pub(crate) fn route(path: &str, metrics: &Metrics) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => scrape(metrics),
        "/health" | "/healthz" => plain(StatusCode::OK, "OK"),
        "/ready" | "/readyz" if metrics.is_broker_connected() => plain(StatusCode::OK, "OK"),
        "/ready" | "/readyz" => plain(StatusCode::SERVICE_UNAVAILABLE, "broker not connected"),
        _ => plain(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn scrape(metrics: &Metrics) -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let mut body = Vec::new();
    if let Err(e) = encoder.encode(&metrics.registry.gather(), &mut body) {
        error!("Cannot render metrics: {}", e);
        return plain(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(body)));
    if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
