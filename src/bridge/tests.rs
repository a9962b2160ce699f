//! Bridge Module Tests

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame};
use hyper::header::{ALLOW, RETRY_AFTER};
use hyper::{Method, Request, Response, StatusCode};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use test_case::test_case;

use super::sniff::{detect_content_type, OCTET_STREAM};
use super::topic::{clean, decode_path, derive_topic, join};
use super::{publish_error_status, BridgeConfig, BridgeHandler};
use crate::metrics::Metrics;
use crate::mqtt::{PublishError, Publisher};
use crate::protocol::{EncodeError, QoS, ReasonCode};

// =============================================================================
// Helpers
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Call {
    topic: String,
    qos: QoS,
    retain: bool,
    payload: Bytes,
}

/// Publisher that records every call and answers with a fixed result
#[derive(Default)]
struct RecordingPublisher {
    calls: Mutex<Vec<Call>>,
    fail_with: Option<PublishError>,
}

impl RecordingPublisher {
    fn failing(error: PublishError) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_with: Some(error),
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), PublishError> {
        self.calls.lock().push(Call {
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        });
        match &self.fail_with {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Body whose first frame is a read error
struct FailingBody;

impl Body for FailingBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        Poll::Ready(Some(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ))))
    }
}

fn handler_with(config: BridgeConfig) -> (BridgeHandler, Arc<RecordingPublisher>) {
    let publisher = Arc::new(RecordingPublisher::default());
    (BridgeHandler::new(config, publisher.clone()), publisher)
}

fn request(method: Method, path: &str, body: &'static [u8]) -> Request<Full<Bytes>> {
    Request::builder()
        .method(method)
        .uri(path)
        .body(Full::new(Bytes::from_static(body)))
        .unwrap()
}

async fn body_string(response: Response<Full<Bytes>>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// =============================================================================
// Topic Derivation Tests
// =============================================================================

#[test_case("", "." ; "empty")]
#[test_case("abc", "abc" ; "single")]
#[test_case("a/b/c", "a/b/c" ; "nested")]
#[test_case(".", "." ; "dot")]
#[test_case("..", ".." ; "dotdot")]
#[test_case("../../abc", "../../abc" ; "leading parents kept when relative")]
#[test_case("/", "/" ; "root")]
#[test_case("abc/", "abc" ; "trailing slash")]
#[test_case("abc//def//ghi", "abc/def/ghi" ; "double slashes")]
#[test_case("///abc", "/abc" ; "leading slashes")]
#[test_case("/./abc/def", "/abc/def" ; "leading dot")]
#[test_case("abc/def/../ghi/../jkl", "abc/jkl" ; "parents")]
#[test_case("abc/def/../..", "." ; "cancelled out")]
#[test_case("/abc/def/../../..", "/" ; "rooted cannot escape")]
#[test_case("abc/def/../../../ghi/jkl/../../../mno", "../../mno" ; "relative escape")]
fn test_clean(input: &str, expected: &str) {
    assert_eq!(clean(input), expected);
}

#[test]
fn test_join_skips_empty_elements() {
    assert_eq!(join(&["", ""]), "");
    assert_eq!(join(&["", "a"]), "a");
    assert_eq!(join(&["/", "/x"]), "/x");
    assert_eq!(join(&["a/b/", "/c"]), "a/b/c");
}

#[test_case("/a/b/", "/c/../d", Some("a/b/d") ; "parent in path")]
#[test_case("/sensors/", "/room1", Some("sensors/room1") ; "prefix and path")]
#[test_case("/", "/x/y", Some("x/y") ; "root prefix")]
#[test_case("/", "/x//y/", Some("x/y") ; "collapsed separators")]
#[test_case("", "/x/y", Some("x/y") ; "empty prefix")]
#[test_case("/", "/a/../../b", Some("b") ; "cannot climb above root")]
#[test_case("sensors", "/temp", Some("sensors/temp") ; "relative prefix")]
#[test_case("/", "/", None ; "root only")]
#[test_case("/", "/a/..", None ; "resolves to root")]
#[test_case("", "", None ; "nothing at all")]
#[test_case("a", "/..", None ; "relative prefix cancelled")]
fn test_derive_topic(prefix: &str, path: &str, expected: Option<&str>) {
    assert_eq!(derive_topic(prefix, path).as_deref(), expected);
}

#[test]
fn test_decode_path() {
    assert_eq!(decode_path("/a%20b/c").as_deref(), Some("/a b/c"));
    assert_eq!(decode_path("/plain").as_deref(), Some("/plain"));
    assert_eq!(decode_path("/a+b").as_deref(), Some("/a+b"));
    assert_eq!(decode_path("/%2e%2e/x").as_deref(), Some("/../x"));
    assert!(decode_path("/%FF").is_none());
}

// =============================================================================
// Content Sniffing Tests
// =============================================================================

#[test_case(b"" , "text/plain; charset=utf-8" ; "empty")]
#[test_case(b"\x01\x02\x03", OCTET_STREAM ; "binary")]
#[test_case(b"{\"t\":1}", "text/plain; charset=utf-8" ; "json is text")]
#[test_case(b"  \n\t ", "text/plain; charset=utf-8" ; "whitespace only")]
#[test_case(b"<HtMl><bOdY>blah blah blah</body></html>", "text/html; charset=utf-8" ; "html mixed case")]
#[test_case(b"\n<html>\n<body>", "text/html; charset=utf-8" ; "html after whitespace")]
#[test_case(b"   <!DOCTYPE HTML>...", "text/html; charset=utf-8" ; "doctype")]
#[test_case(b"<a href=\"x\">", "text/html; charset=utf-8" ; "anchor tag")]
#[test_case(b"<!-- comment -->", "text/html; charset=utf-8" ; "html comment")]
#[test_case(b"<html", "text/plain; charset=utf-8" ; "tag needs terminator")]
#[test_case(b"<ab>", "text/plain; charset=utf-8" ; "not an html tag")]
#[test_case(b"\n<?xml!", "text/xml; charset=utf-8" ; "xml")]
#[test_case(b"%PDF-1.7", "application/pdf" ; "pdf")]
#[test_case(b"%!PS-Adobe-3.0\n", "application/postscript" ; "postscript")]
#[test_case(b"\xFE\xFF\x00\x41\x00\x42", "text/plain; charset=utf-16be" ; "utf16 be bom")]
#[test_case(b"\xFF\xFE\x41\x00\x42\x00", "text/plain; charset=utf-16le" ; "utf16 le bom")]
#[test_case(b"\xEF\xBB\xBFhello", "text/plain; charset=utf-8" ; "utf8 bom")]
#[test_case(b"GIF87a", "image/gif" ; "gif87")]
#[test_case(b"GIF89a...", "image/gif" ; "gif89")]
#[test_case(b"\x89PNG\x0D\x0A\x1A\x0A\x00\x00", "image/png" ; "png")]
#[test_case(b"\xFF\xD8\xFF\xE0\x00\x10JFIF", "image/jpeg" ; "jpeg")]
#[test_case(b"BM\x00\x00", "image/bmp" ; "bmp")]
#[test_case(b"RIFF\x10\x20\x30\x40WEBPVP8 ", "image/webp" ; "webp")]
#[test_case(b"RIFF\x10\x20\x30\x40WAVEfmt ", "audio/wave" ; "wave")]
#[test_case(b"RIFF\x10\x20\x30\x40AVI LIST", "video/avi" ; "avi")]
#[test_case(b"FORM\x00\x00\x00\x00AIFF", "audio/aiff" ; "aiff")]
#[test_case(b"ID3\x03\x00", "audio/mpeg" ; "mp3")]
#[test_case(b"OggS\x00\x02", "application/ogg" ; "ogg")]
#[test_case(b"MThd\x00\x00\x00\x06\x00\x01", "audio/midi" ; "midi")]
#[test_case(b"\x00\x00\x00\x18ftypmp42\x00\x00\x00\x00mp42isom<\x06t\xbfmdat", "video/mp4" ; "mp4")]
#[test_case(b"\x1A\x45\xDF\xA3\x01", "video/webm" ; "webm")]
#[test_case(b"\x00\x01\x00\x00\x00", "font/ttf" ; "ttf")]
#[test_case(b"wOFF", "font/woff" ; "woff")]
#[test_case(b"\x1F\x8B\x08\x00", "application/x-gzip" ; "gzip")]
#[test_case(b"PK\x03\x04\x14\x00", "application/zip" ; "zip")]
#[test_case(b"Rar!\x1A\x07\x01\x00", "application/x-rar-compressed" ; "rar5")]
#[test_case(b"\x00asm\x01\x00\x00\x00", "application/wasm" ; "wasm")]
fn test_detect_content_type(data: &[u8], expected: &str) {
    assert_eq!(detect_content_type(data), expected);
}

#[test]
fn test_sniff_inspects_only_leading_bytes() {
    let mut data = vec![b'a'; 512];
    data.push(0x00);
    assert_eq!(detect_content_type(&data), "text/plain; charset=utf-8");

    data[10] = 0x00;
    assert_eq!(detect_content_type(&data), OCTET_STREAM);
}

#[test]
fn test_sniff_eot_font() {
    let mut data = vec![0u8; 34];
    data.extend_from_slice(b"LP");
    assert_eq!(detect_content_type(&data), "application/vnd.ms-fontobject");
}

// =============================================================================
// Handler Tests
// =============================================================================

#[test_case(Method::GET ; "get")]
#[test_case(Method::DELETE ; "delete")]
#[test_case(Method::HEAD ; "head")]
#[test_case(Method::PATCH ; "patch")]
#[test_case(Method::OPTIONS ; "options")]
#[tokio::test]
async fn test_only_put_and_post_accepted(method: Method) {
    let (handler, publisher) = handler_with(BridgeConfig::default());

    let response = handler.handle(request(method, "/x/y", b"payload")).await;

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.headers().get(ALLOW).unwrap(), "POST, PUT");
    assert_eq!(body_string(response).await, "only POST and PUT are supported\n");
    assert!(publisher.calls().is_empty());
}

#[test_case(Method::PUT ; "put")]
#[test_case(Method::POST ; "post")]
#[tokio::test]
async fn test_publish_body_to_derived_topic(method: Method) {
    let config = BridgeConfig {
        qos: QoS::AtLeastOnce,
        ..Default::default()
    };
    let (handler, publisher) = handler_with(config);

    let response = handler.handle(request(method, "/x/y", b"{\"t\":1}")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "");
    assert_eq!(
        publisher.calls(),
        vec![Call {
            topic: "x/y".to_string(),
            qos: QoS::AtLeastOnce,
            retain: false,
            payload: Bytes::from_static(b"{\"t\":1}"),
        }]
    );
}

#[tokio::test]
async fn test_prefix_joined_with_path() {
    let config = BridgeConfig {
        prefix: "/sensors/".to_string(),
        ..Default::default()
    };
    let (handler, publisher) = handler_with(config);

    let response = handler.handle(request(Method::PUT, "/room1", b"21.5")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(publisher.calls()[0].topic, "sensors/room1");
}

#[tokio::test]
async fn test_empty_body_is_published() {
    let (handler, publisher) = handler_with(BridgeConfig::default());

    let response = handler.handle(request(Method::POST, "/empty", b"")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(publisher.calls()[0].payload, Bytes::new());
}

#[test_case("/" ; "root")]
#[test_case("/a/.." ; "resolves to root")]
#[test_case("/./." ; "dots only")]
#[tokio::test]
async fn test_empty_topic_rejected(path: &str) {
    let (handler, publisher) = handler_with(BridgeConfig::default());

    let response = handler.handle(request(Method::PUT, path, b"x")).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_string(response).await, "got empty path without prefix\n");
    assert!(publisher.calls().is_empty());
}

#[tokio::test]
async fn test_percent_encoded_path_is_decoded() {
    let (handler, publisher) = handler_with(BridgeConfig::default());

    let response = handler
        .handle(request(Method::PUT, "/living%20room/temp", b"20"))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(publisher.calls()[0].topic, "living room/temp");
}

#[tokio::test]
async fn test_invalid_utf8_path_rejected() {
    let (handler, publisher) = handler_with(BridgeConfig::default());

    let response = handler.handle(request(Method::PUT, "/bad%FF", b"x")).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_string(response).await, "invalid request path\n");
    assert!(publisher.calls().is_empty());
}

#[tokio::test]
async fn test_body_read_error() {
    let (handler, publisher) = handler_with(BridgeConfig::default());
    let req = Request::builder()
        .method(Method::PUT)
        .uri("/x")
        .body(FailingBody)
        .unwrap();

    let response = handler.handle(req).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_string(response).await, "error while reading body\n");
    assert!(publisher.calls().is_empty());
}

#[tokio::test]
async fn test_body_read_error_with_limit() {
    let config = BridgeConfig {
        max_body_size: 1024,
        ..Default::default()
    };
    let (handler, _publisher) = handler_with(config);
    let req = Request::builder()
        .method(Method::PUT)
        .uri("/x")
        .body(FailingBody)
        .unwrap();

    let response = handler.handle(req).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_body_size_limit() {
    let config = BridgeConfig {
        max_body_size: 4,
        ..Default::default()
    };
    let (handler, publisher) = handler_with(config);

    let response = handler.handle(request(Method::PUT, "/x", b"0123456789")).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(publisher.calls().is_empty());

    let response = handler.handle(request(Method::PUT, "/x", b"0123")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(publisher.calls().len(), 1);
}

#[test_case(PublishError::NotConnected, StatusCode::SERVICE_UNAVAILABLE ; "not connected")]
#[test_case(PublishError::ConnectionLost, StatusCode::SERVICE_UNAVAILABLE ; "connection lost")]
#[test_case(PublishError::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE ; "shutting down")]
#[test_case(PublishError::InflightFull, StatusCode::SERVICE_UNAVAILABLE ; "inflight full")]
#[test_case(PublishError::Rejected(ReasonCode::NotAuthorized), StatusCode::BAD_GATEWAY ; "rejected")]
#[test_case(PublishError::Timeout, StatusCode::GATEWAY_TIMEOUT ; "timeout")]
#[test_case(PublishError::PacketTooLarge, StatusCode::PAYLOAD_TOO_LARGE ; "too large")]
#[test_case(PublishError::Encode(EncodeError::InvalidTopicName), StatusCode::BAD_REQUEST ; "encode")]
#[tokio::test]
async fn test_publish_failure_status(error: PublishError, expected: StatusCode) {
    assert_eq!(publish_error_status(&error), expected);

    let publisher = Arc::new(RecordingPublisher::failing(error.clone()));
    let handler = BridgeHandler::new(BridgeConfig::default(), publisher.clone());

    let response = handler.handle(request(Method::PUT, "/x", b"x")).await;

    assert_eq!(response.status(), expected);
    assert_eq!(
        response.headers().get(RETRY_AFTER).is_some(),
        error == PublishError::InflightFull
    );
    assert_eq!(body_string(response).await, format!("{}\n", error));
    assert_eq!(publisher.calls().len(), 1);
}

#[tokio::test]
async fn test_concurrent_requests_do_not_cross() {
    let (handler, publisher) = handler_with(BridgeConfig::default());

    let mut tasks = Vec::new();
    for i in 0..32 {
        let handler = handler.clone();
        tasks.push(tokio::spawn(async move {
            let req = Request::builder()
                .method(Method::PUT)
                .uri(format!("/device/{}", i))
                .body(Full::new(Bytes::from(i.to_string())))
                .unwrap();
            handler.handle(req).await.status()
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), StatusCode::OK);
    }

    let calls = publisher.calls();
    assert_eq!(calls.len(), 32);
    for call in calls {
        let id = call.topic.strip_prefix("device/").unwrap();
        assert_eq!(call.payload, Bytes::from(id.to_string()));
    }
}

#[tokio::test]
async fn test_handler_records_metrics() {
    let metrics = Arc::new(Metrics::new());
    let publisher = Arc::new(RecordingPublisher::default());
    let config = BridgeConfig {
        qos: QoS::ExactlyOnce,
        ..Default::default()
    };
    let handler = BridgeHandler::new(config, publisher).with_metrics(metrics.clone());

    handler.handle(request(Method::PUT, "/a", b"12345")).await;
    handler.handle(request(Method::GET, "/a", b"")).await;

    let status = |s: &str| metrics.http_requests_total.with_label_values(&[s]).get();
    assert_eq!(status("200"), 1);
    assert_eq!(status("405"), 1);
    assert_eq!(
        metrics
            .publishes_total
            .with_label_values(&["2", "ok"])
            .get(),
        1
    );
    assert_eq!(metrics.publish_bytes_total.get(), 5);
}

// =============================================================================
// Property Tests
// =============================================================================

mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    /// Request paths made of names, `.` and empty segments, never `..`
    fn plain_path() -> impl Strategy<Value = String> {
        proptest::collection::vec(
            prop_oneof![Just(String::new()), Just(".".to_string()), "[a-z]{1,4}"],
            0..8,
        )
        .prop_map(|segments| format!("/{}", segments.join("/")))
    }

    proptest! {
        #[test]
        fn clean_is_idempotent(path in "[a-z./]{0,32}") {
            let once = clean(&path);
            prop_assert_eq!(clean(&once), once);
        }

        #[test]
        fn derive_topic_is_idempotent_under_clean(
            prefix in "[a-z./]{0,8}",
            path in plain_path(),
        ) {
            prop_assert_eq!(
                derive_topic(&prefix, &path),
                derive_topic(&prefix, &clean(&path))
            );
        }

        #[test]
        fn rooted_topics_are_canonical(path in "[a-z./]{0,32}") {
            if let Some(topic) = derive_topic("/", &path) {
                prop_assert!(!topic.is_empty());
                prop_assert!(!topic.starts_with('/'));
                prop_assert!(!topic.ends_with('/'));
                prop_assert!(!topic.contains("//"));
                prop_assert!(topic.split('/').all(|s| s != "." && s != ".."));
                prop_assert_eq!(derive_topic("/", &topic), Some(topic.clone()));
            }
        }

        #[test]
        fn sniffer_never_panics(data in proptest::collection::vec(any::<u8>(), 0..600)) {
            let ct = detect_content_type(&data);
            prop_assert!(!ct.is_empty());
        }
    }
}
