//! Contract tests for [`HttpSseTransport`] against a mocked HTTP+SSE backend:
//! the `endpoint`/`message` handshake this transport requires (SPEC_FULL
//! §4.B), exercised over a real HTTP connection instead of an in-memory
//! double.

use std::time::Duration;

use airs_mcp_router::error::TransportError;
use airs_mcp_router::transport::{HttpSseTransport, HttpSseTransportConfig, Transport};
use reqwest::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sse_body(endpoint: &str, frame: &str) -> String {
    format!("event: endpoint\ndata: {endpoint}\n\nevent: message\ndata: {frame}\n\n")
}

#[tokio::test]
async fn handshake_then_message_round_trip_then_uplink_post() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(sse_body(
                    "/messages",
                    r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#,
                ))
                .insert_header("content-type", "text/event-stream"),
        )
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let sse_url = Url::parse(&format!("{}/sse", mock_server.uri())).unwrap();
    let mut transport = HttpSseTransport::new(sse_url, HttpSseTransportConfig::default());
    transport.start().await.expect("handshake must succeed");

    let frame = transport.read().await.expect("message frame must arrive");
    assert_eq!(
        String::from_utf8(frame).unwrap(),
        r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#
    );

    transport
        .write(br#"{"jsonrpc":"2.0","method":"ping","id":2}"#)
        .await
        .expect("uplink post must succeed");
}

#[tokio::test]
async fn stream_closing_before_any_endpoint_event_fails_handshake() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("event: message\ndata: {\"jsonrpc\":\"2.0\"}\n\n")
                .insert_header("content-type", "text/event-stream"),
        )
        .mount(&mock_server)
        .await;

    let sse_url = Url::parse(&format!("{}/sse", mock_server.uri())).unwrap();
    let mut transport = HttpSseTransport::new(sse_url, HttpSseTransportConfig::default());

    let err = transport
        .start()
        .await
        .expect_err("stream ending with no endpoint event must not start");
    assert!(matches!(err, TransportError::Handshake(_)));
}

#[tokio::test]
async fn cross_origin_endpoint_fails_handshake() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(sse_body("http://evil.example/messages", "{}"))
                .insert_header("content-type", "text/event-stream"),
        )
        .mount(&mock_server)
        .await;

    let sse_url = Url::parse(&format!("{}/sse", mock_server.uri())).unwrap();
    let mut transport = HttpSseTransport::new(sse_url, HttpSseTransportConfig::default());

    let err = transport
        .start()
        .await
        .expect_err("cross-origin endpoint must be rejected");
    assert!(matches!(err, TransportError::Handshake(_)));
}

#[tokio::test]
async fn non_success_status_fails_handshake() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let sse_url = Url::parse(&format!("{}/sse", mock_server.uri())).unwrap();
    let config = HttpSseTransportConfig {
        handshake_timeout: Duration::from_millis(500),
        ..HttpSseTransportConfig::default()
    };
    let mut transport = HttpSseTransport::new(sse_url, config);

    let err = transport
        .start()
        .await
        .expect_err("non-2xx response must not start the transport");
    assert!(matches!(err, TransportError::Handshake(_)));
}
