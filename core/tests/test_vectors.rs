//! Verify wire-level conversions against JSON test vectors stored in `test-vectors/`.
//!
//! Each vector file pairs inputs with the exact bytes or values another
//! implementation of the protocol must produce, so the files double as a
//! conformance fixture for servers reading the deadline header.

use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use rpc_transport::deadline::{self, TIMEOUT_HEADER};
use rpc_transport::{Codec, Error, FormCodec, JsonCodec, Request};

fn codec(name: &str) -> Arc<dyn Codec> {
    match name {
        "json" => Arc::new(JsonCodec),
        "form" => Arc::new(FormCodec),
        other => panic!("unknown codec: {other}"),
    }
}

// ---------------------------------------------------------------------------
// Deadline
// ---------------------------------------------------------------------------

#[test]
fn deadline_test_vectors() {
    let raw = include_str!("../../test-vectors/deadline.json");
    let vectors: serde_json::Value = serde_json::from_str(raw).unwrap();

    for case in vectors["cases"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let remaining = Duration::from_micros(case["remaining_us"].as_u64().unwrap());
        let value = deadline::header_value(remaining);
        assert_eq!(value, case["header"].as_str().unwrap(), "{name}: header");
    }

    for case in vectors["parse"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            TIMEOUT_HEADER,
            HeaderValue::from_str(case["header"].as_str().unwrap()).unwrap(),
        );
        let expected = case["millis"].as_u64().map(Duration::from_millis);
        assert_eq!(deadline::parse(&headers), expected, "{name}: parse");
    }
}

// ---------------------------------------------------------------------------
// Request line and body
// ---------------------------------------------------------------------------

#[test]
fn request_test_vectors() {
    let raw = include_str!("../../test-vectors/request.json");
    let vectors: serde_json::Value = serde_json::from_str(raw).unwrap();

    for case in vectors["cases"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let mut req = Request::post("vector-svc", case["path"].as_str().unwrap())
            .with_body(case["body"].clone())
            .with_codec(codec(case["codec"].as_str().unwrap()));
        for pair in case["query"].as_array().unwrap() {
            let pair = pair.as_array().unwrap();
            req = req.with_query(pair[0].as_str().unwrap(), pair[1].as_str().unwrap());
        }

        assert_eq!(req.uri(), case["expected_uri"].as_str().unwrap(), "{name}: uri");

        let mut headers = HeaderMap::new();
        let body = req
            .codec
            .as_ref()
            .unwrap()
            .encode(Some(&case["body"]), &mut headers)
            .unwrap();
        let content_type = headers.get(CONTENT_TYPE).map(|v| v.to_str().unwrap());
        assert_eq!(content_type, case["expected_content_type"].as_str(), "{name}: content type");
        assert_eq!(
            std::str::from_utf8(&body).unwrap(),
            case["expected_body"].as_str().unwrap(),
            "{name}: body"
        );
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[test]
fn status_test_vectors() {
    let raw = include_str!("../../test-vectors/status.json");
    let vectors: serde_json::Value = serde_json::from_str(raw).unwrap();

    for case in vectors["cases"].as_array().unwrap() {
        let code = case["code"].as_u64().unwrap() as u16;
        let err = Error::HttpStatus(code);
        assert_eq!(err.to_string(), format!("http code is {code}"));
        assert_eq!(err.is_retryable(), case["retryable"].as_bool().unwrap(), "{code}: retryable");
    }
}
