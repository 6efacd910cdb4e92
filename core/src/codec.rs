//! Codec boundary: request bodies to bytes, response bytes to values.
//!
//! # Design
//! A codec sees the body as a `serde_json::Value` so it can be shared as
//! `Arc<dyn Codec>` across requests of any shape; the orchestrator turns the
//! decoded value into the caller's concrete destination type. `encode`
//! receives `None` for multipart requests, where the codec owns the parts.
//! Encoders may set headers (content type, multipart boundary); the caller's
//! headers are attached to the wire request only after encoding.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{codec} codec does not support {what}")]
    Unsupported {
        codec: &'static str,
        what: &'static str,
    },

    #[error("invalid form data: {0}")]
    Form(String),

    #[error("invalid header value: {0}")]
    Header(#[from] http::header::InvalidHeaderValue),
}

/// Converts bodies to and from their wire form.
pub trait Codec: fmt::Debug + Send + Sync {
    /// Encode `body`, or the codec's own parts when `body` is `None`.
    fn encode(&self, body: Option<&Value>, headers: &mut HeaderMap) -> Result<Bytes, CodecError>;

    /// Decode a complete response body.
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

fn set_default_content_type(headers: &mut HeaderMap, value: &'static str) {
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(value));
    }
}

/// Percent-encode key/value pairs as `k=v&k=v`.
pub(crate) fn encode_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, body: Option<&Value>, headers: &mut HeaderMap) -> Result<Bytes, CodecError> {
        match body {
            None => Err(CodecError::Unsupported {
                codec: "json",
                what: "multipart bodies",
            }),
            Some(Value::Null) => Ok(Bytes::new()),
            Some(value) => {
                set_default_content_type(headers, "application/json");
                Ok(Bytes::from(serde_json::to_vec(value)?))
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ---------------------------------------------------------------------------
// Form
// ---------------------------------------------------------------------------

/// `application/x-www-form-urlencoded` bodies from flat JSON objects.
///
/// Arrays become repeated keys; nested objects are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormCodec;

fn scalar_to_string(value: &Value) -> Result<String, CodecError> {
    match value {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Array(_) | Value::Object(_) => {
            Err(CodecError::Form("nested values cannot be form encoded".to_string()))
        }
    }
}

impl Codec for FormCodec {
    fn encode(&self, body: Option<&Value>, headers: &mut HeaderMap) -> Result<Bytes, CodecError> {
        let map = match body {
            None => {
                return Err(CodecError::Unsupported {
                    codec: "form",
                    what: "multipart bodies",
                })
            }
            Some(Value::Null) => return Ok(Bytes::new()),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(CodecError::Form("form body must be an object".to_string())),
        };

        let mut pairs = Vec::new();
        for (key, value) in map {
            match value {
                Value::Array(items) => {
                    for item in items {
                        pairs.push((key.as_str(), scalar_to_string(item)?));
                    }
                }
                other => pairs.push((key.as_str(), scalar_to_string(other)?)),
            }
        }

        set_default_content_type(headers, "application/x-www-form-urlencoded");
        let encoded = encode_pairs(pairs.iter().map(|(k, v)| (*k, v.as_str())));
        Ok(Bytes::from(encoded))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        let raw = std::str::from_utf8(bytes).map_err(|e| CodecError::Form(e.to_string()))?;
        let mut map = Map::new();
        for pair in raw.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = form_unescape(key)?;
            let value = Value::String(form_unescape(value)?);
            match map.get_mut(&key) {
                Some(Value::Array(items)) => items.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    map.insert(key, value);
                }
            }
        }
        Ok(Value::Object(map))
    }
}

fn form_unescape(raw: &str) -> Result<String, CodecError> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .map_err(|e| CodecError::Form(e.to_string()))
}

// ---------------------------------------------------------------------------
// Multipart
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Part {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    data: Bytes,
}

/// `multipart/form-data` encoder that owns its parts.
///
/// Each `encode` call draws a fresh boundary and writes it into the
/// `Content-Type` header, so the codec must be paired with
/// `RequestBody::Multipart`.
#[derive(Debug, Clone, Default)]
pub struct MultipartCodec {
    parts: Vec<Part>,
}

fn quote(value: &str) -> String {
    value.replace('"', "%22").replace(['\r', '\n'], " ")
}

impl MultipartCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(Part {
            name: name.into(),
            filename: None,
            content_type: None,
            data: Bytes::from(value.into()),
        });
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        self.parts.push(Part {
            name: name.into(),
            filename: Some(filename.into()),
            content_type: Some(content_type.into()),
            data: data.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl Codec for MultipartCodec {
    fn encode(&self, body: Option<&Value>, headers: &mut HeaderMap) -> Result<Bytes, CodecError> {
        if body.is_some() {
            return Err(CodecError::Unsupported {
                codec: "multipart",
                what: "single bodies",
            });
        }

        let boundary = format!("rpc-transport-{}", Uuid::new_v4().simple());
        let mut out = BytesMut::new();
        for part in &self.parts {
            out.put_slice(format!("--{boundary}\r\n").as_bytes());
            let mut disposition = format!("Content-Disposition: form-data; name=\"{}\"", quote(&part.name));
            if let Some(filename) = &part.filename {
                disposition.push_str(&format!("; filename=\"{}\"", quote(filename)));
            }
            out.put_slice(disposition.as_bytes());
            out.put_slice(b"\r\n");
            if let Some(content_type) = &part.content_type {
                out.put_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
            }
            out.put_slice(b"\r\n");
            out.put_slice(&part.data);
            out.put_slice(b"\r\n");
        }
        out.put_slice(format!("--{boundary}--\r\n").as_bytes());

        let content_type = HeaderValue::from_str(&format!("multipart/form-data; boundary={boundary}"))?;
        headers.insert(CONTENT_TYPE, content_type);
        Ok(out.freeze())
    }

    fn decode(&self, _bytes: &[u8]) -> Result<Value, CodecError> {
        Err(CodecError::Unsupported {
            codec: "multipart",
            what: "decoding",
        })
    }
}
