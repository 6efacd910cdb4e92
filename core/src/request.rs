//! Request descriptor handed to `RpcClient::send`.
//!
//! # Design
//! The body is a closed enum instead of a type switch: a single body is
//! encoded by the codec, a multipart request lets the codec produce the whole
//! payload. The request never names a host; the destination comes from the
//! node the servicer picks.

use std::fmt;
use std::sync::Arc;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use serde_json::Value;

use crate::codec::{encode_pairs, Codec};

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// One value encoded by the request codec. `Value::Null` means no body.
    Single(Value),
    /// The codec builds the payload from its own parts.
    Multipart,
}

impl Default for RequestBody {
    fn default() -> Self {
        RequestBody::Single(Value::Null)
    }
}

#[derive(Clone)]
pub struct Request {
    pub service_name: String,
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: RequestBody,
    pub codec: Option<Arc<dyn Codec>>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("service_name", &self.service_name)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("codec", &self.codec)
            .finish()
    }
}

impl Request {
    pub fn new(service_name: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::default(),
            codec: None,
        }
    }

    pub fn get(service_name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(service_name, Method::GET, path)
    }

    pub fn post(service_name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(service_name, Method::POST, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = RequestBody::Single(body);
        self
    }

    pub fn multipart(mut self) -> Self {
        self.body = RequestBody::Multipart;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// The encoded query string, without the leading `?`.
    pub fn raw_query(&self) -> String {
        encode_pairs(self.query.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// The path with every segment percent-encoded. `/` separators are
    /// kept; a literal `?` or `#` stays part of the path.
    pub fn escaped_path(&self) -> String {
        if self.path.is_empty() {
            return "/".to_string();
        }
        self.path
            .split('/')
            .map(urlencoding::encode)
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Path plus query, as sent on the request line.
    pub fn uri(&self) -> String {
        let path = self.escaped_path();
        let query = self.raw_query();
        if query.is_empty() {
            path
        } else {
            format!("{path}?{query}")
        }
    }

    /// The body as recorded in the call log.
    pub(crate) fn loggable_body(&self) -> Value {
        match &self.body {
            RequestBody::Single(value) => value.clone(),
            RequestBody::Multipart => Value::String("<multipart>".to_string()),
        }
    }
}
