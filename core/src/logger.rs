//! Structured per-call log record.
//!
//! # Design
//! The client emits at most one record per call through the `Logger` trait,
//! so the sink is swappable and a client without a logger stays silent.
//! `TracingLogger` forwards records to `tracing`, rendering the fields as
//! one JSON object because event field names must be static.

use std::collections::BTreeMap;

use http::HeaderMap;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::context::CallContext;

/// Field keys used in the call record.
pub mod keys {
    pub const SERVICE_NAME: &str = "service_name";
    pub const HEADER: &str = "header";
    pub const METHOD: &str = "method";
    pub const API: &str = "api";
    pub const URI: &str = "uri";
    pub const REQUEST: &str = "request";
    pub const RESPONSE: &str = "response";
    pub const SERVER_IP: &str = "server_ip";
    pub const SERVER_PORT: &str = "server_port";
    pub const CODE: &str = "code";
    pub const COST: &str = "cost";
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub key: &'static str,
    pub value: Value,
}

impl Field {
    /// Capture any serializable value. A value that fails to serialize is
    /// recorded as its error text.
    pub fn reflect(key: &'static str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or_else(|e| Value::String(e.to_string()));
        Self { key, value }
    }
}

pub trait Logger: Send + Sync {
    fn info(&self, ctx: &CallContext, message: &str, fields: &[Field]);

    fn error(&self, ctx: &CallContext, message: &str, fields: &[Field]);
}

/// Render fields as a JSON object, later keys winning.
pub fn fields_to_value(fields: &[Field]) -> Value {
    let map: Map<String, Value> = fields
        .iter()
        .map(|f| (f.key.to_string(), f.value.clone()))
        .collect();
    Value::Object(map)
}

/// Headers as `name -> [values]`. Non-UTF-8 values are replaced lossily.
pub fn headers_to_value(headers: &HeaderMap) -> Value {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    Field::reflect("", map).value
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn info(&self, _ctx: &CallContext, message: &str, fields: &[Field]) {
        tracing::info!(target: "rpc_transport::call", fields = %fields_to_value(fields), "{message}");
    }

    fn error(&self, _ctx: &CallContext, message: &str, fields: &[Field]) {
        tracing::error!(target: "rpc_transport::call", fields = %fields_to_value(fields), "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use serde_json::json;

    #[test]
    fn reflect_captures_structs() {
        #[derive(Serialize)]
        struct Body {
            ok: bool,
        }
        let field = Field::reflect(keys::RESPONSE, Body { ok: true });
        assert_eq!(field.value, json!({"ok": true}));
    }

    #[test]
    fn fields_render_as_object() {
        let fields = vec![
            Field::reflect(keys::SERVICE_NAME, "user-svc"),
            Field::reflect(keys::CODE, 200),
        ];
        assert_eq!(fields_to_value(&fields), json!({"service_name": "user-svc", "code": 200}));
    }

    #[test]
    fn headers_group_repeated_names() {
        let mut headers = HeaderMap::new();
        headers.append("x-tag", HeaderValue::from_static("a"));
        headers.append("x-tag", HeaderValue::from_static("b"));
        headers.insert("accept", HeaderValue::from_static("application/json"));
        assert_eq!(
            headers_to_value(&headers),
            json!({"accept": ["application/json"], "x-tag": ["a", "b"]})
        );
    }

    #[test]
    fn tracing_logger_accepts_records_without_subscriber() {
        let fields = vec![Field::reflect(keys::COST, 3)];
        TracingLogger.info(&CallContext::new(), "rpc success", &fields);
        TracingLogger.error(&CallContext::new(), "http code is 500", &fields);
    }
}
