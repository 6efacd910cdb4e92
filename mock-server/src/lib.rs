use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Extension, Json, Router,
};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::RwLock};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// Header carrying the caller's remaining deadline in milliseconds.
pub const TIMEOUT_HEADER: &str = "timeout-millisecond";

/// One request as the server saw it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub method: String,
    pub path: String,
    pub timeout_ms: Option<u64>,
}

pub type Journal = Arc<RwLock<Vec<Hit>>>;

#[derive(Debug, Serialize, Deserialize)]
pub struct Inspection {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub body_len: usize,
    pub peer: String,
}

#[derive(Deserialize)]
pub struct SlowParams {
    #[serde(default)]
    pub ms: u64,
}

pub fn app() -> Router {
    router(Journal::default())
}

pub fn router(journal: Journal) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/echo", post(echo))
        .route("/v1/status/{code}", any(status))
        .route("/v1/deadline", any(deadline))
        .route("/v1/inspect", any(inspect))
        .route("/v1/slow", get(slow))
        .route("/v1/journal", get(list_journal))
        .layer(middleware::from_fn_with_state(journal.clone(), record))
        .with_state(journal)
}

pub async fn run(listener: TcpListener, journal: Journal) -> Result<(), std::io::Error> {
    axum::serve(
        listener,
        router(journal).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

/// Serve over TLS. Client authentication is whatever `config` demands.
pub async fn run_tls(
    listener: TcpListener,
    config: Arc<rustls::ServerConfig>,
    journal: Journal,
) -> Result<(), std::io::Error> {
    let acceptor = TlsAcceptor::from(config);
    let app = router(journal);
    loop {
        let (stream, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let app = app.clone().layer(Extension(ConnectInfo(peer)));
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(%peer, error = %err, "tls handshake failed");
                    return;
                }
            };
            let service = TowerToHyperService::new(app);
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(%peer, error = %err, "connection closed with error");
            }
        });
    }
}

pub fn timeout_ms(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

async fn record(State(journal): State<Journal>, request: Request, next: Next) -> Response {
    let hit = Hit {
        method: request.method().to_string(),
        path: request.uri().path().to_string(),
        timeout_ms: timeout_ms(request.headers()),
    };
    journal.write().await.push(hit);
    next.run(request).await
}

async fn ping() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn echo(headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| header::HeaderValue::from_static("application/octet-stream"));
    ([(header::CONTENT_TYPE, content_type)], body)
}

async fn status(Path(code): Path<u16>) -> (StatusCode, Json<Value>) {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST);
    (status, Json(json!({ "code": code })))
}

async fn deadline(headers: HeaderMap) -> Json<Value> {
    Json(json!({ "timeout_ms": timeout_ms(&headers) }))
}

async fn inspect(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Inspection> {
    let flat = headers
        .iter()
        .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
        .collect();
    Json(Inspection {
        method: method.to_string(),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        content_type: headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        headers: flat,
        body: String::from_utf8_lossy(&body).into_owned(),
        body_len: body.len(),
        peer: peer.to_string(),
    })
}

async fn slow(Query(params): Query<SlowParams>) -> Json<Value> {
    tokio::time::sleep(Duration::from_millis(params.ms)).await;
    Json(json!({ "ok": true, "slept_ms": params.ms }))
}

async fn list_journal(State(journal): State<Journal>) -> Json<Vec<Hit>> {
    Json(journal.read().await.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn timeout_header_parses_millis() {
        let mut headers = HeaderMap::new();
        headers.insert(TIMEOUT_HEADER, HeaderValue::from_static("1500"));
        assert_eq!(timeout_ms(&headers), Some(1500));
    }

    #[test]
    fn missing_or_garbled_timeout_is_none() {
        let mut headers = HeaderMap::new();
        assert_eq!(timeout_ms(&headers), None);
        headers.insert(TIMEOUT_HEADER, HeaderValue::from_static("soon"));
        assert_eq!(timeout_ms(&headers), None);
    }

    #[test]
    fn slow_params_default_to_zero() {
        let params: SlowParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.ms, 0);
    }

    #[test]
    fn hit_roundtrips_through_json() {
        let hit = Hit {
            method: "GET".to_string(),
            path: "/v1/ping".to_string(),
            timeout_ms: Some(10),
        };
        let back: Hit = serde_json::from_value(serde_json::to_value(&hit).unwrap()).unwrap();
        assert_eq!(back, hit);
    }
}
