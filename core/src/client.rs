//! The RPC client: one call from service name to decoded response.
//!
//! # Design
//! `RpcClient` is built once and immutable afterwards; clones share the same
//! registry, channel cache and hooks, so one client serves any number of
//! concurrent calls. A call runs strictly in order:
//!
//! validate → resolve → pick → build → deadline header → pre-flight
//! cancellation check → before-hooks → dispatch → `done` → after-hooks →
//! status check → read + decode → log.
//!
//! Once a node has been picked, `done` is called exactly once, whatever
//! happens afterwards, with the raw outcome of the attempt. Nothing is
//! retried here; `Error::is_retryable` is the caller's signal.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::{StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::channel::{Channel, ChannelBuilder, Credentials};
use crate::config::{HookErrorPolicy, TransportConfig};
use crate::context::{CallContext, SERVICE_NAME};
use crate::deadline;
use crate::error::Error;
use crate::logger::{headers_to_value, keys, Field, Logger};
use crate::plugin::{snapshot, AfterPlugin, BeforePlugin, OutgoingRequest, Pipeline, RequestSnapshot};
use crate::request::{Request, RequestBody};
use crate::response::{Response, Timing};
use crate::servicer::{Node, ServiceRegistry, Servicer};

struct Inner {
    registry: Arc<ServiceRegistry>,
    channels: ChannelBuilder,
    pipeline: Pipeline,
    logger: Option<Arc<dyn Logger>>,
}

/// Client for calling named services.
///
/// Cheap to clone; clones share the registry, the channel cache, the hooks
/// and the logger. Construct with `RpcClient::builder`.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("registry", &self.inner.registry)
            .field("before_plugins", &self.inner.pipeline.before_len())
            .field("after_plugins", &self.inner.pipeline.after_len())
            .field("logger", &self.inner.logger.is_some())
            .finish()
    }
}

/// Collects the options of an `RpcClient`. Nothing can be changed once
/// `build` has run.
pub struct RpcClientBuilder {
    registry: Arc<ServiceRegistry>,
    config: TransportConfig,
    logger: Option<Arc<dyn Logger>>,
    before: Vec<Arc<dyn BeforePlugin>>,
    after: Vec<Arc<dyn AfterPlugin>>,
}

impl RpcClientBuilder {
    /// Pool, dial and hook policy. Defaults to `TransportConfig::default()`.
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Sink for the per-call record. Without one, calls are not logged.
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Replace the before-hooks.
    pub fn before_plugins(mut self, plugins: Vec<Arc<dyn BeforePlugin>>) -> Self {
        self.before = plugins;
        self
    }

    /// Append one before-hook; hooks run in the order they were added.
    pub fn before_plugin(mut self, plugin: Arc<dyn BeforePlugin>) -> Self {
        self.before.push(plugin);
        self
    }

    /// Replace the after-hooks.
    pub fn after_plugins(mut self, plugins: Vec<Arc<dyn AfterPlugin>>) -> Self {
        self.after = plugins;
        self
    }

    /// Append one after-hook; hooks run in the order they were added.
    pub fn after_plugin(mut self, plugin: Arc<dyn AfterPlugin>) -> Self {
        self.after.push(plugin);
        self
    }

    /// Override the hook error policy from the config.
    pub fn hook_error_policy(mut self, policy: HookErrorPolicy) -> Self {
        self.config.hook_error_policy = policy;
        self
    }

    /// Freeze the options into a client with an empty channel cache.
    pub fn build(self) -> RpcClient {
        let pipeline = Pipeline::new(self.before, self.after, self.config.hook_error_policy);
        RpcClient {
            inner: Arc::new(Inner {
                registry: self.registry,
                channels: ChannelBuilder::new(self.config),
                pipeline,
                logger: self.logger,
            }),
        }
    }
}

/// What the network attempt produced, up to response headers.
struct Attempt {
    snapshot: Option<RequestSnapshot>,
    result: Result<(http::response::Parts, Incoming, Channel), Error>,
    cost: Duration,
}

impl Attempt {
    fn failed(snapshot: Option<RequestSnapshot>, err: Error) -> Self {
        Self {
            snapshot,
            result: Err(err),
            cost: Duration::ZERO,
        }
    }
}

impl RpcClient {
    /// Start building a client that resolves service names in `registry`.
    pub fn builder(registry: Arc<ServiceRegistry>) -> RpcClientBuilder {
        RpcClientBuilder {
            registry,
            config: TransportConfig::default(),
            logger: None,
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    /// Registry the client resolves service names in. Servicers may be added
    /// or removed while the client is in use.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.inner.registry
    }

    /// The connection cache, for inspection.
    pub fn channels(&self) -> &ChannelBuilder {
        &self.inner.channels
    }

    /// Send `request` to a node of its service and decode into `response`.
    ///
    /// `response.http_code` and `response.timing` are written even when the
    /// call fails after a response was received.
    pub async fn send<T>(&self, ctx: &CallContext, request: &mut Request, response: &mut Response<T>) -> Result<(), Error>
    where
        T: DeserializeOwned + Serialize + Send,
    {
        validate(request, response)?;

        let service_name = request.service_name.clone();
        let servicer = self
            .inner
            .registry
            .get(&service_name)
            .ok_or_else(|| Error::ServiceNotFound(service_name.clone()))?;

        let node = match servicer.pick(ctx).await {
            Ok(Some(node)) => node,
            Ok(None) => return Err(Error::NodeSelection("node nil".to_string())),
            Err(err) => return Err(Error::NodeSelection(err.to_string())),
        };
        debug!(service = %service_name, address = %node.address(), "picked node");

        let mut ctx = ctx.with_value(SERVICE_NAME, service_name);
        let result = self
            .call(&mut ctx, servicer.as_ref(), node.as_ref(), request, response)
            .await;
        self.log(&ctx, request, response, node.as_ref(), result.as_ref().err());
        result
    }

    async fn call<T>(
        &self,
        ctx: &mut CallContext,
        servicer: &dyn Servicer,
        node: &dyn Node,
        request: &mut Request,
        response: &mut Response<T>,
    ) -> Result<(), Error>
    where
        T: DeserializeOwned + Send,
    {
        let Attempt { snapshot, result, cost } = self.attempt(ctx, servicer, node, request).await;
        response.timing = Timing {
            request: cost,
            decode: Duration::ZERO,
        };

        if let Err(err) = servicer.done(ctx, node, result.as_ref().err()).await {
            debug!(service = servicer.name(), error = %err, "servicer done failed");
        }

        let after = match &snapshot {
            Some(snapshot) => {
                let head = result.as_ref().ok().map(|(parts, _, _)| parts);
                self.inner.pipeline.run_after(ctx, snapshot, head).await
            }
            None => Ok(()),
        };

        let (parts, body, channel) = result?;
        response.http_code = parts.status.as_u16();
        after?;

        if parts.status != StatusCode::OK {
            return Err(Error::HttpStatus(parts.status.as_u16()));
        }

        let start = Instant::now();
        let decoded = self.decode(ctx, body, channel, response).await;
        response.timing.decode = start.elapsed();
        decoded
    }

    async fn attempt(
        &self,
        ctx: &mut CallContext,
        servicer: &dyn Servicer,
        node: &dyn Node,
        request: &mut Request,
    ) -> Attempt {
        let secure = Credentials::from_servicer(servicer).is_some();
        let mut outgoing = match build_request(request, node, secure) {
            Ok(outgoing) => outgoing,
            Err(err) => return Attempt::failed(None, err),
        };
        if let Err(err) = deadline::inject(ctx, outgoing.headers_mut()) {
            return Attempt::failed(Some(snapshot(&outgoing)), err);
        }

        if let Some(reason) = ctx.err() {
            return Attempt::failed(Some(snapshot(&outgoing)), Error::Cancelled(reason));
        }

        if let Err(err) = self.inner.pipeline.run_before(ctx, &mut outgoing).await {
            return Attempt::failed(Some(snapshot(&outgoing)), err);
        }

        let sent = snapshot(&outgoing);
        let start = Instant::now();
        let result = self.dispatch(ctx, servicer, node, outgoing).await;
        Attempt {
            snapshot: Some(sent),
            result,
            cost: start.elapsed(),
        }
    }

    async fn dispatch(
        &self,
        ctx: &CallContext,
        servicer: &dyn Servicer,
        node: &dyn Node,
        outgoing: OutgoingRequest,
    ) -> Result<(http::response::Parts, Incoming, Channel), Error> {
        let mut channel = self.inner.channels.checkout(ctx, servicer, node).await?;
        let response = ctx
            .guard(channel.send(outgoing))
            .await
            .map_err(Error::Cancelled)??;
        let (parts, body) = response.into_parts();
        Ok((parts, body, channel))
    }

    async fn decode<T>(&self, ctx: &CallContext, body: Incoming, channel: Channel, response: &mut Response<T>) -> Result<(), Error>
    where
        T: DeserializeOwned,
    {
        let codec = response
            .codec
            .clone()
            .ok_or_else(|| Error::Validation("response codec is nil".to_string()))?;

        let bytes = ctx
            .guard(body.collect())
            .await
            .map_err(Error::Cancelled)?
            .map_err(|e| Error::Transport(format!("read response body: {e}")))?
            .to_bytes();
        channel.release();

        let value = codec.decode(&bytes).map_err(|e| Error::Decode(e.to_string()))?;
        response.body = serde_json::from_value(value).map_err(|e| Error::Decode(e.to_string()))?;
        Ok(())
    }

    fn log<T: Serialize>(
        &self,
        ctx: &CallContext,
        request: &Request,
        response: &Response<T>,
        node: &dyn Node,
        err: Option<&Error>,
    ) {
        let Some(logger) = &self.inner.logger else {
            return;
        };

        let cost = u64::try_from(response.timing.total().as_millis()).unwrap_or(u64::MAX);
        let fields = vec![
            Field::reflect(keys::SERVICE_NAME, &request.service_name),
            Field {
                key: keys::HEADER,
                value: headers_to_value(&request.headers),
            },
            Field::reflect(keys::METHOD, request.method.as_str()),
            Field::reflect(keys::API, &request.path),
            Field::reflect(keys::URI, request.uri()),
            Field::reflect(keys::REQUEST, request.loggable_body()),
            Field::reflect(keys::RESPONSE, &response.body),
            Field::reflect(keys::SERVER_IP, node.host()),
            Field::reflect(keys::SERVER_PORT, node.port()),
            Field::reflect(keys::CODE, response.http_code),
            Field::reflect(keys::COST, cost),
        ];

        match err {
            Some(err) => logger.error(ctx, &err.to_string(), &fields),
            None => logger.info(ctx, "rpc success", &fields),
        }
    }
}

fn validate<T>(request: &Request, response: &Response<T>) -> Result<(), Error> {
    if request.codec.is_none() {
        return Err(Error::Validation("request codec is nil".to_string()));
    }
    if response.codec.is_none() {
        return Err(Error::Validation("response codec is nil".to_string()));
    }
    if request.service_name.is_empty() {
        return Err(Error::Validation("service name is empty".to_string()));
    }
    if !request.path.is_empty() && !request.path.starts_with('/') {
        return Err(Error::Validation(format!("path {:?} must start with '/'", request.path)));
    }
    Ok(())
}

/// Build the wire request for `node`. The URL authority and the `Host`
/// header are always the node's address, whatever the caller set; the
/// caller's other headers are attached after encoding because codecs may add
/// to them.
pub(crate) fn build_request(request: &mut Request, node: &dyn Node, secure: bool) -> Result<OutgoingRequest, Error> {
    let address = node.address();
    let uri = Uri::builder()
        .scheme(if secure { "https" } else { "http" })
        .authority(address.as_str())
        .path_and_query(request.uri())
        .build()
        .map_err(|e| Error::RequestBuild(format!("build url: {e}")))?;

    let codec = request
        .codec
        .clone()
        .ok_or_else(|| Error::Validation("request codec is nil".to_string()))?;
    let body: Bytes = match &request.body {
        RequestBody::Single(value) => codec.encode(Some(value), &mut request.headers),
        RequestBody::Multipart => codec.encode(None, &mut request.headers),
    }
    .map_err(|e| Error::RequestBuild(e.to_string()))?;

    let mut outgoing = http::Request::builder()
        .method(request.method.clone())
        .uri(uri)
        .body(Full::new(body))
        .map_err(|e| Error::RequestBuild(e.to_string()))?;

    let host = HeaderValue::from_str(&address).map_err(|e| Error::RequestBuild(format!("host header: {e}")))?;
    *outgoing.headers_mut() = request.headers.clone();
    outgoing.headers_mut().insert(HOST, host);
    Ok(outgoing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonCodec, MultipartCodec};
    use crate::servicer::StaticNode;
    use http::header::CONTENT_TYPE;
    use http::Method;
    use serde_json::json;

    fn node() -> StaticNode {
        StaticNode::new("10.0.0.7", 8081)
    }

    #[test]
    fn url_uses_node_address_not_service_name() {
        let mut req = Request::get("user-svc", "/v1/users")
            .with_query("id", "42")
            .with_codec(Arc::new(JsonCodec));
        let out = build_request(&mut req, &node(), false).unwrap();
        assert_eq!(out.uri().to_string(), "http://10.0.0.7:8081/v1/users?id=42");
        assert_eq!(out.headers()[HOST], "10.0.0.7:8081");
        assert_eq!(out.method(), Method::GET);
    }

    #[test]
    fn caller_host_header_is_replaced_by_node_address() {
        let mut req = Request::get("user-svc", "/v1/ping")
            .with_header(HOST, HeaderValue::from_static("evil.example:1"))
            .with_codec(Arc::new(JsonCodec));
        let out = build_request(&mut req, &node(), false).unwrap();
        let hosts: Vec<&str> = out
            .headers()
            .get_all(HOST)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(hosts, vec!["10.0.0.7:8081"]);
    }

    #[test]
    fn path_with_spaces_and_question_mark_is_escaped() {
        let mut req = Request::get("user-svc", "/v1/users/ada lovelace")
            .with_codec(Arc::new(JsonCodec));
        let out = build_request(&mut req, &node(), false).unwrap();
        assert_eq!(out.uri().path(), "/v1/users/ada%20lovelace");
        assert_eq!(out.uri().query(), None);

        let mut req = Request::get("user-svc", "/v1/files/what?.txt")
            .with_query("v", "2")
            .with_codec(Arc::new(JsonCodec));
        let out = build_request(&mut req, &node(), false).unwrap();
        assert_eq!(out.uri().path(), "/v1/files/what%3F.txt");
        assert_eq!(out.uri().query(), Some("v=2"));
    }

    #[test]
    fn secure_requests_use_https_scheme() {
        let mut req = Request::get("user-svc", "/v1/ping").with_codec(Arc::new(JsonCodec));
        let out = build_request(&mut req, &node(), true).unwrap();
        assert_eq!(out.uri().scheme_str(), Some("https"));
    }

    #[test]
    fn encoder_headers_reach_the_wire() {
        let codec = MultipartCodec::new().text("k", "v");
        let mut req = Request::post("upload-svc", "/v1/files")
            .multipart()
            .with_codec(Arc::new(codec));
        let out = build_request(&mut req, &node(), false).unwrap();
        let content_type = out.headers()[CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("multipart/form-data; boundary="));
        assert_eq!(req.headers[CONTENT_TYPE], out.headers()[CONTENT_TYPE]);
    }

    #[test]
    fn variant_mismatch_is_build_error() {
        let mut req = Request::post("user-svc", "/v1/users")
            .multipart()
            .with_codec(Arc::new(JsonCodec));
        let err = build_request(&mut req, &node(), false).unwrap_err();
        assert!(matches!(err, Error::RequestBuild(_)));
    }

    #[test]
    fn json_body_is_encoded() {
        let mut req = Request::post("user-svc", "/v1/users")
            .with_body(json!({"name": "ada"}))
            .with_codec(Arc::new(JsonCodec));
        let out = build_request(&mut req, &node(), false).unwrap();
        assert_eq!(out.headers()[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn validation_requires_codecs() {
        let req = Request::get("user-svc", "/v1/ping");
        let resp: Response<serde_json::Value> = Response::new(Arc::new(JsonCodec));
        assert!(matches!(validate(&req, &resp), Err(Error::Validation(_))));

        let req = req.with_codec(Arc::new(JsonCodec));
        let resp: Response<serde_json::Value> = Response {
            http_code: 0,
            body: serde_json::Value::Null,
            codec: None,
            timing: Timing::default(),
        };
        assert!(matches!(validate(&req, &resp), Err(Error::Validation(_))));
    }

    #[test]
    fn validation_rejects_relative_path() {
        let req = Request::get("user-svc", "v1/ping").with_codec(Arc::new(JsonCodec));
        let resp: Response<serde_json::Value> = Response::new(Arc::new(JsonCodec));
        assert!(matches!(validate(&req, &resp), Err(Error::Validation(_))));
    }

    #[test]
    fn validation_rejects_empty_service_name() {
        let req = Request::get("", "/v1/ping").with_codec(Arc::new(JsonCodec));
        let resp: Response<serde_json::Value> = Response::new(Arc::new(JsonCodec));
        assert!(matches!(validate(&req, &resp), Err(Error::Validation(_))));
    }
}
