//! Before/after hooks around the network call.
//!
//! # Design
//! Hooks run one after another in registration order. A before-hook may
//! rewrite the outgoing request (trace headers, auth) and hand back a new
//! context; after-hooks see the response head, or `None` when the network
//! attempt failed. What happens on a hook error is decided by
//! `HookErrorPolicy`, never by the hook.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::channel::OutgoingBody;
use crate::config::HookErrorPolicy;
use crate::context::CallContext;
use crate::error::Error;

/// The wire request as before-hooks see it.
pub type OutgoingRequest = http::Request<OutgoingBody>;

/// Body-less copy of the wire request handed to after-hooks.
pub type RequestSnapshot = http::Request<()>;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct PluginError(pub String);

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[async_trait]
pub trait BeforePlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &CallContext, request: &mut OutgoingRequest) -> Result<CallContext, PluginError>;
}

#[async_trait]
pub trait AfterPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(
        &self,
        ctx: &CallContext,
        request: &RequestSnapshot,
        response: Option<&http::response::Parts>,
    ) -> Result<CallContext, PluginError>;
}

#[derive(Clone, Default)]
pub struct Pipeline {
    before: Vec<Arc<dyn BeforePlugin>>,
    after: Vec<Arc<dyn AfterPlugin>>,
    policy: HookErrorPolicy,
}

impl Pipeline {
    pub fn new(
        before: Vec<Arc<dyn BeforePlugin>>,
        after: Vec<Arc<dyn AfterPlugin>>,
        policy: HookErrorPolicy,
    ) -> Self {
        Self { before, after, policy }
    }

    pub fn policy(&self) -> HookErrorPolicy {
        self.policy
    }

    pub fn before_len(&self) -> usize {
        self.before.len()
    }

    pub fn after_len(&self) -> usize {
        self.after.len()
    }

    pub async fn run_before(&self, ctx: &mut CallContext, request: &mut OutgoingRequest) -> Result<(), Error> {
        for plugin in &self.before {
            match plugin.handle(ctx, request).await {
                Ok(next) => *ctx = next,
                Err(err) => self.on_error(plugin.name(), "before", err)?,
            }
        }
        Ok(())
    }

    pub async fn run_after(
        &self,
        ctx: &mut CallContext,
        request: &RequestSnapshot,
        response: Option<&http::response::Parts>,
    ) -> Result<(), Error> {
        for plugin in &self.after {
            match plugin.handle(ctx, request, response).await {
                Ok(next) => *ctx = next,
                Err(err) => self.on_error(plugin.name(), "after", err)?,
            }
        }
        Ok(())
    }

    fn on_error(&self, plugin: &str, stage: &'static str, err: PluginError) -> Result<(), Error> {
        match self.policy {
            HookErrorPolicy::Continue => {
                warn!(plugin, stage, error = %err, "hook failed, continuing");
                Ok(())
            }
            HookErrorPolicy::Abort => Err(Error::Plugin {
                plugin: plugin.to_string(),
                message: err.to_string(),
            }),
        }
    }
}

pub(crate) fn snapshot(request: &OutgoingRequest) -> RequestSnapshot {
    let mut copy = http::Request::new(());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::HeaderValue;
    use parking_lot::Mutex;

    struct Tag {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl BeforePlugin for Tag {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, ctx: &CallContext, request: &mut OutgoingRequest) -> Result<CallContext, PluginError> {
            self.log.lock().push(self.name);
            if self.fail {
                return Err(PluginError::new("boom"));
            }
            request
                .headers_mut()
                .append("x-hook", HeaderValue::from_static(self.name));
            Ok(ctx.with_value("last", self.name))
        }
    }

    #[async_trait]
    impl AfterPlugin for Tag {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(
            &self,
            ctx: &CallContext,
            _request: &RequestSnapshot,
            response: Option<&http::response::Parts>,
        ) -> Result<CallContext, PluginError> {
            self.log.lock().push(self.name);
            if self.fail {
                return Err(PluginError::new("boom"));
            }
            let status = response.map(|r| r.status.as_str().to_string()).unwrap_or_default();
            Ok(ctx.with_value("status", status))
        }
    }

    fn tag(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>, fail: bool) -> Arc<Tag> {
        Arc::new(Tag {
            name,
            log: Arc::clone(log),
            fail,
        })
    }

    fn before(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>, fail: bool) -> Arc<dyn BeforePlugin> {
        tag(name, log, fail)
    }

    fn after(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>, fail: bool) -> Arc<dyn AfterPlugin> {
        tag(name, log, fail)
    }

    fn outgoing() -> OutgoingRequest {
        http::Request::builder()
            .uri("http://10.0.0.1:8080/v1/ping")
            .body(OutgoingBody::new(Bytes::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn before_hooks_run_in_order_and_thread_context() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(
            vec![before("a", &log, false), before("b", &log, false)],
            Vec::new(),
            HookErrorPolicy::Continue,
        );
        let mut ctx = CallContext::new();
        let mut req = outgoing();
        pipeline.run_before(&mut ctx, &mut req).await.unwrap();

        assert_eq!(*log.lock(), vec!["a", "b"]);
        assert_eq!(ctx.value("last"), Some("b"));
        let hooks: Vec<&str> = req
            .headers()
            .get_all("x-hook")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(hooks, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn continue_policy_skips_failed_hook() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(
            vec![before("a", &log, true), before("b", &log, false)],
            Vec::new(),
            HookErrorPolicy::Continue,
        );
        let mut ctx = CallContext::new();
        pipeline.run_before(&mut ctx, &mut outgoing()).await.unwrap();
        assert_eq!(*log.lock(), vec!["a", "b"]);
        assert_eq!(ctx.value("last"), Some("b"));
    }

    #[tokio::test]
    async fn abort_policy_stops_at_failed_hook() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(
            vec![before("a", &log, true), before("b", &log, false)],
            Vec::new(),
            HookErrorPolicy::Abort,
        );
        let err = pipeline
            .run_before(&mut CallContext::new(), &mut outgoing())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Plugin { ref plugin, .. } if plugin == "a"));
        assert_eq!(*log.lock(), vec!["a"]);
    }

    #[tokio::test]
    async fn after_hooks_see_response_head() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(Vec::new(), vec![after("a", &log, false)], HookErrorPolicy::Continue);
        let (parts, ()) = http::Response::builder().status(503).body(()).unwrap().into_parts();
        let mut ctx = CallContext::new();
        let req = snapshot(&outgoing());
        pipeline.run_after(&mut ctx, &req, Some(&parts)).await.unwrap();
        assert_eq!(ctx.value("status"), Some("503"));
    }

    #[tokio::test]
    async fn after_hooks_run_without_response() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(Vec::new(), vec![after("a", &log, false)], HookErrorPolicy::Continue);
        let mut ctx = CallContext::new();
        pipeline
            .run_after(&mut ctx, &snapshot(&outgoing()), None)
            .await
            .unwrap();
        assert_eq!(ctx.value("status"), Some(""));
    }

    #[test]
    fn snapshot_copies_head() {
        let mut req = outgoing();
        req.headers_mut().insert("x-trace", HeaderValue::from_static("t1"));
        let copy = snapshot(&req);
        assert_eq!(copy.uri(), req.uri());
        assert_eq!(copy.headers()["x-trace"], "t1");
    }
}
