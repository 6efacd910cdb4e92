//! Rate-limiter boundary.
//!
//! The limiter itself (leaky bucket, distributed counter, ...) lives outside
//! the transport; only its capability shape is consumed here.
//! `RateLimitPlugin` adapts a limiter into a before-hook keyed by service
//! name. It reports a rejection as a hook error, so it only stops calls when
//! the client runs with `HookErrorPolicy::Abort`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{CallContext, SERVICE_NAME};
use crate::error::BoxError;
use crate::plugin::{BeforePlugin, OutgoingRequest, PluginError};

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Whether `count` more requests under `key` are admitted.
    async fn allow(&self, ctx: &CallContext, key: &str, count: u32) -> Result<bool, BoxError>;

    fn set_burst(&self, burst: u32);

    fn set_limit(&self, rate: u32);
}

pub struct RateLimitPlugin {
    limiter: Arc<dyn RateLimiter>,
}

impl RateLimitPlugin {
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl BeforePlugin for RateLimitPlugin {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn handle(&self, ctx: &CallContext, request: &mut OutgoingRequest) -> Result<CallContext, PluginError> {
        let key = match ctx.value(SERVICE_NAME) {
            Some(service) => service.to_string(),
            None => request
                .uri()
                .authority()
                .map(|a| a.to_string())
                .unwrap_or_default(),
        };
        let allowed = self
            .limiter
            .allow(ctx, &key, 1)
            .await
            .map_err(|e| PluginError::new(format!("rate limiter failed for {key}: {e}")))?;
        if !allowed {
            return Err(PluginError::new(format!("rate limit exceeded for {key}")));
        }
        Ok(ctx.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::channel::OutgoingBody;

    /// Admits the first `burst` requests per call to `allow`.
    struct Fixed {
        burst: AtomicU32,
        used: AtomicU32,
        keys: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RateLimiter for Fixed {
        async fn allow(&self, _ctx: &CallContext, key: &str, count: u32) -> Result<bool, BoxError> {
            self.keys.lock().push(key.to_string());
            let used = self.used.fetch_add(count, Ordering::SeqCst) + count;
            Ok(used <= self.burst.load(Ordering::SeqCst))
        }

        fn set_burst(&self, burst: u32) {
            self.burst.store(burst, Ordering::SeqCst);
        }

        fn set_limit(&self, _rate: u32) {}
    }

    fn request() -> OutgoingRequest {
        http::Request::builder()
            .uri("http://10.0.0.1:8080/v1/ping")
            .body(OutgoingBody::new(Bytes::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn admits_until_burst_is_spent() {
        let limiter = Arc::new(Fixed {
            burst: AtomicU32::new(0),
            used: AtomicU32::new(0),
            keys: Mutex::new(Vec::new()),
        });
        limiter.set_burst(1);
        let plugin = RateLimitPlugin::new(limiter.clone());
        let ctx = CallContext::new().with_value(SERVICE_NAME, "user-svc");

        assert!(plugin.handle(&ctx, &mut request()).await.is_ok());
        let err = plugin.handle(&ctx, &mut request()).await.unwrap_err();
        assert_eq!(err.to_string(), "rate limit exceeded for user-svc");
        assert_eq!(*limiter.keys.lock(), vec!["user-svc", "user-svc"]);
    }

    #[tokio::test]
    async fn falls_back_to_authority_without_service_name() {
        let limiter = Arc::new(Fixed {
            burst: AtomicU32::new(10),
            used: AtomicU32::new(0),
            keys: Mutex::new(Vec::new()),
        });
        let plugin = RateLimitPlugin::new(limiter.clone());
        plugin.handle(&CallContext::new(), &mut request()).await.unwrap();
        assert_eq!(*limiter.keys.lock(), vec!["10.0.0.1:8080"]);
    }
}
