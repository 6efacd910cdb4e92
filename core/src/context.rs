//! Per-call context: deadline, cancellation and hook-supplied values.
//!
//! # Design
//! `CallContext` is cheap to clone. Derived contexts share the parent's
//! cancellation token (or a child of it), so cancelling a parent stops every
//! call started from it. Values are an immutable map replaced on write, which
//! lets before-hooks hand a new context down the pipeline without touching
//! the caller's copy.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::CancelReason;

/// Value key under which the client records the logical service name
/// before hooks run.
pub const SERVICE_NAME: &str = "rpc.service_name";

#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Option<Instant>,
    token: CancellationToken,
    values: Arc<BTreeMap<String, String>>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    /// A context with no deadline that is never cancelled unless `cancel`
    /// is called.
    pub fn new() -> Self {
        Self {
            deadline: None,
            token: CancellationToken::new(),
            values: Arc::new(BTreeMap::new()),
        }
    }

    /// Derive a context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context with `deadline`, keeping an earlier existing one.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    /// Derive a context that can be cancelled on its own without cancelling
    /// the parent.
    pub fn with_cancel(&self) -> Self {
        Self {
            token: self.token.child_token(),
            ..self.clone()
        }
    }

    /// Derive a context carrying an extra value.
    pub fn with_value(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut values = (*self.values).clone();
        values.insert(key.into(), value.into());
        Self {
            values: Arc::new(values),
            ..self.clone()
        }
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// `Some` once the context is cancelled or past its deadline.
    pub fn err(&self) -> Option<CancelReason> {
        if self.token.is_cancelled() {
            return Some(CancelReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn cancelled(&self) -> CancelReason {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => CancelReason::Cancelled,
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                        CancelReason::DeadlineExceeded
                    }
                }
            }
            None => {
                self.token.cancelled().await;
                CancelReason::Cancelled
            }
        }
    }

    /// Run `fut` unless the context stops first.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, CancelReason> {
        if let Some(reason) = self.err() {
            return Err(reason);
        }
        tokio::select! {
            biased;
            reason = self.cancelled() => Err(reason),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_is_live() {
        let ctx = CallContext::new();
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn with_timeout_keeps_earlier_deadline() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(50));
        let derived = ctx.with_timeout(Duration::from_secs(60));
        assert_eq!(derived.deadline(), ctx.deadline());
    }

    #[test]
    fn expired_deadline_reports_exceeded() {
        let ctx = CallContext::new().with_deadline(Instant::now() - Duration::from_millis(1));
        assert_eq!(ctx.err(), Some(CancelReason::DeadlineExceeded));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn cancelling_parent_cancels_child() {
        let parent = CallContext::new();
        let child = parent.with_cancel();
        parent.cancel();
        assert_eq!(child.err(), Some(CancelReason::Cancelled));
    }

    #[test]
    fn cancelling_child_leaves_parent_live() {
        let parent = CallContext::new();
        let child = parent.with_cancel();
        child.cancel();
        assert!(parent.err().is_none());
    }

    #[test]
    fn values_do_not_leak_into_parent() {
        let parent = CallContext::new();
        let child = parent.with_value("trace-id", "abc");
        assert_eq!(child.value("trace-id"), Some("abc"));
        assert_eq!(parent.value("trace-id"), None);
    }

    #[tokio::test]
    async fn guard_stops_on_deadline() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(20));
        let out = ctx
            .guard(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert_eq!(out, Err(CancelReason::DeadlineExceeded));
    }

    #[tokio::test]
    async fn guard_returns_output_when_live() {
        let ctx = CallContext::new();
        assert_eq!(ctx.guard(async { 7 }).await, Ok(7));
    }
}
