//! Error types for the RPC transport.
//!
//! # Design
//! One variant per failure stage of a call, so callers can tell "the request
//! never left the process" (`Validation`, `ServiceNotFound`, `NodeSelection`,
//! `TlsConfig`, `RequestBuild`) from "the backend was involved" (`Transport`,
//! `HttpStatus`, `Decode`). Cancellation has its own variant because a caller
//! that gave up should not see a generic transport failure.

use std::fmt;

use thiserror::Error;

/// Boxed error used at collaborator boundaries (servicers, rate limiters).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why a call context stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The cancellation token was triggered.
    Cancelled,
    /// The context deadline passed.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => write!(f, "context cancelled"),
            CancelReason::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

/// Errors returned by `RpcClient::send`.
#[derive(Debug, Error)]
pub enum Error {
    /// A required part of the request or response is missing or malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The service name is not present in the registry.
    #[error("get [{0}] servicer is nil")]
    ServiceNotFound(String),

    /// The servicer failed to pick a node, or picked none.
    #[error("node selection failed: {0}")]
    NodeSelection(String),

    /// TLS material could not be turned into a client configuration.
    #[error("tls configuration error: {0}")]
    TlsConfig(String),

    /// The outgoing request could not be built.
    #[error("build request failed: {0}")]
    RequestBuild(String),

    /// Dial, handshake, write or read failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend answered with a status other than 200.
    #[error("http code is {0}")]
    HttpStatus(u16),

    /// The response body could not be decoded into the destination.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The call context was cancelled or its deadline passed.
    #[error("{0}")]
    Cancelled(CancelReason),

    /// A hook failed while the pipeline runs with `HookErrorPolicy::Abort`.
    #[error("plugin {plugin} failed: {message}")]
    Plugin { plugin: String, message: String },
}

impl Error {
    /// Whether a caller-side retry could plausibly succeed.
    ///
    /// The transport never retries by itself; this is the signal a retrying
    /// caller or load balancer can act on.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::HttpStatus(code) => *code == 429 || (500..600).contains(code),
            _ => false,
        }
    }

    /// Whether the error came from the call context rather than the backend.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}
