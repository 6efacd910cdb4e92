//! Client-side RPC transport for calling named services over HTTP/1.1.
//!
//! # Overview
//! A call names a logical service. The client resolves it through a
//! `ServiceRegistry`, asks that service's `Servicer` to pick a node, opens
//! (or reuses) a plaintext or mutually authenticated TLS channel to it, runs
//! the before-hooks, sends the request, reports the outcome back to the
//! servicer, runs the after-hooks, decodes the body and emits one log record.
//!
//! # Design
//! - Discovery, balancing and health live behind `Servicer`; the transport
//!   only consumes `pick` and `done`.
//! - Channels are cached per node address and credential fingerprint, so
//!   rotating a service's certificates retires its old connections.
//! - Every wait honours the caller's `CallContext` and reports cancellation
//!   as `Error::Cancelled`, distinct from transport failures.
//! - The remaining deadline travels to the server in the
//!   `Timeout-Millisecond` header.

pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod deadline;
pub mod error;
pub mod logger;
pub mod plugin;
pub mod ratelimit;
pub mod request;
pub mod response;
pub mod servicer;

pub use client::{RpcClient, RpcClientBuilder};
pub use codec::{Codec, CodecError, FormCodec, JsonCodec, MultipartCodec};
pub use config::{HookErrorPolicy, TransportConfig};
pub use context::CallContext;
pub use error::{BoxError, CancelReason, Error};
pub use logger::{Field, Logger, TracingLogger};
pub use plugin::{AfterPlugin, BeforePlugin, PluginError};
pub use request::{Request, RequestBody};
pub use response::{Response, Timing};
pub use servicer::{Node, RoundRobinServicer, ServiceRegistry, Servicer, StaticNode};
