//! Transport policy.
//!
//! # Design
//! Plain data with serde defaults so a host application can embed it in
//! whatever configuration file it already loads. Durations are expressed in
//! milliseconds on the wire.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the pipeline does when a hook returns an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookErrorPolicy {
    /// Log the error and keep going.
    #[default]
    Continue,
    /// Stop the call with `Error::Plugin`.
    Abort,
}

/// Connection and hook policy shared by every call made through one client.
///
/// Missing fields take their `Default` value when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Concurrent in-flight connections per destination.
    pub max_conns_per_host: usize,
    /// Idle connections kept per destination.
    pub max_idle_conns_per_host: usize,
    /// How long a pooled connection may sit unused before it is discarded.
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
    /// Upper bound on TCP connect, before any TLS handshake.
    #[serde(with = "millis")]
    pub dial_timeout: Duration,
    /// Enable TCP keepalive on dialed sockets.
    pub tcp_keepalive: bool,
    /// Keep connections between calls. When false every call dials.
    pub reuse_connections: bool,
    /// Default policy for hook errors; see [`HookErrorPolicy`].
    pub hook_error_policy: HookErrorPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_conns_per_host: 30,
            max_idle_conns_per_host: 30,
            idle_timeout: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(30),
            tcp_keepalive: true,
            reuse_connections: true,
            hook_error_policy: HookErrorPolicy::Continue,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
