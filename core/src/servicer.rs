//! Load-balancer capability consumed by the transport.
//!
//! # Design
//! `Servicer` is the seam to whatever does discovery and health scoring. The
//! transport only needs three things from it: a node per call, a place to
//! report how that call went, and the TLS material for the service. Names
//! are resolved through an explicit `ServiceRegistry` handed to the client,
//! never through process-wide state.
//!
//! `RoundRobinServicer` is a small static implementation for tests, demos and
//! fixed topologies.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::context::CallContext;
use crate::error::{BoxError, Error};

/// One addressable backend instance.
pub trait Node: fmt::Debug + Send + Sync {
    fn host(&self) -> &str;

    fn port(&self) -> u16;

    /// `host:port`, with IPv6 hosts bracketed.
    fn address(&self) -> String {
        if self.host().contains(':') {
            format!("[{}]:{}", self.host(), self.port())
        } else {
            format!("{}:{}", self.host(), self.port())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StaticNode {
    host: String,
    port: u16,
}

impl StaticNode {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Node for StaticNode {
    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }
}

/// Node selection, outcome feedback and TLS material for one service.
///
/// Implementations are shared across concurrent calls and must tolerate
/// concurrent `pick`/`done`.
#[async_trait]
pub trait Servicer: Send + Sync {
    /// The logical service name. Also the identity verified during TLS.
    fn name(&self) -> &str;

    /// Choose a node for one call. `Ok(None)` means nothing is available.
    async fn pick(&self, ctx: &CallContext) -> Result<Option<Arc<dyn Node>>, BoxError>;

    /// Report the outcome of the call that used `node`. `None` is success.
    async fn done(&self, ctx: &CallContext, node: &dyn Node, outcome: Option<&Error>) -> Result<(), BoxError>;

    fn ca_crt(&self) -> Bytes {
        Bytes::new()
    }

    fn client_pem(&self) -> Bytes {
        Bytes::new()
    }

    fn client_key(&self) -> Bytes {
        Bytes::new()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name-keyed set of servicers.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn Servicer>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under `servicer.name()`, returning any servicer it replaced.
    pub fn register(&self, servicer: Arc<dyn Servicer>) -> Option<Arc<dyn Servicer>> {
        let name = servicer.name().to_string();
        self.services.write().insert(name, servicer)
    }

    /// Remove a service. Calls naming it fail with `ServiceNotFound` from
    /// then on.
    pub fn deregister(&self, name: &str) -> Option<Arc<dyn Servicer>> {
        self.services.write().remove(name)
    }

    /// The servicer registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Servicer>> {
        self.services.read().get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Round robin
// ---------------------------------------------------------------------------

/// Outcome counters for one node, keyed by address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Default)]
struct TlsMaterial {
    ca_crt: Bytes,
    client_pem: Bytes,
    client_key: Bytes,
}

/// Fixed node list picked in rotation.
pub struct RoundRobinServicer {
    name: String,
    nodes: Vec<Arc<dyn Node>>,
    cursor: AtomicUsize,
    stats: Mutex<HashMap<String, NodeStats>>,
    tls: RwLock<TlsMaterial>,
}

impl RoundRobinServicer {
    pub fn new(name: impl Into<String>, nodes: Vec<StaticNode>) -> Self {
        Self {
            name: name.into(),
            nodes: nodes
                .into_iter()
                .map(|n| Arc::new(n) as Arc<dyn Node>)
                .collect(),
            cursor: AtomicUsize::new(0),
            stats: Mutex::new(HashMap::new()),
            tls: RwLock::new(TlsMaterial::default()),
        }
    }

    /// Attach PEM material, enabling mutual TLS for this service.
    pub fn with_tls(self, ca_crt: impl Into<Bytes>, client_pem: impl Into<Bytes>, client_key: impl Into<Bytes>) -> Self {
        self.rotate_tls(ca_crt, client_pem, client_key);
        self
    }

    /// Replace the TLS material. Calls after this use the new credentials.
    pub fn rotate_tls(&self, ca_crt: impl Into<Bytes>, client_pem: impl Into<Bytes>, client_key: impl Into<Bytes>) {
        *self.tls.write() = TlsMaterial {
            ca_crt: ca_crt.into(),
            client_pem: client_pem.into(),
            client_key: client_key.into(),
        };
    }

    /// Number of nodes in the rotation.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Outcomes reported through `done` for the node at `address`.
    pub fn stats(&self, address: &str) -> NodeStats {
        self.stats.lock().get(address).copied().unwrap_or_default()
    }
}

#[async_trait]
impl Servicer for RoundRobinServicer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pick(&self, _ctx: &CallContext) -> Result<Option<Arc<dyn Node>>, BoxError> {
        if self.nodes.is_empty() {
            return Ok(None);
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.nodes.len();
        Ok(Some(Arc::clone(&self.nodes[index])))
    }

    async fn done(&self, _ctx: &CallContext, node: &dyn Node, outcome: Option<&Error>) -> Result<(), BoxError> {
        let mut stats = self.stats.lock();
        let entry = stats.entry(node.address()).or_default();
        match outcome {
            None => {
                entry.successes += 1;
                entry.consecutive_failures = 0;
            }
            Some(_) => {
                entry.failures += 1;
                entry.consecutive_failures += 1;
            }
        }
        Ok(())
    }

    fn ca_crt(&self) -> Bytes {
        self.tls.read().ca_crt.clone()
    }

    fn client_pem(&self) -> Bytes {
        self.tls.read().client_pem.clone()
    }

    fn client_key(&self) -> Bytes {
        self.tls.read().client_key.clone()
    }
}
