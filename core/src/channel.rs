//! Secure-channel builder: a client connection bound to one picked node.
//!
//! # Design
//! The socket always dials the node's address; the URL host is only the
//! request's self-description. When the servicer carries TLS material the
//! connection is upgraded to mutual TLS and the server certificate is checked
//! against the *service name*, not the dialed address, so backends can move
//! or rotate behind one logical identity.
//!
//! Idle HTTP/1 connections are cached under
//! `ChannelKey { address, server_name, fingerprint }`. The server name is
//! part of the key because a TLS connection is only verified for the
//! service it was opened for. A call that arrives with a new fingerprint for
//! an address and service evicts everything cached for them under the old
//! one, so rotated credentials take effect on the next call.
//! There is no reaper task: expired idle connections are discarded on the
//! next checkout, and a key with no idle connection and no call in flight is
//! dropped from the cache.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::TlsConnector;
use tracing::debug;
use xxhash_rust::xxh3::Xxh3;

use crate::config::TransportConfig;
use crate::context::CallContext;
use crate::error::Error;
use crate::servicer::{Node, Servicer};

pub(crate) type OutgoingBody = Full<Bytes>;

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// PEM material reported by a servicer.
#[derive(Clone, Default)]
pub struct Credentials {
    pub ca_crt: Bytes,
    pub client_pem: Bytes,
    pub client_key: Bytes,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("fingerprint", &format_args!("{:016x}", self.fingerprint()))
            .finish()
    }
}

impl Credentials {
    /// `None` when the servicer reports no material at all, which selects a
    /// plaintext channel.
    pub fn from_servicer(servicer: &dyn Servicer) -> Option<Self> {
        let creds = Self {
            ca_crt: servicer.ca_crt(),
            client_pem: servicer.client_pem(),
            client_key: servicer.client_key(),
        };
        if creds.ca_crt.is_empty() && creds.client_pem.is_empty() && creds.client_key.is_empty() {
            None
        } else {
            Some(creds)
        }
    }

    /// Hash of all three PEM blobs, used to key cached channels.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Xxh3::new();
        for part in [&self.ca_crt, &self.client_pem, &self.client_key] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        hasher.digest()
    }

    /// Parse the material into a rustls client config presenting the client
    /// certificate and trusting only the given CA.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, Error> {
        let mut roots = RootCertStore::empty();
        for cert in read_certs(&self.ca_crt, "ca certificate")? {
            roots
                .add(cert)
                .map_err(|e| Error::TlsConfig(format!("ca certificate rejected: {e}")))?;
        }
        if roots.is_empty() {
            return Err(Error::TlsConfig("no ca certificate found".to_string()));
        }

        let chain = read_certs(&self.client_pem, "client certificate")?;
        if chain.is_empty() {
            return Err(Error::TlsConfig("no client certificate found".to_string()));
        }

        let mut reader: &[u8] = &self.client_key;
        let key = rustls_pemfile::private_key(&mut reader)
            .map_err(|e| Error::TlsConfig(format!("client key: {e}")))?
            .ok_or_else(|| Error::TlsConfig("no client private key found".to_string()))?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::TlsConfig(e.to_string()))?
            .with_root_certificates(roots)
            .with_client_auth_cert(chain, key)
            .map_err(|e| Error::TlsConfig(format!("server pem error {e}")))?;
        Ok(Arc::new(config))
    }
}

fn read_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let mut reader = pem;
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, io::Error>>()
        .map_err(|e| Error::TlsConfig(format!("{what}: {e}")))
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Identity of a cached connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub address: String,
    /// Name the server certificate was verified against, empty for plaintext.
    pub server_name: String,
    /// Credential fingerprint, 0 for plaintext.
    pub fingerprint: u64,
}

struct IdleConn {
    sender: SendRequest<OutgoingBody>,
    idle_since: Instant,
}

struct HostPool {
    limiter: Arc<Semaphore>,
    idle: Vec<IdleConn>,
}

impl HostPool {
    /// No idle connection, and no checkout holds or awaits a permit: every
    /// permit and every waiter keeps its own reference to the semaphore.
    fn is_unused(&self) -> bool {
        self.idle.is_empty() && Arc::strong_count(&self.limiter) == 1
    }
}

#[derive(Default)]
struct CacheState {
    hosts: HashMap<ChannelKey, HostPool>,
    tls: HashMap<u64, Arc<ClientConfig>>,
}

/// Builds and caches channels to picked nodes.
pub struct ChannelBuilder {
    config: TransportConfig,
    state: Arc<Mutex<CacheState>>,
}

impl fmt::Debug for ChannelBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelBuilder")
            .field("config", &self.config)
            .field("keys", &self.cached_keys())
            .finish()
    }
}

impl ChannelBuilder {
    /// An empty cache governed by `config`.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    /// Get a ready connection to `node`, reusing an idle one when possible.
    ///
    /// Every wait in here races `ctx`, so cancellation surfaces as
    /// `Error::Cancelled` rather than a transport failure.
    pub async fn checkout(
        &self,
        ctx: &CallContext,
        servicer: &dyn Servicer,
        node: &dyn Node,
    ) -> Result<Channel, Error> {
        let creds = Credentials::from_servicer(servicer);
        let key = ChannelKey {
            address: node.address(),
            server_name: creds
                .as_ref()
                .map_or_else(String::new, |_| servicer.name().to_string()),
            fingerprint: creds.as_ref().map_or(0, Credentials::fingerprint),
        };

        let tls = match &creds {
            Some(creds) => {
                let server_name = ServerName::try_from(servicer.name().to_string())
                    .map_err(|e| Error::TlsConfig(format!("invalid server name {}: {e}", servicer.name())))?;
                Some((self.tls_config(key.fingerprint, creds)?, server_name))
            }
            None => None,
        };

        let limiter = self.limiter(&key);
        let acquired = ctx
            .guard(limiter.acquire_owned())
            .await
            .map_err(Error::Cancelled)
            .and_then(|permit| {
                permit.map_err(|_| Error::Transport(format!("connection limiter for {} closed", key.address)))
            });
        let permit = match acquired {
            Ok(permit) => permit,
            Err(err) => {
                prune(&mut self.state.lock(), &key);
                return Err(err);
            }
        };

        if let Some(sender) = self.take_idle(&key) {
            debug!(address = %key.address, "reusing idle connection");
            return Ok(self.channel(key, sender, permit, true));
        }

        let connected = ctx
            .guard(self.connect(&key.address, tls))
            .await
            .map_err(Error::Cancelled)
            .and_then(|sender| sender);
        match connected {
            Ok(sender) => {
                debug!(address = %key.address, tls = key.fingerprint != 0, "dialed new connection");
                Ok(self.channel(key, sender, permit, false))
            }
            Err(err) => {
                drop(permit);
                prune(&mut self.state.lock(), &key);
                Err(err)
            }
        }
    }

    fn channel(&self, key: ChannelKey, sender: SendRequest<OutgoingBody>, permit: OwnedSemaphorePermit, reused: bool) -> Channel {
        Channel {
            sender: Some(sender),
            key,
            reused,
            permit: Some(permit),
            cache: Arc::clone(&self.state),
            reuse: self.config.reuse_connections,
            max_idle: self.config.max_idle_conns_per_host,
        }
    }

    fn tls_config(&self, fingerprint: u64, creds: &Credentials) -> Result<Arc<ClientConfig>, Error> {
        if !self.config.reuse_connections {
            return creds.client_config();
        }
        if let Some(config) = self.state.lock().tls.get(&fingerprint) {
            return Ok(Arc::clone(config));
        }
        let config = creds.client_config()?;
        self.state.lock().tls.insert(fingerprint, Arc::clone(&config));
        Ok(config)
    }

    /// Per-key connection limiter. Evicts entries cached for the same
    /// address and service under other credentials, and drops keys that
    /// have gone unused.
    fn limiter(&self, key: &ChannelKey) -> Arc<Semaphore> {
        let mut state = self.state.lock();
        let stale: Vec<ChannelKey> = state
            .hosts
            .keys()
            .filter(|k| {
                k.address == key.address && k.server_name == key.server_name && k.fingerprint != key.fingerprint
            })
            .cloned()
            .collect();
        if !stale.is_empty() {
            for k in &stale {
                state.hosts.remove(k);
            }
            debug!(address = %key.address, evicted = stale.len(), "credentials rotated, evicted cached channels");
        }

        let idle_timeout = self.config.idle_timeout;
        let before = state.hosts.len();
        state.hosts.retain(|_, pool| {
            pool.idle
                .retain(|idle| !idle.sender.is_closed() && idle.idle_since.elapsed() < idle_timeout);
            !pool.is_unused()
        });
        if state.hosts.len() != before || !stale.is_empty() {
            retain_live_tls(&mut state, key.fingerprint);
        }

        let max = self.config.max_conns_per_host.max(1);
        let pool = state.hosts.entry(key.clone()).or_insert_with(|| HostPool {
            limiter: Arc::new(Semaphore::new(max)),
            idle: Vec::new(),
        });
        Arc::clone(&pool.limiter)
    }

    fn take_idle(&self, key: &ChannelKey) -> Option<SendRequest<OutgoingBody>> {
        if !self.config.reuse_connections {
            return None;
        }
        let mut state = self.state.lock();
        let pool = state.hosts.get_mut(key)?;
        while let Some(idle) = pool.idle.pop() {
            // Readiness is awaited in `Channel::send`; only dead or stale
            // connections are dropped here.
            if idle.sender.is_closed() || idle.idle_since.elapsed() >= self.config.idle_timeout {
                continue;
            }
            return Some(idle.sender);
        }
        None
    }

    async fn connect(
        &self,
        address: &str,
        tls: Option<(Arc<ClientConfig>, ServerName<'static>)>,
    ) -> Result<SendRequest<OutgoingBody>, Error> {
        let stream = self.dial(address).await?;
        match tls {
            None => handshake(TokioIo::new(stream), address).await,
            Some((config, server_name)) => {
                let stream = TlsConnector::from(config)
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| Error::Transport(format!("tls handshake with {address}: {e}")))?;
                handshake(TokioIo::new(stream), address).await
            }
        }
    }

    async fn dial(&self, address: &str) -> Result<TcpStream, Error> {
        let connect = async {
            let mut last_err = None;
            for addr in tokio::net::lookup_host(address).await? {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.set_keepalive(self.config.tcp_keepalive)?;
                match socket.connect(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(err) => last_err = Some(err),
                }
            }
            Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")))
        };

        let stream = tokio::time::timeout(self.config.dial_timeout, connect)
            .await
            .map_err(|_| Error::Transport(format!("dial {address}: timed out after {:?}", self.config.dial_timeout)))?
            .map_err(|e| Error::Transport(format!("dial {address}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::Transport(format!("dial {address}: {e}")))?;
        Ok(stream)
    }

    /// Keys currently holding a limiter or idle connections.
    pub fn cached_keys(&self) -> Vec<ChannelKey> {
        self.state.lock().hosts.keys().cloned().collect()
    }

    /// Idle connections cached for `address`, across services and
    /// credentials.
    pub fn idle_count(&self, address: &str) -> usize {
        self.state
            .lock()
            .hosts
            .iter()
            .filter(|(k, _)| k.address == address)
            .map(|(_, pool)| pool.idle.len())
            .sum()
    }

    /// Parsed TLS client configs currently cached.
    pub fn tls_config_count(&self) -> usize {
        self.state.lock().tls.len()
    }
}

/// Drop `key` from the cache if nothing uses it any more.
fn prune(state: &mut CacheState, key: &ChannelKey) {
    if state.hosts.get(key).is_some_and(HostPool::is_unused) {
        state.hosts.remove(key);
        retain_live_tls(state, 0);
    }
}

/// Keep only TLS configs whose fingerprint is still cached, plus `keep`.
fn retain_live_tls(state: &mut CacheState, keep: u64) {
    let live: HashSet<u64> = state
        .hosts
        .keys()
        .map(|k| k.fingerprint)
        .chain(std::iter::once(keep))
        .collect();
    state.tls.retain(|fp, _| live.contains(fp));
}

async fn handshake<T>(io: T, address: &str) -> Result<SendRequest<OutgoingBody>, Error>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(io)
        .await
        .map_err(|e| Error::Transport(format!("http handshake with {address}: {e}")))?;
    let address = address.to_string();
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!(%address, error = %err, "connection closed with error");
        }
    });
    Ok(sender)
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A connection checked out for one call.
///
/// Holds one of the key's connection permits until dropped. Dropping it
/// closes the connection unless `release` handed it back to the cache first;
/// a key left with nothing idle and nothing in flight is removed then.
pub struct Channel {
    sender: Option<SendRequest<OutgoingBody>>,
    key: ChannelKey,
    reused: bool,
    permit: Option<OwnedSemaphorePermit>,
    cache: Arc<Mutex<CacheState>>,
    reuse: bool,
    max_idle: usize,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("key", &self.key)
            .field("reused", &self.reused)
            .finish()
    }
}

impl Channel {
    /// Cache key this connection is filed under.
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Whether the connection came from the idle cache rather than a fresh
    /// dial.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub(crate) async fn send(
        &mut self,
        request: http::Request<OutgoingBody>,
    ) -> Result<http::Response<Incoming>, Error> {
        let address = &self.key.address;
        let sender = self
            .sender
            .as_mut()
            .ok_or_else(|| Error::Transport(format!("connection to {address} already released")))?;
        sender
            .ready()
            .await
            .map_err(|e| Error::Transport(format!("connection to {address} not ready: {e}")))?;
        sender
            .send_request(request)
            .await
            .map_err(|e| Error::Transport(format!("request to {address}: {e}")))
    }

    /// Return the connection to the cache. Call only after the response body
    /// has been read to the end.
    pub(crate) fn release(mut self) {
        let Some(sender) = self.sender.take() else {
            return;
        };
        if !self.reuse || sender.is_closed() {
            return;
        }
        let mut state = self.cache.lock();
        if let Some(pool) = state.hosts.get_mut(&self.key) {
            if pool.idle.len() < self.max_idle {
                pool.idle.push(IdleConn {
                    sender,
                    idle_since: Instant::now(),
                });
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        drop(self.permit.take());
        prune(&mut self.cache.lock(), &self.key);
    }
}
