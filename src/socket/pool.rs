//! Connection pool manager.
//!
//! Connections are grouped by [`PoolKey`]. Every decision about a group
//! (reserving a stream slot, opening a connection, evicting one, queueing a
//! waiter) happens while holding that group's DashMap entry guard, which is
//! the single ordering point between acquire, release and eviction.

use crate::base::error::ConnectError;
use crate::base::neterror::NetError;
use crate::http::connection::{Connection, ConnectionId, ConnectionState, OpenError, Protocol};
use crate::http::stream::{Stream, StreamOutcome};
use crate::socket::connectjob::{Connect, ConnectTarget};
use crate::socket::proxy::ProxySettings;
use dashmap::DashMap;
use std::cmp::Reverse;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use url::Url;

/// Identifies a connection group (scheme, host, port, proxy).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub proxy: Option<ProxySettings>,
}

impl PoolKey {
    pub fn new(
        scheme: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        proxy: Option<ProxySettings>,
    ) -> Self {
        Self { scheme: scheme.into(), host: host.into(), port, proxy }
    }

    pub fn from_url(url: &Url, proxy: Option<&ProxySettings>) -> Result<Self, NetError> {
        match url.scheme() {
            "http" | "https" => {}
            _ => return Err(NetError::UnknownUrlScheme),
        }
        let host = url.host_str().ok_or(NetError::InvalidUrl)?;
        let port = url.port_or_known_default().ok_or(NetError::InvalidUrl)?;
        Ok(Self::new(url.scheme(), host, port, proxy.cloned()))
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == "https"
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)?;
        if let Some(proxy) = &self.proxy {
            write!(f, " via {}", proxy.identity())?;
        }
        Ok(())
    }
}

/// Preferences for one acquisition.
#[derive(Debug, Clone, Default)]
pub struct AcquireHint {
    /// Preferred protocol. A multiplexed hint also prefers any multiplexed
    /// connection over HTTP/1.1.
    pub protocol: Option<Protocol>,
    /// Connections that already failed this logical request.
    pub avoid_connections: Vec<ConnectionId>,
    /// Addresses that already failed this logical request.
    pub avoid_addrs: Vec<SocketAddr>,
}

impl AcquireHint {
    pub fn prefer(protocol: Protocol) -> Self {
        Self { protocol: Some(protocol), ..Default::default() }
    }

    /// Lower ranks are preferred.
    fn rank(&self, protocol: Protocol) -> u8 {
        match self.protocol {
            None => 0,
            Some(p) if p == protocol => 0,
            Some(p) if p.is_multiplexed() && protocol.is_multiplexed() => 1,
            Some(_) => 2,
        }
    }

    fn avoids(&self, conn: &Connection) -> bool {
        self.avoid_connections.contains(&conn.id())
            || conn.remote_addr().is_some_and(|a| self.avoid_addrs.contains(&a))
    }
}

/// Pool limits and behaviour.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections (open or being established) per pool key.
    pub max_connections_per_key: usize,
    /// Idle connections are evicted after this long.
    pub idle_timeout: Duration,
    /// Wait for capacity when the per-key cap is reached, instead of failing.
    pub pool_block: bool,
    /// Bound on that wait. `None` waits until the request deadline.
    pub pool_timeout: Option<Duration>,
    /// Stream limit for HTTP/2 connections whose peer did not advertise one.
    pub default_max_streams: usize,
    /// The same for HTTP/3 connections.
    pub default_max_h3_streams: usize,
    /// Interval of the background idle sweep.
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_key: 6,
            idle_timeout: Duration::from_secs(90),
            pool_block: true,
            pool_timeout: None,
            default_max_streams: 100,
            default_max_h3_streams: 100,
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

/// Per-group state.
#[derive(Default)]
struct Group {
    connections: Vec<Arc<Connection>>,
    /// Connections currently being established.
    connecting: usize,
    /// Protocol of the most recently established connection.
    protocol: Option<Protocol>,
    waiters: Vec<oneshot::Sender<()>>,
}

impl Group {
    fn total(&self) -> usize {
        self.connections.len() + self.connecting
    }

    fn is_empty(&self) -> bool {
        self.connections.is_empty() && self.connecting == 0 && self.live_waiters() == 0
    }

    /// Waiters whose acquire is still pending.
    fn live_waiters(&self) -> usize {
        self.waiters.iter().filter(|w| !w.is_closed()).count()
    }

    /// Forget waiters that gave up (deadline, pool timeout, task abort).
    fn forget_abandoned_waiters(&mut self) {
        self.waiters.retain(|w| !w.is_closed());
    }

    /// Drop connections that can no longer serve anything.
    fn prune(&mut self, idle_timeout: Duration, now: Instant) -> usize {
        let before = self.connections.len();
        self.connections.retain(|conn| {
            let expired = conn.is_idle_expired(idle_timeout, now);
            let dead = !conn.transport().is_open();
            if (expired || dead) && conn.try_retire() {
                tracing::debug!(conn = conn.id(), expired, "evicting idle connection");
                return false;
            }
            conn.state() != ConnectionState::Closed
        });
        before - self.connections.len()
    }

    fn take_waiters(&mut self) -> Vec<oneshot::Sender<()>> {
        std::mem::take(&mut self.waiters)
    }
}

fn wake(waiters: Vec<oneshot::Sender<()>>) {
    for waiter in waiters {
        let _ = waiter.send(());
    }
}

/// Result of one synchronous acquisition step.
pub(crate) enum Acquire {
    Ready(Stream),
    /// A connect slot was reserved; the caller must establish a connection.
    Connect,
    /// Nothing available; wait for a capacity change.
    Wait(oneshot::Receiver<()>),
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connect>,
    groups: DashMap<PoolKey, Group>,
    closed: AtomicBool,
    connections_opened: AtomicUsize,
}

/// Pool of HTTP connections shared by all logical requests of a session.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("groups", &self.inner.groups.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Gives back a reserved connect slot if establishment is abandoned.
struct ConnectingGuard<'a> {
    pool: &'a ConnectionPool,
    key: &'a PoolKey,
    armed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let waiters = match self.pool.inner.groups.get_mut(self.key) {
            Some(mut group) => {
                group.connecting = group.connecting.saturating_sub(1);
                group.take_waiters()
            }
            None => Vec::new(),
        };
        wake(waiters);
    }
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, connector: Arc<dyn Connect>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                groups: DashMap::new(),
                closed: AtomicBool::new(false),
                connections_opened: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// One non-blocking acquisition step, atomic with respect to every other
    /// acquire, release and eviction on the same key.
    pub(crate) fn try_acquire(
        &self,
        key: &PoolKey,
        hint: &AcquireHint,
    ) -> Result<Acquire, ConnectError> {
        if self.is_closed() {
            return Err(NetError::SessionClosed.into());
        }
        let config = &self.inner.config;
        let mut group = self.inner.groups.entry(key.clone()).or_default();
        group.prune(config.idle_timeout, Instant::now());

        let mut candidates: Vec<Arc<Connection>> =
            group.connections.iter().filter(|c| c.current_capacity() > 0).cloned().collect();
        candidates.sort_by_key(|c| (hint.rank(c.protocol()), Reverse(c.last_activity())));
        let (preferred, avoided): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|c| !hint.avoids(c));

        for conn in &preferred {
            if let Some(stream) = self.try_open(conn) {
                return Ok(Acquire::Ready(stream));
            }
        }

        // An https connection still negotiating may turn out multiplexed.
        let await_negotiation = key.is_secure()
            && group.connecting > 0
            && group.protocol.map_or(true, Protocol::is_multiplexed);
        if !await_negotiation && group.total() < config.max_connections_per_key {
            group.connecting += 1;
            return Ok(Acquire::Connect);
        }

        for conn in &avoided {
            if let Some(stream) = self.try_open(conn) {
                return Ok(Acquire::Ready(stream));
            }
        }

        if !config.pool_block && !await_negotiation {
            return Err(NetError::PoolExhausted.into());
        }
        let (tx, rx) = oneshot::channel();
        group.forget_abandoned_waiters();
        group.waiters.push(tx);
        Ok(Acquire::Wait(rx))
    }

    fn try_open(&self, conn: &Arc<Connection>) -> Option<Stream> {
        match conn.open_stream() {
            Ok(slot) => Some(Stream::new(Arc::clone(conn), slot, self.clone())),
            Err(OpenError::Exclusive | OpenError::NoCapacity | OpenError::NotAccepting) => None,
        }
    }

    /// Acquire a stream for `key`, opening a connection or waiting as needed.
    pub async fn acquire(&self, key: &PoolKey, hint: &AcquireHint) -> Result<Stream, ConnectError> {
        let deadline = self.inner.config.pool_timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            match self.try_acquire(key, hint)? {
                Acquire::Ready(stream) => return Ok(stream),
                Acquire::Connect => return self.connect(key, hint).await,
                Acquire::Wait(rx) => {
                    tracing::trace!(%key, "waiting for connection capacity");
                    match deadline {
                        Some(deadline) => {
                            if tokio::time::timeout_at(deadline, rx).await.is_err() {
                                if let Some(mut group) = self.inner.groups.get_mut(key) {
                                    group.forget_abandoned_waiters();
                                }
                                return Err(NetError::PoolExhausted.into());
                            }
                        }
                        None => {
                            let _ = rx.await;
                        }
                    }
                }
            }
        }
    }

    /// Establish a connection for a reserved connect slot and open the
    /// caller's stream on it before anyone else can see it.
    pub(crate) async fn connect(
        &self,
        key: &PoolKey,
        hint: &AcquireHint,
    ) -> Result<Stream, ConnectError> {
        let mut guard = ConnectingGuard { pool: self, key, armed: true };
        let target = ConnectTarget::new(key.clone()).avoiding(hint.avoid_addrs.clone());
        let transport = self.inner.connector.connect(&target).await?;

        let default_max_streams = match transport.protocol() {
            Protocol::Http3 => self.inner.config.default_max_h3_streams,
            _ => self.inner.config.default_max_streams,
        };
        let conn = Arc::new(Connection::new(key.clone(), transport, default_max_streams));
        let (result, waiters) = {
            let mut group = self.inner.groups.entry(key.clone()).or_default();
            guard.armed = false;
            group.connecting = group.connecting.saturating_sub(1);
            let waiters = group.take_waiters();
            if self.is_closed() {
                conn.fail(NetError::SessionClosed);
                (Err(NetError::SessionClosed.into()), waiters)
            } else {
                group.protocol = Some(conn.protocol());
                group.connections.push(Arc::clone(&conn));
                self.inner.connections_opened.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%key, conn = conn.id(), protocol = %conn.protocol(), "connection added");
                match conn.open_stream() {
                    Ok(slot) => (Ok(Stream::new(Arc::clone(&conn), slot, self.clone())), waiters),
                    Err(_) => (
                        Err(ConnectError::new(NetError::ConnectionClosed, conn.remote_addr())),
                        waiters,
                    ),
                }
            }
        };
        wake(waiters);
        result
    }

    /// Record a stream's terminal outcome and free its slot.
    pub(crate) fn release(&self, conn: &Arc<Connection>, stream_id: u64, outcome: StreamOutcome) {
        // The group is gone once the pool is closed; the bookkeeping below
        // still has to run for the connection itself.
        let mut group = self.inner.groups.get_mut(conn.key());
        let evict = match outcome {
            StreamOutcome::ConnectionError(error) => {
                if conn.state() != ConnectionState::Closed {
                    let notified = conn.fail(error);
                    tracing::warn!(conn = conn.id(), %error, notified, "evicting failed connection");
                }
                true
            }
            StreamOutcome::Reset | StreamOutcome::Cancelled if !conn.protocol().is_multiplexed() => {
                // Framing position unknown after an aborted HTTP/1.1 exchange.
                conn.finish_stream(stream_id);
                conn.drain()
            }
            StreamOutcome::Completed { reusable: false } => {
                conn.finish_stream(stream_id);
                conn.drain()
            }
            StreamOutcome::Completed { .. } | StreamOutcome::Reset | StreamOutcome::Cancelled => {
                let closed = conn.finish_stream(stream_id);
                if !closed && !conn.transport().is_open() {
                    conn.drain()
                } else {
                    closed
                }
            }
        };
        let waiters = match group.as_mut() {
            Some(group) => {
                if evict {
                    group.connections.retain(|c| c.id() != conn.id());
                }
                group.take_waiters()
            }
            None => Vec::new(),
        };
        drop(group);
        wake(waiters);
    }

    /// Evict expired idle connections and dead ones across all keys.
    pub fn cleanup_idle_connections(&self) {
        let now = Instant::now();
        let mut woken = Vec::new();
        self.inner.groups.retain(|_, group| {
            if group.prune(self.inner.config.idle_timeout, now) > 0 {
                woken.extend(group.take_waiters());
            }
            group.forget_abandoned_waiters();
            !group.is_empty()
        });
        wake(woken);
    }

    /// Periodically run [`cleanup_idle_connections`](Self::cleanup_idle_connections)
    /// on the current tokio runtime. Stops when the pool is closed or dropped.
    pub fn start_cleanup_task(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("no runtime; idle cleanup runs on acquire only");
            return;
        };
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.cleanup_interval;
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let pool = ConnectionPool { inner };
                if pool.is_closed() {
                    break;
                }
                pool.cleanup_idle_connections();
            }
        });
    }

    /// Close every connection and fail every waiter with a shutdown error.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut failed = 0;
        self.inner.groups.retain(|_, group| {
            for conn in group.connections.drain(..) {
                failed += conn.fail(NetError::SessionClosed);
            }
            // Dropping the senders fails the waiters.
            group.waiters.clear();
            false
        });
        tracing::debug!(failed_streams = failed, "connection pool closed");
    }

    /// Open connections for `key`.
    pub fn connection_count(&self, key: &PoolKey) -> usize {
        self.inner.groups.get(key).map_or(0, |g| g.connections.len())
    }

    /// Open connections across all keys.
    pub fn total_connection_count(&self) -> usize {
        self.inner.groups.iter().map(|g| g.connections.len()).sum()
    }

    pub fn idle_connection_count(&self) -> usize {
        self.inner
            .groups
            .iter()
            .map(|g| g.connections.iter().filter(|c| c.open_streams() == 0).count())
            .sum()
    }

    pub fn open_stream_count(&self) -> usize {
        self.inner
            .groups
            .iter()
            .map(|g| g.connections.iter().map(|c| c.open_streams()).sum::<usize>())
            .sum()
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.groups.iter().map(|g| g.live_waiters()).sum()
    }

    /// Connections established over the pool's lifetime.
    pub fn connections_opened(&self) -> usize {
        self.inner.connections_opened.load(Ordering::Relaxed)
    }
}
