//! Established connections and their stream tables.
//!
//! A [`Connection`] is owned by the pool. Streams only borrow a slot in its
//! table; every mutation of that table happens under one lock, so a slot is
//! never handed out and retired at the same instant.

use crate::base::neterror::NetError;
use crate::http::transport::Transport;
use crate::socket::pool::PoolKey;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Process-unique connection identifier.
pub type ConnectionId = u64;

/// Protocol-level stream identifier.
pub type StreamId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Negotiated application protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http11,
    Http2,
    Http3,
}

impl Protocol {
    /// Whether several streams may be open at once.
    pub fn is_multiplexed(self) -> bool {
        !matches!(self, Protocol::Http11)
    }

    /// ALPN identifier.
    pub fn alpn(self) -> &'static str {
        match self {
            Protocol::Http11 => "http/1.1",
            Protocol::Http2 => "h2",
            Protocol::Http3 => "h3",
        }
    }

    pub fn version(self) -> http::Version {
        match self {
            Protocol::Http11 => http::Version::HTTP_11,
            Protocol::Http2 => http::Version::HTTP_2,
            Protocol::Http3 => http::Version::HTTP_3,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.alpn())
    }
}

/// Lifecycle of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No open streams; eligible for reuse or eviction.
    Idle,
    /// At least one open stream.
    Busy,
    /// No new streams; closes once the last open stream finishes.
    Draining,
    /// Terminal.
    Closed,
}

/// How a connection shares itself between streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    /// HTTP/1.1: one stream at a time, no pipelining.
    Exclusive,
    /// HTTP/2 and HTTP/3: up to the peer's advertised limit, or
    /// `default_max_streams` while it has not announced one.
    Multiplexed { default_max_streams: usize },
}

/// Why a stream could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    /// HTTP/1.1 connection already carries a stream.
    Exclusive,
    /// Concurrency limit reached.
    NoCapacity,
    /// Draining or closed.
    NotAccepting,
}

/// A reserved slot on a connection. Dropping it does not free the slot;
/// the pool does that on release.
#[derive(Debug)]
pub struct StreamSlot {
    pub id: StreamId,
    /// Fires at most once, if the connection dies while the stream is open.
    pub(crate) aborted: oneshot::Receiver<NetError>,
}

/// Snapshot of the connection an exchange ran on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub protocol: Protocol,
    pub remote_addr: Option<SocketAddr>,
    /// Whether the connection had served an earlier stream.
    pub reused: bool,
}

struct StreamTable {
    state: ConnectionState,
    open: HashMap<StreamId, oneshot::Sender<NetError>>,
    next_stream_id: StreamId,
    last_activity: Instant,
    reusable: bool,
    served: u64,
}

pub struct Connection {
    id: ConnectionId,
    key: PoolKey,
    protocol: Protocol,
    kind: Kind,
    transport: Arc<dyn Transport>,
    table: Mutex<StreamTable>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("protocol", &self.protocol)
            .field("state", &table.state)
            .field("open_streams", &table.open.len())
            .finish()
    }
}

impl Connection {
    /// Wrap an established transport. `default_max_streams` applies when the
    /// peer did not advertise a limit.
    pub fn new(key: PoolKey, transport: Arc<dyn Transport>, default_max_streams: usize) -> Self {
        let protocol = transport.protocol();
        let kind = if protocol.is_multiplexed() {
            Kind::Multiplexed { default_max_streams }
        } else {
            Kind::Exclusive
        };
        let first_id = match protocol {
            Protocol::Http11 => 1,
            Protocol::Http2 => 1,
            Protocol::Http3 => 0,
        };
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            key,
            protocol,
            kind,
            transport,
            table: Mutex::new(StreamTable {
                state: ConnectionState::Idle,
                open: HashMap::new(),
                next_stream_id: first_id,
                last_activity: Instant::now(),
                reusable: true,
                served: 0,
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, StreamTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport.remote_addr()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Maximum number of concurrently open streams, as the peer currently
    /// allows.
    pub fn max_streams(&self) -> usize {
        match self.kind {
            Kind::Exclusive => 1,
            Kind::Multiplexed { default_max_streams } => self
                .transport
                .max_concurrent_streams()
                .unwrap_or(default_max_streams)
                .max(1),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.table().state
    }

    pub fn open_streams(&self) -> usize {
        self.table().open.len()
    }

    /// Streams that could still be opened right now.
    pub fn current_capacity(&self) -> usize {
        let table = self.table();
        match table.state {
            ConnectionState::Idle | ConnectionState::Busy => {
                self.max_streams().saturating_sub(table.open.len())
            }
            ConnectionState::Draining | ConnectionState::Closed => 0,
        }
    }

    pub fn last_activity(&self) -> Instant {
        self.table().last_activity
    }

    pub fn is_reusable(&self) -> bool {
        self.table().reusable
    }

    /// Idle for at least `timeout`.
    pub fn is_idle_expired(&self, timeout: Duration, now: Instant) -> bool {
        let table = self.table();
        table.state == ConnectionState::Idle
            && now.saturating_duration_since(table.last_activity) >= timeout
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            protocol: self.protocol,
            remote_addr: self.remote_addr(),
            reused: self.table().served > 0,
        }
    }

    /// Atomically check capacity and reserve a stream slot.
    pub fn open_stream(&self) -> Result<StreamSlot, OpenError> {
        let mut table = self.table();
        match table.state {
            ConnectionState::Draining | ConnectionState::Closed => {
                return Err(OpenError::NotAccepting)
            }
            ConnectionState::Idle | ConnectionState::Busy => {}
        }
        if !table.reusable || !self.transport.is_open() {
            table.state =
                if table.open.is_empty() { ConnectionState::Closed } else { ConnectionState::Draining };
            return Err(OpenError::NotAccepting);
        }
        match self.kind {
            Kind::Exclusive if !table.open.is_empty() => return Err(OpenError::Exclusive),
            Kind::Multiplexed { .. } if table.open.len() >= self.max_streams() => {
                return Err(OpenError::NoCapacity)
            }
            _ => {}
        }

        let id = table.next_stream_id;
        table.next_stream_id += match self.protocol {
            Protocol::Http11 => 1,
            Protocol::Http2 => 2,
            Protocol::Http3 => 4,
        };
        let (tx, rx) = oneshot::channel();
        table.open.insert(id, tx);
        table.state = ConnectionState::Busy;
        table.last_activity = Instant::now();
        Ok(StreamSlot { id, aborted: rx })
    }

    /// Free a stream slot. Returns `true` when the connection is now closed
    /// and should leave the pool.
    pub(crate) fn finish_stream(&self, id: StreamId) -> bool {
        let mut table = self.table();
        if table.open.remove(&id).is_some() {
            table.served += 1;
        }
        table.last_activity = Instant::now();
        if table.open.is_empty() {
            table.state = match table.state {
                ConnectionState::Draining | ConnectionState::Closed => ConnectionState::Closed,
                _ if !table.reusable => ConnectionState::Closed,
                _ => ConnectionState::Idle,
            };
        }
        let closed = table.state == ConnectionState::Closed;
        drop(table);
        if closed {
            self.transport.close();
        }
        closed
    }

    /// Stop accepting new streams; close once the open ones finish.
    pub(crate) fn drain(&self) -> bool {
        let mut table = self.table();
        table.reusable = false;
        if table.open.is_empty() {
            table.state = ConnectionState::Closed;
            drop(table);
            self.transport.close();
            true
        } else {
            if table.state != ConnectionState::Closed {
                table.state = ConnectionState::Draining;
            }
            false
        }
    }

    /// Retire an idle connection. Fails if a stream holds a slot, so an
    /// eviction can never race a concurrent reservation.
    pub(crate) fn try_retire(&self) -> bool {
        let mut table = self.table();
        if !table.open.is_empty() || table.state == ConnectionState::Closed {
            return false;
        }
        table.state = ConnectionState::Closed;
        table.reusable = false;
        drop(table);
        self.transport.close();
        true
    }

    /// Fatal connection error: close, and hand `error` to every open stream
    /// exactly once. Returns the number of streams notified.
    pub(crate) fn fail(&self, error: NetError) -> usize {
        let mut table = self.table();
        let already_closed = table.state == ConnectionState::Closed;
        table.state = ConnectionState::Closed;
        table.reusable = false;
        let open: Vec<_> = table.open.drain().collect();
        drop(table);

        let notified = open.len();
        for (_, tx) in open {
            let _ = tx.send(error);
        }
        if !already_closed {
            tracing::debug!(conn = self.id, %error, notified, "connection failed");
            self.transport.close();
        }
        notified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::transport::testing::StubTransport;

    fn key() -> PoolKey {
        PoolKey::new("https", "a.example", 443, None)
    }

    #[test]
    fn test_http1_is_exclusive() {
        let conn = Connection::new(key(), Arc::new(StubTransport::new(Protocol::Http11)), 100);
        let slot = conn.open_stream().unwrap();
        assert_eq!(conn.open_stream().unwrap_err(), OpenError::Exclusive);

        conn.finish_stream(slot.id);
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(conn.open_stream().is_ok());
    }

    #[test]
    fn test_h2_respects_max_streams() {
        let transport = StubTransport::new(Protocol::Http2).with_max_streams(2);
        let conn = Connection::new(key(), Arc::new(transport), 100);
        let a = conn.open_stream().unwrap();
        let b = conn.open_stream().unwrap();
        assert_eq!((a.id, b.id), (1, 3));
        assert_eq!(conn.open_stream().unwrap_err(), OpenError::NoCapacity);
        assert_eq!(conn.current_capacity(), 0);
    }

    #[test]
    fn test_stream_limit_follows_late_peer_settings() {
        let transport = Arc::new(StubTransport::new(Protocol::Http2));
        let conn = Connection::new(key(), Arc::clone(&transport) as Arc<dyn Transport>, 100);
        assert_eq!(conn.max_streams(), 100);

        let _a = conn.open_stream().unwrap();
        let _b = conn.open_stream().unwrap();
        transport.advertise(3);
        assert_eq!(conn.max_streams(), 3);
        assert_eq!(conn.current_capacity(), 1);
        let _c = conn.open_stream().unwrap();
        assert_eq!(conn.open_stream().unwrap_err(), OpenError::NoCapacity);

        // A lowered limit leaves no capacity until streams finish.
        transport.advertise(2);
        assert_eq!(conn.current_capacity(), 0);
    }

    #[test]
    fn test_h3_stream_ids() {
        let conn = Connection::new(key(), Arc::new(StubTransport::new(Protocol::Http3)), 10);
        let ids: Vec<_> = (0..3).map(|_| conn.open_stream().unwrap().id).collect();
        assert_eq!(ids, vec![0, 4, 8]);
    }

    #[test]
    fn test_fail_notifies_each_stream_once() {
        let conn = Connection::new(key(), Arc::new(StubTransport::new(Protocol::Http2)), 10);
        let mut a = conn.open_stream().unwrap();
        let mut b = conn.open_stream().unwrap();

        assert_eq!(conn.fail(NetError::ConnectionReset), 2);
        assert_eq!(a.aborted.try_recv().unwrap(), NetError::ConnectionReset);
        assert_eq!(b.aborted.try_recv().unwrap(), NetError::ConnectionReset);

        // A second failure has nobody left to notify.
        assert_eq!(conn.fail(NetError::ConnectionReset), 0);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_retire_refuses_busy_connection() {
        let conn = Connection::new(key(), Arc::new(StubTransport::new(Protocol::Http2)), 10);
        let slot = conn.open_stream().unwrap();
        assert!(!conn.try_retire());
        conn.finish_stream(slot.id);
        assert!(conn.try_retire());
        assert_eq!(conn.open_stream().unwrap_err(), OpenError::NotAccepting);
    }

    #[test]
    fn test_drain_closes_after_last_stream() {
        let conn = Connection::new(key(), Arc::new(StubTransport::new(Protocol::Http2)), 10);
        let slot = conn.open_stream().unwrap();
        assert!(!conn.drain());
        assert_eq!(conn.state(), ConnectionState::Draining);
        assert_eq!(conn.open_stream().unwrap_err(), OpenError::NotAccepting);
        assert!(conn.finish_stream(slot.id));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_reused_flag() {
        let conn = Connection::new(key(), Arc::new(StubTransport::new(Protocol::Http11)), 1);
        assert!(!conn.info().reused);
        let slot = conn.open_stream().unwrap();
        conn.finish_stream(slot.id);
        assert!(conn.info().reused);
    }
}
