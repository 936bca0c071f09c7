//! Scripted connector and transport for driving sessions without a network.
#![allow(dead_code)]

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use quicnet::base::error::ConnectError;
use quicnet::http::connection::StreamId;
use quicnet::http::transport::{ExchangeError, Exchanging, Transport};
use quicnet::socket::connectjob::{Connect, ConnectTarget, Connecting};
use quicnet::{NetError, Protocol, Request};
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type Reply = BoxFuture<'static, Result<http::Response<Bytes>, ExchangeError>>;

/// One exchange as seen by the scripted peer.
pub struct Exchange {
    /// Index of the connection, in connect order.
    pub connection: usize,
    pub stream_id: StreamId,
    pub request: Request,
    /// Lets a reply announce that response headers have arrived.
    pub started: Started,
}

/// Response-started marker for one stream of a mock connection.
#[derive(Clone)]
pub struct Started {
    stream_id: StreamId,
    set: Arc<Mutex<HashSet<StreamId>>>,
}

impl Started {
    pub fn mark(&self) {
        self.set.lock().unwrap().insert(self.stream_id);
    }
}

/// Forgets the stream once its exchange future completes or is dropped.
struct StartedGuard(Started);

impl Drop for StartedGuard {
    fn drop(&mut self) {
        self.0.set.lock().unwrap().remove(&self.0.stream_id);
    }
}

type Handler = dyn Fn(Exchange) -> Reply + Send + Sync;

#[derive(Default)]
struct ConnStats {
    active: AtomicUsize,
    peak: AtomicUsize,
}

struct MockState {
    protocol: Protocol,
    max_streams: Option<usize>,
    handler: Box<Handler>,
    connect_failures: Mutex<VecDeque<NetError>>,
    connections: Mutex<Vec<Arc<ConnStats>>>,
    exchanges: AtomicUsize,
    resets: AtomicUsize,
}

#[derive(Clone)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new<F>(protocol: Protocol, max_streams: Option<usize>, handler: F) -> Self
    where
        F: Fn(Exchange) -> Reply + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(MockState {
                protocol,
                max_streams,
                handler: Box::new(handler),
                connect_failures: Mutex::new(VecDeque::new()),
                connections: Mutex::new(Vec::new()),
                exchanges: AtomicUsize::new(0),
                resets: AtomicUsize::new(0),
            }),
        }
    }

    /// Answer every exchange with an empty 200.
    pub fn ok(protocol: Protocol) -> Self {
        Self::new(protocol, None, |_| respond(200))
    }

    /// Make the next connect attempt fail with `error`.
    pub fn fail_next_connect(&self, error: NetError) {
        self.state.connect_failures.lock().unwrap().push_back(error);
    }

    pub fn connects(&self) -> usize {
        self.state.connections.lock().unwrap().len()
    }

    pub fn exchanges(&self) -> usize {
        self.state.exchanges.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.state.resets.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous exchanges seen on any one connection.
    pub fn peak_streams(&self) -> usize {
        let connections = self.state.connections.lock().unwrap();
        connections.iter().map(|c| c.peak.load(Ordering::SeqCst)).max().unwrap_or(0)
    }

    pub fn arc(&self) -> Arc<dyn Connect> {
        Arc::new(self.clone())
    }
}

impl Connect for MockConnector {
    fn connect(&self, target: &ConnectTarget) -> Connecting {
        let state = Arc::clone(&self.state);
        let port = target.port();
        if let Some(error) = state.connect_failures.lock().unwrap().pop_front() {
            let addr = SocketAddr::from(([10, 0, 0, 250], port));
            return Box::pin(async move { Err(ConnectError::new(error, Some(addr))) });
        }
        let stats = Arc::new(ConnStats::default());
        let id = {
            let mut connections = state.connections.lock().unwrap();
            connections.push(Arc::clone(&stats));
            connections.len() - 1
        };
        let transport: Arc<dyn Transport> = Arc::new(MockTransport {
            id,
            addr: SocketAddr::from(([10, 0, 0, id as u8 + 1], port)),
            state,
            stats,
            open: AtomicBool::new(true),
            started: Arc::new(Mutex::new(HashSet::new())),
        });
        Box::pin(async move { Ok(transport) })
    }
}

struct MockTransport {
    id: usize,
    addr: SocketAddr,
    state: Arc<MockState>,
    stats: Arc<ConnStats>,
    open: AtomicBool,
    started: Arc<Mutex<HashSet<StreamId>>>,
}

/// Counts an exchange as active until its future completes or is dropped.
struct ActiveGuard(Arc<ConnStats>);

impl ActiveGuard {
    fn new(stats: Arc<ConnStats>) -> Self {
        let now = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        stats.peak.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    fn protocol(&self) -> Protocol {
        self.state.protocol
    }

    fn max_concurrent_streams(&self) -> Option<usize> {
        self.state.max_streams
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }

    fn exchange(&self, stream_id: StreamId, request: Request) -> Exchanging {
        self.state.exchanges.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard::new(Arc::clone(&self.stats));
        let started = Started { stream_id, set: Arc::clone(&self.started) };
        let started_guard = StartedGuard(started.clone());
        let reply =
            (self.state.handler)(Exchange { connection: self.id, stream_id, request, started });
        Box::pin(async move {
            let _guard = guard;
            let _started = started_guard;
            reply.await
        })
    }

    fn response_started(&self, stream_id: StreamId) -> bool {
        self.started.lock().unwrap().contains(&stream_id)
    }

    fn reset_stream(&self, _stream_id: StreamId) {
        self.state.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

pub fn response(status: u16) -> http::response::Builder {
    http::Response::builder().status(status)
}

pub fn respond(status: u16) -> Reply {
    reply(response(status).body(Bytes::new()).unwrap())
}

pub fn reply(response: http::Response<Bytes>) -> Reply {
    async move { Ok(response) }.boxed()
}

pub fn redirect(status: u16, location: &str) -> Reply {
    reply(response(status).header("location", location).body(Bytes::new()).unwrap())
}

pub fn fail(error: ExchangeError) -> Reply {
    async move { Err(error) }.boxed()
}

pub fn after(delay: Duration, reply: Reply) -> Reply {
    async move {
        tokio::time::sleep(delay).await;
        reply.await
    }
    .boxed()
}

/// Never answers.
pub fn hang() -> Reply {
    futures::future::pending().boxed()
}

/// Receives response headers, then stalls mid-body.
pub fn started_then_hang(started: Started) -> Reply {
    async move {
        started.mark();
        futures::future::pending().await
    }
    .boxed()
}
