//! The frame-codec seam.
//!
//! A [`Transport`] is an established connection that can carry streams. The
//! session layer never touches frames; it only asks a transport to run one
//! request/response exchange on a stream id, reset a stream, or close.
//! HTTP/1.1 is backed by hyper, HTTP/2 by the `http2` codec; HTTP/3
//! transports plug in through the same trait.

use crate::base::context::net_error_from_io;
use crate::base::neterror::NetError;
use crate::http::connection::{Protocol, StreamId};
use crate::http::request::{HttpBody, Request, RequestBody};
use bytes::{Bytes, BytesMut};
use http_body::Body as _;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::collections::HashSet;
use std::error::Error as StdError;
use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use url::Position;

/// Which part of the connection an exchange failure affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Only this stream was reset; siblings continue.
    Stream,
    /// The connection is unusable.
    Connection,
}

/// Failure of a single exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeError {
    pub error: NetError,
    pub scope: ErrorScope,
    /// Whether any request bytes may have reached the peer.
    pub request_sent: bool,
    /// Whether response bytes had started arriving.
    pub response_started: bool,
}

impl ExchangeError {
    pub fn connection(error: NetError) -> Self {
        Self { error, scope: ErrorScope::Connection, request_sent: true, response_started: false }
    }

    pub fn stream(error: NetError) -> Self {
        Self { error, scope: ErrorScope::Stream, request_sent: true, response_started: false }
    }

    /// The request never left the client.
    pub fn unsent(mut self) -> Self {
        self.request_sent = false;
        self
    }

    pub fn after_response_started(mut self) -> Self {
        self.response_started = true;
        self
    }
}

pub type Exchanging =
    Pin<Box<dyn Future<Output = Result<http::Response<Bytes>, ExchangeError>> + Send>>;

/// Capability interface of an established connection.
pub trait Transport: Send + Sync + 'static {
    fn protocol(&self) -> Protocol;

    /// Peer-advertised concurrent stream limit, if known. Read on every
    /// stream open, since the peer may announce or change it at any time.
    fn max_concurrent_streams(&self) -> Option<usize> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Send `request` on `stream_id` and read the full response.
    ///
    /// Body transfer is flow controlled per stream; an exchange that is
    /// window-blocked must not hold up exchanges on other stream ids.
    fn exchange(&self, stream_id: StreamId, request: Request) -> Exchanging;

    /// Whether response headers have arrived on a stream whose exchange is
    /// still in flight.
    fn response_started(&self, _stream_id: StreamId) -> bool {
        false
    }

    /// Abort a stream locally (RST_STREAM or equivalent).
    fn reset_stream(&self, _stream_id: StreamId) {}

    /// Whether new streams may be opened. `false` after GOAWAY or close.
    fn is_open(&self) -> bool;

    fn close(&self);
}

/// Build the request head. HTTP/1.1 uses origin-form with a Host header;
/// HTTP/2 uses the absolute form. The body is left as is.
fn to_hyper_request(
    request: Request,
    protocol: Protocol,
) -> Result<http::Request<RequestBody>, ExchangeError> {
    let (method, url, headers, body) = request.into_parts();

    let uri = match protocol {
        Protocol::Http11 => &url[Position::BeforePath..Position::AfterQuery],
        _ => &url[..Position::AfterQuery],
    };
    let mut builder = http::Request::builder().method(method).uri(uri).version(protocol.version());
    if protocol == Protocol::Http11 && !headers.contains_key(http::header::HOST) {
        builder = builder.header(http::header::HOST, &url[Position::BeforeHost..Position::AfterPort]);
    }
    let mut req = builder.body(body).map_err(|_| ExchangeError::stream(NetError::InvalidUrl).unsent())?;
    req.headers_mut().extend(headers);
    Ok(req)
}

/// Take the body for sending. Only called once the connection is ready,
/// since a one-shot stream cannot be taken twice.
fn take_body(
    request: http::Request<RequestBody>,
) -> Result<http::Request<HttpBody>, ExchangeError> {
    let (parts, body) = request.into_parts();
    let body = body.into_http_body().map_err(|e| ExchangeError::stream(e).unsent())?;
    Ok(http::Request::from_parts(parts, body))
}

fn io_error_in(err: &hyper::Error) -> Option<&std::io::Error> {
    let mut source = err.source();
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return Some(io);
        }
        source = e.source();
    }
    None
}

/// Classify a hyper error seen before response headers arrived.
fn request_error(err: &hyper::Error) -> NetError {
    if let Some(io) = io_error_in(err) {
        return net_error_from_io(io);
    }
    if err.is_incomplete_message() {
        NetError::EmptyResponse
    } else if err.is_parse() {
        NetError::InvalidResponse
    } else if err.is_timeout() {
        NetError::TimedOut
    } else {
        NetError::ConnectionClosed
    }
}

/// Classify a hyper error seen while draining the response body.
fn body_error(err: &hyper::Error) -> NetError {
    if let Some(io) = io_error_in(err) {
        return net_error_from_io(io);
    }
    if err.is_incomplete_message() {
        NetError::ContentLengthMismatch
    } else {
        NetError::ConnectionClosed
    }
}

async fn collect_body(
    response: http::Response<Incoming>,
) -> Result<http::Response<Bytes>, hyper::Error> {
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await?.to_bytes();
    Ok(http::Response::from_parts(parts, bytes))
}

/// HTTP/1.1 over any byte stream, one exchange at a time.
pub struct Http1Transport {
    /// Lent to the exchange in flight; `None` meanwhile and after close.
    sender: Arc<Mutex<Option<http1::SendRequest<HttpBody>>>>,
    open: Arc<AtomicBool>,
    response_started: Arc<AtomicBool>,
    remote_addr: Option<SocketAddr>,
}

/// The HTTP/1.1 sender on loan to one exchange. Handed back on drop unless
/// the transport closed meanwhile.
struct SenderLease {
    slot: Arc<Mutex<Option<http1::SendRequest<HttpBody>>>>,
    open: Arc<AtomicBool>,
    sender: Option<http1::SendRequest<HttpBody>>,
}

impl Drop for SenderLease {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if self.open.load(Ordering::Acquire) {
            *slot = self.sender.take();
        }
    }
}

impl Http1Transport {
    /// Handshake and spawn the connection driver.
    pub async fn handshake<T>(io: T, remote_addr: Option<SocketAddr>) -> Result<Self, NetError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, conn) =
            http1::handshake(TokioIo::new(io)).await.map_err(|_| NetError::ConnectionFailed)?;
        let open = Arc::new(AtomicBool::new(true));
        let driver_open = Arc::clone(&open);
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "http/1.1 connection ended with error");
            }
            driver_open.store(false, Ordering::Release);
        });
        Ok(Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            open,
            response_started: Arc::new(AtomicBool::new(false)),
            remote_addr,
        })
    }
}

impl Transport for Http1Transport {
    fn protocol(&self) -> Protocol {
        Protocol::Http11
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn exchange(&self, _stream_id: StreamId, request: Request) -> Exchanging {
        let slot = Arc::clone(&self.sender);
        let open = Arc::clone(&self.open);
        let started = Arc::clone(&self.response_started);
        Box::pin(async move {
            let req = to_hyper_request(request, Protocol::Http11)?;
            let sender = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            let mut lease = SenderLease { slot, open: Arc::clone(&open), sender };
            let Some(sender) = lease.sender.as_mut() else {
                return Err(ExchangeError::connection(NetError::ConnectionClosed).unsent());
            };
            started.store(false, Ordering::Release);
            if sender.ready().await.is_err() {
                open.store(false, Ordering::Release);
                return Err(ExchangeError::connection(NetError::ConnectionClosed).unsent());
            }
            let req = take_body(req)?;
            let response = sender.send_request(req).await.map_err(|e| {
                open.store(false, Ordering::Release);
                let err = ExchangeError::connection(request_error(&e));
                if e.is_canceled() { err.unsent() } else { err }
            })?;
            started.store(true, Ordering::Release);
            collect_body(response).await.map_err(|e| {
                open.store(false, Ordering::Release);
                ExchangeError::connection(body_error(&e)).after_response_started()
            })
        })
    }

    fn response_started(&self, _stream_id: StreamId) -> bool {
        self.response_started.load(Ordering::Acquire)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        // Dropping the sender lets the driver task finish.
        self.open.store(false, Ordering::Release);
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

type H2Sender = http2::client::SendRequest<Bytes>;

/// Map a codec error to the stream or the whole connection.
fn h2_exchange_error(err: &http2::Error) -> ExchangeError {
    if err.is_reset() {
        let error = match err.reason() {
            Some(http2::Reason::REFUSED_STREAM) => NetError::Http2ServerRefusedStream,
            Some(http2::Reason::FLOW_CONTROL_ERROR) => NetError::Http2FlowControlError,
            _ => NetError::StreamReset,
        };
        return ExchangeError::stream(error);
    }
    let error = if let Some(io) = err.get_io() {
        net_error_from_io(io)
    } else if err.is_go_away() && err.reason() == Some(http2::Reason::NO_ERROR) {
        NetError::ConnectionClosed
    } else {
        NetError::Http2ProtocolError
    };
    ExchangeError::connection(error)
}

enum SendFailure {
    Codec(http2::Error),
    Body(io::Error),
    /// The stream closed before the body was through.
    Closed,
}

/// Write `body` as DATA frames, waiting for stream send capacity per chunk.
async fn send_body(
    stream: &mut http2::SendStream<Bytes>,
    mut body: HttpBody,
) -> Result<(), SendFailure> {
    while let Some(frame) = body.frame().await {
        let frame = match frame.map_err(SendFailure::Body)?.into_data() {
            Ok(mut data) => {
                while !data.is_empty() {
                    stream.reserve_capacity(data.len());
                    let granted = match poll_fn(|cx| stream.poll_capacity(cx)).await {
                        Some(granted) => granted.map_err(SendFailure::Codec)?,
                        None => return Err(SendFailure::Closed),
                    };
                    let chunk = data.split_to(granted.min(data.len()));
                    stream.send_data(chunk, false).map_err(SendFailure::Codec)?;
                }
                continue;
            }
            Err(frame) => frame,
        };
        if let Ok(trailers) = frame.into_trailers() {
            return stream.send_trailers(trailers).map_err(SendFailure::Codec);
        }
    }
    stream.send_data(Bytes::new(), true).map_err(SendFailure::Codec)
}

/// Marks a stream's response as started until its exchange ends.
struct StartedGuard {
    started: Arc<Mutex<HashSet<StreamId>>>,
    id: StreamId,
}

impl StartedGuard {
    fn mark(&self) {
        self.started.lock().unwrap_or_else(|e| e.into_inner()).insert(self.id);
    }
}

impl Drop for StartedGuard {
    fn drop(&mut self) {
        self.started.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.id);
    }
}

/// HTTP/2 over a TLS stream. Each exchange gets its own h2 stream, so flow
/// control windows are independent.
pub struct Http2Transport {
    sender: Mutex<Option<H2Sender>>,
    open: Arc<AtomicBool>,
    /// Streams whose response headers have arrived.
    started: Arc<Mutex<HashSet<StreamId>>>,
    remote_addr: Option<SocketAddr>,
}

impl Http2Transport {
    pub async fn handshake<T>(io: T, remote_addr: Option<SocketAddr>) -> Result<Self, NetError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let builder = http2::client::Builder::new();
        let (sender, conn) = builder
            .handshake::<_, Bytes>(io)
            .await
            .map_err(|e| h2_exchange_error(&e).error)?;
        let open = Arc::new(AtomicBool::new(true));
        let driver_open = Arc::clone(&open);
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "h2 connection ended with error");
            }
            driver_open.store(false, Ordering::Release);
        });
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            open,
            started: Arc::new(Mutex::new(HashSet::new())),
            remote_addr,
        })
    }

    fn sender(&self) -> Option<H2Sender> {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Transport for Http2Transport {
    fn protocol(&self) -> Protocol {
        Protocol::Http2
    }

    fn max_concurrent_streams(&self) -> Option<usize> {
        let limit = self.sender.lock().unwrap_or_else(|e| e.into_inner()).as_ref()?.current_max_send_streams();
        // Unbounded until the peer's SETTINGS arrive.
        (limit != usize::MAX).then_some(limit)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn exchange(&self, stream_id: StreamId, request: Request) -> Exchanging {
        let sender = self.sender();
        let open = Arc::clone(&self.open);
        let started = StartedGuard { started: Arc::clone(&self.started), id: stream_id };
        Box::pin(async move {
            let fail = |e: &http2::Error| {
                let err = h2_exchange_error(e);
                if err.scope == ErrorScope::Connection {
                    open.store(false, Ordering::Release);
                }
                err
            };
            let sender = sender
                .ok_or_else(|| ExchangeError::connection(NetError::ConnectionClosed).unsent())?;
            let req = to_hyper_request(request, Protocol::Http2)?;
            let mut sender = sender.ready().await.map_err(|e| fail(&e).unsent())?;

            let (parts, body) = take_body(req)?.into_parts();
            let end_of_stream = body.is_end_stream();
            let (response, mut send_stream) = sender
                .send_request(http::Request::from_parts(parts, ()), end_of_stream)
                .map_err(|e| fail(&e).unsent())?;
            if !end_of_stream {
                send_body(&mut send_stream, body).await.map_err(|e| match e {
                    SendFailure::Codec(e) => fail(&e),
                    SendFailure::Body(e) => ExchangeError::stream(net_error_from_io(&e)),
                    SendFailure::Closed => ExchangeError::stream(NetError::Http2StreamClosed),
                })?;
            }

            let response = response.await.map_err(|e| fail(&e))?;
            started.mark();
            let (parts, mut body) = response.into_parts();
            let mut buf = BytesMut::new();
            while let Some(chunk) = body.data().await {
                let chunk = chunk.map_err(|e| fail(&e).after_response_started())?;
                let _ = body.flow_control().release_capacity(chunk.len());
                buf.extend_from_slice(&chunk);
            }
            Ok(http::Response::from_parts(parts, buf.freeze()))
        })
    }

    fn response_started(&self, stream_id: StreamId) -> bool {
        self.started.lock().unwrap_or_else(|e| e.into_inner()).contains(&stream_id)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
            && self.sender.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}
