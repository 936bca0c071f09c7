//! Request descriptor handed to a session.
//!
//! The session never interprets headers beyond what redirects need; the body
//! only has to say whether it can be sent twice.

use crate::base::neterror::NetError;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use url::Url;

/// A stream of body chunks that can be read exactly once.
pub type BodyStream = BoxStream<'static, Result<Bytes, io::Error>>;

/// Body type handed to the hyper connections.
pub type HttpBody = UnsyncBoxBody<Bytes, io::Error>;

/// One-shot streaming body. Clones share the same underlying stream.
#[derive(Clone)]
pub struct OneShotBody {
    inner: Arc<Mutex<Option<BodyStream>>>,
    size: Option<u64>,
}

impl OneShotBody {
    pub fn new(stream: BodyStream, size: Option<u64>) -> Self {
        Self { inner: Arc::new(Mutex::new(Some(stream))), size }
    }

    /// Take the stream. Returns `None` once any attempt has taken it.
    pub fn take(&self) -> Option<BodyStream> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn is_consumed(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

/// Request body for HTTP methods that send data.
#[derive(Clone, Default)]
pub enum RequestBody {
    /// No body (GET, HEAD, DELETE).
    #[default]
    Empty,
    /// Buffered bytes; can be re-sent on retry or redirect.
    Bytes(Bytes),
    /// Streaming body; gone once the first attempt starts sending it.
    Stream(OneShotBody),
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            RequestBody::Stream(s) => f
                .debug_struct("Stream")
                .field("size", &s.size)
                .field("consumed", &s.is_consumed())
                .finish(),
        }
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        RequestBody::Bytes(Bytes::from(s))
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(v: Vec<u8>) -> Self {
        RequestBody::Bytes(Bytes::from(v))
    }
}

impl From<&str> for RequestBody {
    fn from(s: &str) -> Self {
        RequestBody::Bytes(Bytes::from(s.to_owned()))
    }
}

impl From<Bytes> for RequestBody {
    fn from(b: Bytes) -> Self {
        RequestBody::Bytes(b)
    }
}

impl RequestBody {
    /// Wrap a chunk stream as a one-shot body.
    pub fn stream(stream: BodyStream, size: Option<u64>) -> Self {
        RequestBody::Stream(OneShotBody::new(stream, size))
    }

    /// Check if the body is empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, RequestBody::Empty)
    }

    /// Length in bytes, when known up front.
    pub fn size_hint(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Bytes(b) => Some(b.len() as u64),
            RequestBody::Stream(s) => s.size,
        }
    }

    /// A one-shot stream that some attempt already took.
    pub fn is_consumed(&self) -> bool {
        matches!(self, RequestBody::Stream(s) if s.is_consumed())
    }

    /// Whether the body can be sent again after an attempt used it.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, RequestBody::Stream(_))
    }

    /// Convert into a hyper body. Fails if a one-shot stream was already taken.
    pub fn into_http_body(self) -> Result<HttpBody, NetError> {
        match self {
            RequestBody::Empty => {
                Ok(Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync())
            }
            RequestBody::Bytes(b) => Ok(Full::new(b).map_err(|never| match never {}).boxed_unsync()),
            RequestBody::Stream(s) => {
                let stream = s.take().ok_or(NetError::RequestBodyConsumed)?;
                Ok(StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync())
            }
        }
    }
}

/// A single logical request: method, target, headers and body source.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: RequestBody,
}

impl Request {
    /// Parse `url` and build a request with no headers and no body.
    pub fn new(method: Method, url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|_| NetError::InvalidUrl)?;
        Ok(Self::from_url(method, url))
    }

    pub fn from_url(method: Method, url: Url) -> Self {
        Self { method, url, headers: HeaderMap::new(), body: RequestBody::Empty }
    }

    pub fn get(url: &str) -> Result<Self, NetError> {
        Self::new(Method::GET, url)
    }

    pub fn post(url: &str) -> Result<Self, NetError> {
        Self::new(Method::POST, url)
    }

    /// Add a header. Invalid names or values are ignored.
    pub fn header<K, V>(mut self, key: K, value: V) -> Self
    where
        K: TryInto<HeaderName>,
        V: TryInto<HeaderValue>,
    {
        if let (Ok(k), Ok(v)) = (key.try_into(), value.try_into()) {
            self.headers.append(k, v);
        }
        self
    }

    /// Set request body.
    pub fn body<B: Into<RequestBody>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body_ref(&self) -> &RequestBody {
        &self.body
    }

    pub(crate) fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub(crate) fn set_url(&mut self, url: Url) {
        self.url = url;
    }

    pub(crate) fn set_body(&mut self, body: RequestBody) {
        self.body = body;
    }

    /// Whether repeating this request cannot change its effect (RFC 9110 §9.2.2).
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
        )
    }

    /// Split into parts for the wire.
    pub fn into_parts(self) -> (Method, Url, HeaderMap, RequestBody) {
        (self.method, self.url, self.headers, self.body)
    }
}
