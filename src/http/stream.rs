//! Stream multiplexer.
//!
//! A [`Stream`] is one request/response exchange holding a slot on a pooled
//! [`Connection`]. It is released back to the pool exactly once: on
//! completion, on error, or when dropped.

use crate::base::neterror::NetError;
use crate::http::connection::{Connection, ConnectionInfo, Protocol, StreamId, StreamSlot};
use crate::http::request::Request;
use crate::http::transport::{ErrorScope, ExchangeError, Exchanging};
use crate::socket::pool::ConnectionPool;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    /// Request fully handed to the transport.
    HalfClosedLocal,
    Closed,
    Reset,
}

/// Terminal outcome reported to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Full response received. `reusable` is false when the peer asked to
    /// close the connection.
    Completed { reusable: bool },
    /// Stream-level abort; the connection may remain usable.
    Reset,
    /// Abandoned by the caller or a deadline.
    Cancelled,
    /// The connection is no longer usable.
    ConnectionError(NetError),
}

pub struct Stream {
    id: StreamId,
    conn: Arc<Connection>,
    pool: ConnectionPool,
    state: StreamState,
    aborted: oneshot::Receiver<NetError>,
    exchange: Option<Exchanging>,
    released: bool,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("conn", &self.conn.id())
            .field("protocol", &self.conn.protocol())
            .field("state", &self.state)
            .finish()
    }
}

/// Whether the response allows the connection to be kept alive.
fn keeps_alive(protocol: Protocol, response: &http::Response<Bytes>) -> bool {
    let connection = response
        .headers()
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase());
    match (protocol, connection.as_deref()) {
        (Protocol::Http11, Some(v)) if v.contains("close") => false,
        (Protocol::Http11, _) if response.version() == http::Version::HTTP_10 => {
            connection.is_some_and(|v| v.contains("keep-alive"))
        }
        _ => true,
    }
}

impl Stream {
    pub(crate) fn new(conn: Arc<Connection>, slot: StreamSlot, pool: ConnectionPool) -> Self {
        tracing::trace!(conn = conn.id(), stream = slot.id, "stream opened");
        Self {
            id: slot.id,
            conn,
            pool,
            state: StreamState::Open,
            aborted: slot.aborted,
            exchange: None,
            released: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn protocol(&self) -> Protocol {
        self.conn.protocol()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.conn.info()
    }

    /// Hand the request to the transport. Progress happens in [`receive`](Self::receive).
    pub fn send(&mut self, request: Request) -> Result<(), NetError> {
        if self.state != StreamState::Open {
            return Err(NetError::Http2StreamClosed);
        }
        self.exchange = Some(self.conn.transport().exchange(self.id, request));
        self.state = StreamState::HalfClosedLocal;
        Ok(())
    }

    /// Drive the exchange to a full response, or to the first of a stream
    /// error or a connection failure. Releases the slot either way.
    pub async fn receive(&mut self) -> Result<http::Response<Bytes>, ExchangeError> {
        let Some(mut exchange) = self.exchange.take() else {
            return Err(ExchangeError::stream(NetError::SocketNotConnected).unsent());
        };

        let result = tokio::select! {
            biased;
            aborted = &mut self.aborted => {
                // The exchange is still alive here, so the transport can tell
                // whether this stream had started receiving its response.
                let error = ExchangeError::connection(aborted.unwrap_or(NetError::ConnectionClosed));
                if self.conn.transport().response_started(self.id) {
                    Err(error.after_response_started())
                } else {
                    Err(error)
                }
            }
            result = &mut exchange => result,
        };
        drop(exchange);

        match &result {
            Ok(response) => {
                self.state = StreamState::Closed;
                let reusable = keeps_alive(self.protocol(), response);
                self.release(StreamOutcome::Completed { reusable });
            }
            Err(e) => {
                self.state = StreamState::Reset;
                match e.scope {
                    ErrorScope::Stream => {
                        self.conn.transport().reset_stream(self.id);
                        self.release(StreamOutcome::Reset);
                    }
                    ErrorScope::Connection => {
                        self.release(StreamOutcome::ConnectionError(e.error));
                    }
                }
            }
        }
        result
    }

    /// Abandon the stream. Sends a stream-level abort when an exchange is in
    /// flight; siblings on the same connection are unaffected.
    pub fn close(&mut self) {
        if self.released {
            return;
        }
        match self.state {
            StreamState::Idle | StreamState::Open => {
                // Nothing reached the wire.
                self.release(StreamOutcome::Completed { reusable: true });
            }
            StreamState::HalfClosedLocal => {
                self.exchange = None;
                self.conn.transport().reset_stream(self.id);
                self.state = StreamState::Reset;
                tracing::debug!(conn = self.conn.id(), stream = self.id, "stream cancelled");
                self.release(StreamOutcome::Cancelled);
            }
            StreamState::Closed | StreamState::Reset => {}
        }
    }

    fn release(&mut self, outcome: StreamOutcome) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        self.pool.release(&self.conn, self.id, outcome);
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close();
    }
}
