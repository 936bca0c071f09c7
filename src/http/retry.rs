//! Retry logic with exponential backoff.
//!
//! Based on Chromium's `HttpNetworkTransaction::RetryReason` enum and retry logic.
//! See: net/http/http_network_transaction.h

use crate::base::neterror::NetError;
use crate::http::connection::ConnectionId;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Reasons for retrying a request (mirrors Chromium's RetryReason enum).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// Server closed connection unexpectedly
    ConnectionReset,
    /// Connection was closed during request
    ConnectionClosed,
    /// Connection was aborted
    ConnectionAborted,
    /// Socket not connected
    SocketNotConnected,
    /// Could not establish the connection
    ConnectFailed,
    /// Empty response received
    EmptyResponse,
    /// HTTP request timeout
    HttpRequestTimeout,
    /// HTTP/2 ping failed
    Http2PingFailed,
    /// HTTP/2 server refused stream
    Http2ServerRefusedStream,
    /// Stream reset by the peer
    StreamReset,
    /// QUIC connection failed after the handshake
    QuicProtocolError,
}

impl RetryReason {
    /// Map a NetError to a RetryReason, if the error is retryable.
    pub fn from_error(error: &NetError) -> Option<Self> {
        match error {
            NetError::ConnectionReset => Some(Self::ConnectionReset),
            NetError::ConnectionClosed | NetError::SocketRemoteClosed => Some(Self::ConnectionClosed),
            NetError::ConnectionAborted => Some(Self::ConnectionAborted),
            NetError::SocketNotConnected => Some(Self::SocketNotConnected),
            NetError::ConnectionRefused
            | NetError::ConnectionFailed
            | NetError::AddressUnreachable
            | NetError::TunnelConnectionFailed => Some(Self::ConnectFailed),
            NetError::EmptyResponse => Some(Self::EmptyResponse),
            NetError::ConnectionTimedOut | NetError::TimedOut => Some(Self::HttpRequestTimeout),
            NetError::Http2PingFailed => Some(Self::Http2PingFailed),
            NetError::Http2ServerRefusedStream => Some(Self::Http2ServerRefusedStream),
            NetError::StreamReset | NetError::Http2StreamClosed => Some(Self::StreamReset),
            NetError::QuicProtocolError => Some(Self::QuicProtocolError),
            _ => None,
        }
    }

    /// The peer guarantees the request was not processed.
    pub fn is_unprocessed(self) -> bool {
        matches!(self, Self::Http2ServerRefusedStream | Self::ConnectFailed)
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 3, matching Chromium)
    pub max_retries: usize,
    /// Base delay for exponential backoff in milliseconds (default: 100)
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds (default: 5000)
    pub max_delay_ms: u64,
    /// Jitter factor (0.0-1.0) to randomize delays (default: 0.1)
    pub jitter_factor: f64,
    /// Retry non-idempotent requests whose body was already sent
    pub retry_non_idempotent: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            jitter_factor: 0.1,
            retry_non_idempotent: false,
        }
    }
}

impl RetryConfig {
    /// Create a config with no retries.
    pub fn no_retry() -> Self {
        Self { max_retries: 0, ..Default::default() }
    }

    /// Create a config with aggressive retries.
    pub fn aggressive() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 50,
            max_delay_ms: 10000,
            jitter_factor: 0.2,
            retry_non_idempotent: false,
        }
    }

    /// Retries with no backoff delay.
    pub fn immediate(max_retries: usize) -> Self {
        Self { max_retries, base_delay_ms: 0, max_delay_ms: 0, jitter_factor: 0.0, ..Default::default() }
    }
}

/// Calculate backoff delay for a given attempt.
///
/// Uses exponential backoff: `base_delay * 2^(attempt-1)`,
/// capped at `max_delay_ms`.
pub fn calculate_backoff(attempt: usize, config: &RetryConfig) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let delay_ms = config.base_delay_ms.saturating_mul(1 << (attempt - 1).min(10));
    let capped_ms = delay_ms.min(config.max_delay_ms);

    let jitter_range = (capped_ms as f64 * config.jitter_factor) as u64;
    let jittered_ms = if jitter_range > 0 {
        // Deterministic jitter based on attempt number
        let jitter = (attempt as u64 * 7) % jitter_range;
        capped_ms.saturating_add(jitter)
    } else {
        capped_ms
    };

    Duration::from_millis(jittered_ms)
}

/// Check if we should retry based on attempt count.
pub fn should_retry(attempt: usize, config: &RetryConfig) -> bool {
    attempt < config.max_retries
}

/// Per-logical-request retry bookkeeping.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Retries performed so far.
    pub retries: usize,
    /// Connections that failed this request.
    pub failed_connections: Vec<ConnectionId>,
    /// Addresses that failed this request.
    pub failed_addrs: Vec<SocketAddr>,
    /// Whether the body can be sent again.
    pub body_replayable: bool,
    started: Instant,
}

impl RetryContext {
    pub fn new(body_replayable: bool) -> Self {
        Self {
            retries: 0,
            failed_connections: Vec::new(),
            failed_addrs: Vec::new(),
            body_replayable,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Remember a failed path so the next attempt prefers another.
    pub fn record_failure(&mut self, connection: Option<ConnectionId>, addr: Option<SocketAddr>) {
        if let Some(id) = connection {
            if !self.failed_connections.contains(&id) {
                self.failed_connections.push(id);
            }
        }
        if let Some(addr) = addr {
            if !self.failed_addrs.contains(&addr) {
                self.failed_addrs.push(addr);
            }
        }
    }

    /// Whether re-sending is safe. Anything goes when nothing reached the
    /// peer; otherwise the body must be replayable and the method idempotent
    /// (or non-idempotent retries explicitly allowed).
    pub fn is_legal(&self, request_sent: bool, idempotent: bool, config: &RetryConfig) -> bool {
        !request_sent
            || (self.body_replayable && (idempotent || config.retry_non_idempotent))
    }
}
