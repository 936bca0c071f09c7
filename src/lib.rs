//! # quicnet
//!
//! A Chromium-inspired HTTP client session layer for Rust.
//!
//! `quicnet` presents one request/response API while choosing between
//! HTTP/1.1, HTTP/2 and HTTP/3, reusing and multiplexing connections, and
//! handling redirects and retries on the caller's behalf.
//!
//! ## Features
//!
//! - **Connection Pooling**: per-key connection cap, idle eviction, bounded waits
//! - **Protocol Negotiation**: TLS ALPN for HTTP/2 vs HTTP/1.1, Alt-Svc driven HTTP/3 with TCP fallback
//! - **Stream Multiplexing**: exclusive HTTP/1.1 exchanges, concurrent HTTP/2/3 streams up to the peer limit
//! - **Retries & Redirects**: idempotency-aware retries, redirect caps, cycle detection and credential stripping
//! - **Dual Execution**: async [`Session`] and thread-blocking [`BlockingSession`] share one decision engine
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use quicnet::Session;
//!
//! #[tokio::main]
//! async fn main() {
//!     let session = Session::new();
//!     let response = session.get("https://example.com").await.unwrap();
//!     println!("Status: {}", response.status());
//!     session.close();
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Error codes, terminal errors and load states
//! - [`http`] - Connections, streams, transports, negotiation and the request state machine
//! - [`socket`] - Connection pool, connect jobs, proxies and TLS
//! - [`quic`] - HTTP/3 configuration
//! - [`session`] - Session objects and execution drivers

pub mod base;
pub mod http;
pub mod quic;
pub mod session;
pub mod socket;

pub use base::error::{AttemptTarget, ConnectError, SessionError};
pub use base::neterror::{ErrorClass, NetError};
pub use crate::http::{HttpResponse, Middleware, Protocol, RedirectPolicy, Request, RequestBody, RetryConfig};
pub use quic::QuicConfig;
pub use session::{BlockingSession, Session, SessionBuilder, SessionConfig};
pub use socket::pool::{ConnectionPool, PoolConfig, PoolKey};
pub use socket::proxy::ProxySettings;
pub use socket::tls::{CertVerifier, TlsConfig};
