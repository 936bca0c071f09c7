//! QUIC and HTTP/3 support.
//!
//! There is no built-in QUIC stack. An HTTP/3 implementation plugs in as a
//! [`Connect`](crate::socket::connectjob::Connect) whose transports report
//! [`Protocol::Http3`](crate::http::connection::Protocol::Http3); the
//! [`ProtocolNegotiator`](crate::http::negotiator::ProtocolNegotiator) decides
//! when to try it and falls back to TCP when it fails.
//!
//! # Example
//! ```ignore
//! use quicnet::{QuicConfig, Session, SessionConfig};
//!
//! let session = Session::builder()
//!     .config(SessionConfig::new().quic(QuicConfig::new().prior_knowledge("b.example")))
//!     .quic_connector(Arc::new(MyH3Connector::new()))
//!     .build();
//! ```

mod config;

pub use config::QuicConfig;
