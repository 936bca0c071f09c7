//! Socket and connection management.
//!
//! Provides connection pooling and socket handling mirroring Chromium's `net/socket/`:
//! - [`pool`]: Connection pooling per (scheme, host, port, proxy) key
//! - [`connectjob`]: DNS → TCP → proxy tunnel → TLS+ALPN connection flow
//! - [`proxy`]: HTTP CONNECT proxy settings
//! - [`tls`]: TLS configuration with BoringSSL and certificate verification

pub mod client;
pub mod connectjob;
pub mod pool;
pub mod proxy;
pub mod tls;
