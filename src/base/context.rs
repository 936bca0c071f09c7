//! Ergonomic error context helpers.
//!
//! Provides extension traits for adding context to `Result` types,
//! converting IO errors into address-tagged [`ConnectError`]s.

use crate::base::error::ConnectError;
use crate::base::neterror::NetError;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;

/// Map an IO error onto the closest network error code.
pub fn net_error_from_io(error: &io::Error) -> NetError {
    match error.kind() {
        ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
        ErrorKind::ConnectionReset => NetError::ConnectionReset,
        ErrorKind::ConnectionAborted => NetError::ConnectionAborted,
        ErrorKind::NotConnected => NetError::SocketNotConnected,
        ErrorKind::TimedOut => NetError::ConnectionTimedOut,
        ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe => NetError::ConnectionClosed,
        ErrorKind::AddrNotAvailable => NetError::AddressUnreachable,
        _ => NetError::ConnectionFailed,
    }
}

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Tag an IO error with the address that was being dialled.
    ///
    /// # Example
    /// ```ignore
    /// use quicnet::base::context::IoResultExt;
    ///
    /// let stream = TcpStream::connect(addr).await.connection_context(addr)?;
    /// ```
    fn connection_context(self, addr: SocketAddr) -> Result<T, ConnectError>;

    /// Map a DNS lookup failure to `NameNotResolved`.
    fn dns_context(self, domain: &str) -> Result<T, ConnectError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn connection_context(self, addr: SocketAddr) -> Result<T, ConnectError> {
        self.map_err(|e| {
            tracing::debug!(%addr, error = %e, "connect failed");
            ConnectError::new(net_error_from_io(&e), Some(addr))
        })
    }

    fn dns_context(self, domain: &str) -> Result<T, ConnectError> {
        self.map_err(|e| {
            tracing::debug!(domain = %domain, error = %e, "DNS resolution failed");
            ConnectError::from(NetError::NameNotResolved)
        })
    }
}
