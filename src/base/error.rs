//! Terminal errors surfaced to callers of a session.
//!
//! [`NetError`] is the atomic code; [`SessionError`] is what a logical request
//! finally resolves to, always tagged with the last target that was tried.

use crate::base::neterror::{ErrorClass, NetError};
use crate::http::connection::Protocol;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Where an attempt was headed when it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptTarget {
    pub host: String,
    pub port: u16,
    pub protocol: Option<Protocol>,
    pub address: Option<SocketAddr>,
}

impl AttemptTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, protocol: None, address: None }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_address(mut self, address: Option<SocketAddr>) -> Self {
        self.address = address;
        self
    }
}

impl fmt::Display for AttemptTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)?;
        if let Some(protocol) = self.protocol {
            write!(f, " via {}", protocol)?;
        }
        if let Some(addr) = self.address {
            write!(f, " ({})", addr)?;
        }
        Ok(())
    }
}

/// Failure while establishing a connection.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("{error}")]
pub struct ConnectError {
    pub error: NetError,
    /// Last address dialled, if resolution got that far.
    pub address: Option<SocketAddr>,
}

impl ConnectError {
    pub fn new(error: NetError, address: Option<SocketAddr>) -> Self {
        Self { error, address }
    }
}

impl From<NetError> for ConnectError {
    fn from(error: NetError) -> Self {
        Self { error, address: None }
    }
}

/// The single terminal error a logical request resolves to.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// A failure attributable to one attempt against `target`.
    #[error("{error} [{target}]")]
    Attempt { error: NetError, target: AttemptTarget },

    /// Certificate or TLS trust failure. Surfaced immediately.
    #[error("security error: {error} [{target}]")]
    Security { error: NetError, target: AttemptTarget },

    /// The connection died after part of the response had arrived.
    #[error("connection failed after partial response: {error} [{target}]")]
    PartialResponse { error: NetError, target: AttemptTarget },

    /// The retry budget was spent; `last` is the final underlying error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted { attempts: usize, last: Box<SessionError> },

    /// The request could not be turned into an attempt at all.
    #[error("invalid request: {0}")]
    InvalidRequest(NetError),

    /// The owning session was closed.
    #[error("session closed")]
    Shutdown,
}

impl SessionError {
    pub fn attempt(error: NetError, target: AttemptTarget) -> Self {
        if error.is_security() {
            SessionError::Security { error, target }
        } else if error == NetError::SessionClosed {
            SessionError::Shutdown
        } else {
            SessionError::Attempt { error, target }
        }
    }

    /// Taxonomy class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            SessionError::Attempt { error, .. } => error.class(),
            SessionError::Security { .. } => ErrorClass::Security,
            SessionError::PartialResponse { .. } => ErrorClass::Transport,
            SessionError::RetryExhausted { .. } => ErrorClass::RetryExhausted,
            SessionError::InvalidRequest(_) => ErrorClass::InvalidRequest,
            SessionError::Shutdown => ErrorClass::Shutdown,
        }
    }

    /// The underlying atomic error code.
    pub fn net_error(&self) -> NetError {
        match self {
            SessionError::Attempt { error, .. }
            | SessionError::Security { error, .. }
            | SessionError::InvalidRequest(error) => *error,
            SessionError::PartialResponse { .. } => NetError::PartialResponse,
            SessionError::RetryExhausted { last, .. } => last.net_error(),
            SessionError::Shutdown => NetError::SessionClosed,
        }
    }

    /// The last attempted target, where one exists.
    pub fn target(&self) -> Option<&AttemptTarget> {
        match self {
            SessionError::Attempt { target, .. }
            | SessionError::Security { target, .. }
            | SessionError::PartialResponse { target, .. } => Some(target),
            SessionError::RetryExhausted { last, .. } => last.target(),
            SessionError::InvalidRequest(_) | SessionError::Shutdown => None,
        }
    }
}
