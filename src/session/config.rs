//! Session configuration.

use crate::http::redirect::RedirectPolicy;
use crate::http::retry::RetryConfig;
use crate::http::transaction::Policy;
use crate::quic::QuicConfig;
use crate::socket::pool::PoolConfig;
use crate::socket::proxy::ProxySettings;
use crate::socket::tls::TlsConfig;
use http::Method;
use std::time::Duration;

/// Total timeout for safe methods when none is configured.
const DEFAULT_READ_METHOD_TIMEOUT: Duration = Duration::from_secs(30);
/// Total timeout for other methods when none is configured.
const DEFAULT_WRITE_METHOD_TIMEOUT: Duration = Duration::from_secs(120);

/// Everything a [`Session`](super::Session) is configured with.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub redirect: RedirectPolicy,
    pub quic: QuicConfig,
    pub tls: TlsConfig,
    pub proxy: Option<ProxySettings>,
    /// Bound on DNS + TCP connect for one address.
    pub connect_timeout: Duration,
    /// Bound on one exchange, from send to the end of the response body.
    pub read_timeout: Option<Duration>,
    /// Bound on the whole logical request, retries and redirects included.
    /// `None` picks a default from the method.
    pub total_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            redirect: RedirectPolicy::default(),
            quic: QuicConfig::default(),
            tls: TlsConfig::default(),
            proxy: None,
            connect_timeout: Duration::from_secs(10),
            read_timeout: None,
            total_timeout: None,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_connections_per_key(mut self, max: usize) -> Self {
        self.pool.max_connections_per_key = max;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool.idle_timeout = timeout;
        self
    }

    /// Wait for pool capacity (the default) or fail with pool exhaustion.
    pub fn pool_block(mut self, block: bool) -> Self {
        self.pool.pool_block = block;
        self
    }

    pub fn pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool.pool_timeout = Some(timeout);
        self
    }

    pub fn max_redirects(mut self, max: usize) -> Self {
        self.redirect.max_redirects = max;
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.redirect.follow = follow;
        self
    }

    /// Keep method and body on 301/302/303.
    pub fn preserve_method(mut self, preserve: bool) -> Self {
        self.redirect.preserve_method = preserve;
        self
    }

    pub fn max_retries(mut self, max: usize) -> Self {
        self.retry.max_retries = max;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_non_idempotent(mut self, allow: bool) -> Self {
        self.retry.retry_non_idempotent = allow;
        self
    }

    pub fn http3(mut self, enabled: bool) -> Self {
        self.quic.enabled = enabled;
        self
    }

    pub fn quic(mut self, quic: QuicConfig) -> Self {
        self.quic = quic;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn proxy(mut self, proxy: ProxySettings) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    /// Overall deadline budget for a request with `method`.
    pub fn total_timeout_for(&self, method: &Method) -> Duration {
        self.total_timeout.unwrap_or_else(|| {
            if matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) {
                DEFAULT_READ_METHOD_TIMEOUT
            } else {
                DEFAULT_WRITE_METHOD_TIMEOUT
            }
        })
    }

    pub(crate) fn policy(&self) -> Policy {
        Policy { retry: self.retry.clone(), redirect: self.redirect.clone() }
    }
}
