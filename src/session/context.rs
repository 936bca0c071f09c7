//! Session object and builder.
//!
//! A [`Session`] owns the pool, the Alt-Svc cache and the middleware chain.
//! Nothing is process-global: independent sessions never share connections.
//!
//! # Example
//!
//! ```rust,ignore
//! use quicnet::{Session, SessionConfig};
//!
//! let session = Session::builder()
//!     .config(SessionConfig::new().max_connections_per_key(4))
//!     .build();
//!
//! let resp = session.get("https://example.com").await?;
//! session.close();
//! ```

use crate::base::error::SessionError;
use crate::http::altsvc::AltSvcCache;
use crate::http::connection::Protocol;
use crate::http::hooks::{Middleware, MiddlewareChain};
use crate::http::negotiator::ProtocolNegotiator;
use crate::http::request::Request;
use crate::http::response::HttpResponse;
use crate::session::config::SessionConfig;
use crate::session::job;
use crate::socket::connectjob::{Connect, TcpConnector};
use crate::socket::pool::ConnectionPool;
use crate::socket::tls::CertVerifier;
use bytes::Bytes;
use http::Method;
use std::sync::Arc;
use url::Url;

/// State shared by every clone of a session and by both drivers.
pub(crate) struct SessionInner {
    pub(crate) config: SessionConfig,
    pub(crate) pool: ConnectionPool,
    pub(crate) alt_svc: Arc<AltSvcCache>,
    pub(crate) middleware: MiddlewareChain,
}

impl SessionInner {
    /// Learn from a response before the decision engine sees it.
    pub(crate) fn observe(&self, url: &Url, protocol: Protocol, response: &http::Response<Bytes>) {
        if protocol == Protocol::Http3 || url.scheme() != "https" {
            return;
        }
        let (Some(host), Some(port)) = (url.host_str(), url.port_or_known_default()) else {
            return;
        };
        for value in response.headers().get_all(http::header::ALT_SVC) {
            if let Ok(value) = value.to_str() {
                self.alt_svc.record(host, port, value);
            }
        }
    }

    /// Run response hooks on a finished request.
    pub(crate) fn finish(
        &self,
        result: Result<HttpResponse, SessionError>,
    ) -> Result<HttpResponse, SessionError> {
        let mut response = result?;
        self.middleware.response(&mut response);
        Ok(response)
    }
}

/// An HTTP session: one connection pool plus the request policy around it.
///
/// Cheap to clone; clones share the pool. Use [`Session::builder()`] to
/// configure one.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("pool", &self.inner.pool)
            .field("middleware", &self.inner.middleware)
            .finish()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Create a session with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Run a logical request to completion: connection reuse, protocol
    /// fallback, retries and redirects included.
    pub async fn execute(&self, request: Request) -> Result<HttpResponse, SessionError> {
        job::execute(&self.inner, request).await
    }

    pub async fn get(&self, url: &str) -> Result<HttpResponse, SessionError> {
        self.execute(Request::get(url).map_err(SessionError::InvalidRequest)?).await
    }

    pub async fn post<B: Into<crate::http::request::RequestBody>>(
        &self,
        url: &str,
        body: B,
    ) -> Result<HttpResponse, SessionError> {
        let request = Request::new(Method::POST, url).map_err(SessionError::InvalidRequest)?;
        self.execute(request.body(body)).await
    }

    /// Close every connection and fail pending and future requests with
    /// [`SessionError::Shutdown`].
    pub fn close(&self) {
        tracing::debug!("closing session");
        self.inner.pool.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn alt_svc(&self) -> &AltSvcCache {
        &self.inner.alt_svc
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }
}

/// Builder for creating a [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    connector: Option<Arc<dyn Connect>>,
    quic_connector: Option<Arc<dyn Connect>>,
    verifier: Option<Arc<dyn CertVerifier>>,
    middleware: MiddlewareChain,
}

impl SessionBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the TCP/TLS connector.
    pub fn connector(mut self, connector: Arc<dyn Connect>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Connector producing HTTP/3 transports. Without one, HTTP/3 is never
    /// attempted.
    pub fn quic_connector(mut self, connector: Arc<dyn Connect>) -> Self {
        self.quic_connector = Some(connector);
        self
    }

    /// Certificate verification collaborator for the built-in connector.
    pub fn verifier(mut self, verifier: Arc<dyn CertVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Build the session. Starts the idle sweep if called inside a tokio runtime.
    pub fn build(self) -> Session {
        let config = self.config;
        let tcp: Arc<dyn Connect> = match self.connector {
            Some(connector) => connector,
            None => {
                let mut connector = TcpConnector::new(config.tls.clone(), config.connect_timeout);
                if let Some(verifier) = self.verifier {
                    connector = connector.with_verifier(verifier);
                }
                Arc::new(connector)
            }
        };
        let alt_svc = Arc::new(AltSvcCache::new(config.quic.broken_cooldown));
        let negotiator = ProtocolNegotiator::new(
            tcp,
            self.quic_connector,
            Arc::clone(&alt_svc),
            config.quic.clone(),
        );
        let mut pool_config = config.pool.clone();
        pool_config.default_max_h3_streams =
            usize::try_from(config.quic.initial_max_streams_bidi).unwrap_or(usize::MAX);
        let pool = ConnectionPool::new(pool_config, Arc::new(negotiator));
        pool.start_cleanup_task();

        Session {
            inner: Arc::new(SessionInner { config, pool, alt_svc, middleware: self.middleware }),
        }
    }
}
