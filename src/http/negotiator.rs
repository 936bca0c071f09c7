//! Protocol negotiator.
//!
//! Decision order for a new connection:
//! 1. HTTP/3 over QUIC, when enabled and the host is known to support it
//!    (Alt-Svc hint or prior knowledge) and not in a QUIC cool-down.
//! 2. TCP, with TLS ALPN choosing between HTTP/2 and HTTP/1.1.
//! 3. Plain HTTP/1.1 for `http://` keys.
//!
//! A QUIC failure falls back to step 2 invisibly, except certificate
//! failures, which are never retried on another protocol.

use crate::base::error::ConnectError;
use crate::base::neterror::NetError;
use crate::http::altsvc::AltSvcCache;
use crate::http::transport::Transport;
use crate::quic::QuicConfig;
use crate::socket::connectjob::{Connect, ConnectTarget, Connecting};
use std::sync::Arc;

#[derive(Clone)]
pub struct ProtocolNegotiator {
    tcp: Arc<dyn Connect>,
    quic: Option<Arc<dyn Connect>>,
    alt_svc: Arc<AltSvcCache>,
    config: QuicConfig,
}

impl std::fmt::Debug for ProtocolNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolNegotiator")
            .field("quic", &self.quic.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl ProtocolNegotiator {
    pub fn new(
        tcp: Arc<dyn Connect>,
        quic: Option<Arc<dyn Connect>>,
        alt_svc: Arc<AltSvcCache>,
        config: QuicConfig,
    ) -> Self {
        Self { tcp, quic, alt_svc, config }
    }

    /// QUIC port to try for this target, if HTTP/3 should be attempted.
    fn h3_port(&self, target: &ConnectTarget) -> Option<u16> {
        let key = &target.key;
        if !self.config.enabled || self.quic.is_none() || !key.is_secure() || key.proxy.is_some() {
            return None;
        }
        if let Some(port) = self.alt_svc.h3_port(&key.host, key.port) {
            return Some(port);
        }
        if self.config.has_prior_knowledge(&key.host) && !self.alt_svc.is_broken(&key.host, key.port)
        {
            return Some(key.port);
        }
        None
    }

    pub async fn negotiate(
        &self,
        target: &ConnectTarget,
    ) -> Result<Arc<dyn Transport>, ConnectError> {
        if let (Some(port), Some(quic)) = (self.h3_port(target), &self.quic) {
            let key = &target.key;
            let quic_target = ConnectTarget { alt_port: Some(port), ..target.clone() };
            let attempt =
                tokio::time::timeout(self.config.handshake_timeout, quic.connect(&quic_target)).await;
            let error = match attempt {
                Ok(Ok(transport)) => {
                    self.alt_svc.mark_working(&key.host, key.port);
                    tracing::debug!(%key, port, "h3 connection established");
                    return Ok(transport);
                }
                Ok(Err(e)) if e.error.is_security() => return Err(e),
                Ok(Err(e)) => e,
                Err(_) => ConnectError::from(NetError::QuicHandshakeFailed),
            };
            let cooldown = self.alt_svc.mark_broken(&key.host, key.port);
            tracing::warn!(
                %key,
                error = %error,
                cooldown_secs = cooldown.as_secs(),
                "QUIC attempt failed; falling back to TCP"
            );
        }
        self.tcp.connect(target).await
    }
}

impl Connect for ProtocolNegotiator {
    fn connect(&self, target: &ConnectTarget) -> Connecting {
        let this = self.clone();
        let target = target.clone();
        Box::pin(async move { this.negotiate(&target).await })
    }
}
