//! Connection establishment: DNS -> TCP -> (proxy CONNECT) -> TLS+ALPN -> HTTP.
//!
//! Roughly equivalent to net::ConnectJob, ending in a ready [`Transport`]
//! rather than a raw socket.

use crate::base::context::{net_error_from_io, IoResultExt};
use crate::base::error::ConnectError;
use crate::base::neterror::NetError;
use crate::http::connection::Protocol;
use crate::http::transport::{Http1Transport, Http2Transport, Transport};
use crate::socket::client::SocketType;
use crate::socket::pool::PoolKey;
use crate::socket::tls::{cert_error, peer_chain_der, CertVerifier, TlsConfig};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

pub type Connecting =
    Pin<Box<dyn Future<Output = Result<Arc<dyn Transport>, ConnectError>> + Send>>;

/// Everything a connector needs to open one connection.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub key: PoolKey,
    /// Addresses that already failed for this logical request; tried last.
    pub avoid_addrs: Vec<SocketAddr>,
    /// Alternative port to dial (from an Alt-Svc hint), if not the key's port.
    pub alt_port: Option<u16>,
}

impl ConnectTarget {
    pub fn new(key: PoolKey) -> Self {
        Self { key, avoid_addrs: Vec::new(), alt_port: None }
    }

    pub fn avoiding(mut self, addrs: Vec<SocketAddr>) -> Self {
        self.avoid_addrs = addrs;
        self
    }

    /// Port to dial.
    pub fn port(&self) -> u16 {
        self.alt_port.unwrap_or(self.key.port)
    }
}

/// Opens connections for a pool key.
pub trait Connect: Send + Sync + 'static {
    fn connect(&self, target: &ConnectTarget) -> Connecting;
}

/// Pick the application protocol from an ALPN identifier.
pub fn protocol_from_alpn(alpn: Option<&[u8]>) -> Protocol {
    match alpn {
        Some(b"h2") => Protocol::Http2,
        _ => Protocol::Http11,
    }
}

/// Order resolved addresses so that previously failed ones come last.
fn order_addresses(addrs: Vec<SocketAddr>, avoid: &[SocketAddr]) -> Vec<SocketAddr> {
    let (fresh, tried): (Vec<_>, Vec<_>) = addrs.into_iter().partition(|a| !avoid.contains(a));
    fresh.into_iter().chain(tried).collect()
}

/// Connector for HTTP/1.1 and HTTP/2 over TCP (+TLS).
#[derive(Clone)]
pub struct TcpConnector {
    tls: TlsConfig,
    verifier: Option<Arc<dyn CertVerifier>>,
    connect_timeout: Duration,
}

impl std::fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnector")
            .field("tls", &self.tls)
            .field("verifier", &self.verifier.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl TcpConnector {
    pub fn new(tls: TlsConfig, connect_timeout: Duration) -> Self {
        Self { tls, verifier: None, connect_timeout }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn CertVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    async fn dial(&self, target: &ConnectTarget) -> Result<(TcpStream, SocketAddr), ConnectError> {
        let key = &target.key;
        let (host, port) = match &key.proxy {
            Some(proxy) => proxy.host_port()?,
            None => (key.host.as_str(), target.port()),
        };

        let addrs: Vec<SocketAddr> =
            tokio::net::lookup_host((host, port)).await.dns_context(host)?.collect();
        if addrs.is_empty() {
            return Err(NetError::NameNotResolved.into());
        }

        let mut last = ConnectError::from(NetError::ConnectionFailed);
        for addr in order_addresses(addrs, &target.avoid_addrs) {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(result) => match result.connection_context(addr) {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        return Ok((stream, addr));
                    }
                    Err(e) => last = e,
                },
                Err(_) => {
                    tracing::debug!(%addr, "connect timed out");
                    last = ConnectError::new(NetError::ConnectionTimedOut, Some(addr));
                }
            }
        }
        Err(last)
    }

    /// Open an HTTP CONNECT tunnel through the proxy on `stream`.
    async fn tunnel(
        &self,
        stream: TcpStream,
        target: &ConnectTarget,
        addr: SocketAddr,
    ) -> Result<TcpStream, ConnectError> {
        let Some(proxy) = &target.key.proxy else {
            return Ok(stream);
        };
        let fail = |error: NetError| ConnectError::new(error, Some(addr));

        let mut reader = BufReader::new(stream);
        let request = proxy.connect_request(&target.key.host, target.port());
        reader
            .get_mut()
            .write_all(request.as_bytes())
            .await
            .map_err(|e| fail(net_error_from_io(&e)))?;

        let mut status = String::new();
        reader.read_line(&mut status).await.map_err(|_| fail(NetError::TunnelConnectionFailed))?;
        let code = status.split_whitespace().nth(1).and_then(|c| c.parse::<u16>().ok());
        if code != Some(200) {
            tracing::debug!(status = %status.trim_end(), "proxy refused tunnel");
            return Err(fail(NetError::TunnelConnectionFailed));
        }
        // Skip the remaining response headers.
        loop {
            let mut line = String::new();
            let n = reader
                .read_line(&mut line)
                .await
                .map_err(|_| fail(NetError::TunnelConnectionFailed))?;
            if n == 0 {
                return Err(fail(NetError::TunnelConnectionFailed));
            }
            if line == "\r\n" || line == "\n" {
                break;
            }
        }
        if !reader.buffer().is_empty() {
            return Err(fail(NetError::DataReceivedUnexpectedly));
        }
        Ok(reader.into_inner())
    }

    async fn handshake_tls(
        &self,
        stream: TcpStream,
        host: &str,
        addr: SocketAddr,
    ) -> Result<SocketType, ConnectError> {
        let fail = |error: NetError| ConnectError::new(error, Some(addr));
        let connector = self.tls.build_connector().map_err(fail)?;
        let mut config = connector.configure().map_err(|_| fail(NetError::SslProtocolError))?;
        config.set_use_server_name_indication(TlsConfig::should_set_sni(host));
        config.set_verify_hostname(self.tls.verify_peer);

        let tls = match tokio_boring::connect(config, host, stream).await {
            Ok(tls) => tls,
            Err(e) => {
                let error = e
                    .ssl()
                    .and_then(|ssl| cert_error(ssl.verify_result()))
                    .unwrap_or(NetError::SslProtocolError);
                tracing::debug!(%host, %error, "TLS handshake failed");
                return Err(fail(error));
            }
        };

        if self.tls.verify_peer {
            if let Some(verifier) = &self.verifier {
                let chain = peer_chain_der(tls.ssl());
                verifier.verify(&chain, host).map_err(|error| {
                    // Collaborator failures are always trust failures.
                    fail(if error.is_security() { error } else { NetError::CertInvalid })
                })?;
            }
        }
        Ok(SocketType::Ssl(tls))
    }

    /// Run the full connect sequence for `target`.
    pub async fn connect_transport(
        &self,
        target: &ConnectTarget,
    ) -> Result<Arc<dyn Transport>, ConnectError> {
        let (stream, addr) = self.dial(target).await?;
        let stream = self.tunnel(stream, target, addr).await?;

        let socket = if target.key.is_secure() {
            self.handshake_tls(stream, &target.key.host, addr).await?
        } else {
            SocketType::Tcp(stream)
        };

        let protocol = protocol_from_alpn(socket.alpn_protocol());
        tracing::debug!(key = %target.key, %addr, %protocol, "connected");
        let transport: Arc<dyn Transport> = match protocol {
            Protocol::Http2 => Arc::new(
                Http2Transport::handshake(socket, Some(addr))
                    .await
                    .map_err(|e| ConnectError::new(e, Some(addr)))?,
            ),
            _ => Arc::new(
                Http1Transport::handshake(socket, Some(addr))
                    .await
                    .map_err(|e| ConnectError::new(e, Some(addr)))?,
            ),
        };
        Ok(transport)
    }
}

impl Connect for TcpConnector {
    fn connect(&self, target: &ConnectTarget) -> Connecting {
        let this = self.clone();
        let target = target.clone();
        Box::pin(async move { this.connect_transport(&target).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_protocol_from_alpn() {
        assert_eq!(protocol_from_alpn(Some(b"h2")), Protocol::Http2);
        assert_eq!(protocol_from_alpn(Some(b"http/1.1")), Protocol::Http11);
        assert_eq!(protocol_from_alpn(None), Protocol::Http11);
    }

    #[test]
    fn test_failed_addresses_go_last() {
        let a: SocketAddr = "10.0.0.1:443".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:443".parse().unwrap();
        let c: SocketAddr = "10.0.0.3:443".parse().unwrap();
        assert_eq!(order_addresses(vec![a, b, c], &[a]), vec![b, c, a]);
    }

    #[tokio::test]
    async fn test_connection_refused_carries_address() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TcpConnector::new(TlsConfig::default(), Duration::from_secs(2));
        let key = PoolKey::new("http", "127.0.0.1", port, None);
        let err = match connector.connect_transport(&ConnectTarget::new(key)).await {
            Err(e) => e,
            Ok(_) => panic!("connect to closed port succeeded"),
        };
        assert_eq!(err.error, NetError::ConnectionRefused);
        assert_eq!(err.address.map(|a| a.port()), Some(port));
    }

    #[tokio::test]
    async fn test_proxy_tunnel_rejected() {
        let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = proxy_listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let _ = socket.read(&mut buf).await;
            socket.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await.unwrap();
        });

        let proxy =
            crate::socket::proxy::ProxySettings::new(&format!("http://{}", proxy_addr)).unwrap();
        let key = PoolKey::new("https", "a.example", 443, Some(proxy));
        let connector = TcpConnector::new(TlsConfig::default(), Duration::from_secs(2));
        let err = match connector.connect_transport(&ConnectTarget::new(key)).await {
            Err(e) => e,
            Ok(_) => panic!("tunnel should have been refused"),
        };
        assert_eq!(err.error, NetError::TunnelConnectionFailed);
    }
}
