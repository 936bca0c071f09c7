use crate::base::neterror::NetError;
use std::fmt;
use std::hash::{Hash, Hasher};
use url::Url;
use zeroize::Zeroizing;

/// HTTP CONNECT proxy settings.
///
/// The proxy identity (scheme, host, port and user name) is part of the pool
/// key, so connections tunnelled through different proxies or different
/// proxy accounts are never shared.
#[derive(Clone)]
pub struct ProxySettings {
    /// Proxy URL (e.g., `http://proxy.com:8080`)
    pub url: Url,
    /// Proxy username for authentication
    pub username: Option<String>,
    /// Proxy password (zeroized on drop)
    pub password: Option<Zeroizing<String>>,
}

impl fmt::Debug for ProxySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxySettings")
            .field("url", &self.url.as_str())
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl PartialEq for ProxySettings {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for ProxySettings {}

impl Hash for ProxySettings {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl ProxySettings {
    /// Parse a proxy URL. Only `http://` proxies are supported; credentials
    /// embedded in the URL are moved into `username`/`password`.
    pub fn new(url_str: &str) -> Result<Self, NetError> {
        let mut url = Url::parse(url_str).map_err(|_| NetError::InvalidUrl)?;
        if url.scheme() != "http" {
            return Err(NetError::DisallowedUrlScheme);
        }
        if url.host_str().is_none() {
            return Err(NetError::InvalidUrl);
        }

        let username = Some(url.username().to_string()).filter(|u| !u.is_empty());
        let password = url.password().map(|p| Zeroizing::new(p.to_string()));
        let _ = url.set_username("");
        let _ = url.set_password(None);
        Ok(Self { url, username, password })
    }

    /// Create proxy from `HTTPS_PROXY`/`https_proxy`, then `HTTP_PROXY`/`http_proxy`.
    pub fn from_env() -> Option<Self> {
        let url_str = std::env::var("HTTPS_PROXY")
            .or_else(|_| std::env::var("https_proxy"))
            .or_else(|_| std::env::var("HTTP_PROXY"))
            .or_else(|_| std::env::var("http_proxy"))
            .ok()?;
        Self::new(&url_str).ok()
    }

    /// Add authentication credentials.
    pub fn with_auth(mut self, user: &str, pass: &str) -> Self {
        self.username = Some(user.to_string());
        self.password = Some(Zeroizing::new(pass.to_string()));
        self
    }

    /// Proxy host and port.
    pub fn host_port(&self) -> Result<(&str, u16), NetError> {
        let host = self.url.host_str().ok_or(NetError::InvalidUrl)?;
        Ok((host, self.url.port().unwrap_or(80)))
    }

    /// Stable identity used in pool keys. Never contains the password.
    pub fn identity(&self) -> String {
        let (host, port) = self.host_port().unwrap_or(("", 80));
        match &self.username {
            Some(user) => format!("{}://{}@{}:{}", self.url.scheme(), user, host, port),
            None => format!("{}://{}:{}", self.url.scheme(), host, port),
        }
    }

    /// `Proxy-Authorization` header value for the CONNECT request.
    pub fn auth_header(&self) -> Option<Zeroizing<String>> {
        let (user, pass) = (self.username.as_ref()?, self.password.as_ref()?);
        use base64::{engine::general_purpose, Engine as _};
        let creds = Zeroizing::new(format!("{}:{}", user, pass.as_str()));
        Some(Zeroizing::new(format!("Basic {}", general_purpose::STANDARD.encode(creds.as_bytes()))))
    }

    /// Build the CONNECT request that opens a tunnel to `host:port`.
    pub(crate) fn connect_request(&self, host: &str, port: u16) -> Zeroizing<String> {
        let target = format!("{}:{}", host, port);
        let mut req = Zeroizing::new(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target));
        if let Some(auth) = self.auth_header() {
            req.push_str("Proxy-Authorization: ");
            req.push_str(&auth);
            req.push_str("\r\n");
        }
        req.push_str("\r\n");
        req
    }
}
