//! Final response of a logical request.

use crate::http::connection::ConnectionInfo;
use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use url::Url;

/// A fully received response, with the redirect hops that led to it.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    url: Url,
    history: Vec<HttpResponse>,
    connection: Option<ConnectionInfo>,
}

impl HttpResponse {
    /// Build from a transport response received for `url`.
    pub fn new(resp: http::Response<Bytes>, url: Url, connection: Option<ConnectionInfo>) -> Self {
        let (parts, body) = resp.into_parts();
        Self {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            body,
            url,
            history: Vec::new(),
            connection,
        }
    }

    pub(crate) fn with_history(mut self, history: Vec<HttpResponse>) -> Self {
        self.history = history;
        self
    }

    /// Get the status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the HTTP version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get a reference to the headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The URL this response was received from, after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Intermediate redirect responses, oldest first.
    pub fn history(&self) -> &[HttpResponse] {
        &self.history
    }

    /// Connection that carried the final exchange.
    pub fn connection(&self) -> Option<&ConnectionInfo> {
        self.connection.as_ref()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Consume the response, returning the body.
    pub fn bytes(self) -> Bytes {
        self.body
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
