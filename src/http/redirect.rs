//! Redirect handling: target resolution, method rewriting, header hygiene,
//! chain length and cycle checks.

use crate::base::neterror::NetError;
use crate::http::request::{Request, RequestBody};
use http::header::{self, HeaderMap};
use http::{Method, StatusCode};
use url::Url;

/// Headers removed when a redirect leaves the original origin.
const CREDENTIAL_HEADERS: [header::HeaderName; 3] =
    [header::AUTHORIZATION, header::COOKIE, header::PROXY_AUTHORIZATION];

/// Headers describing a body that a redirect dropped.
const BODY_HEADERS: [header::HeaderName; 3] =
    [header::CONTENT_LENGTH, header::CONTENT_TYPE, header::TRANSFER_ENCODING];

#[derive(Debug, Clone)]
pub struct RedirectPolicy {
    /// Follow redirects at all.
    pub follow: bool,
    /// Maximum redirects per logical request (default: 30).
    pub max_redirects: usize,
    /// Keep method and body on 301/302/303.
    pub preserve_method: bool,
    /// Permit a redirect straight back to the hop that issued it.
    pub allow_cycles: bool,
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self { follow: true, max_redirects: 30, preserve_method: false, allow_cycles: false }
    }
}

impl RedirectPolicy {
    pub fn none() -> Self {
        Self { follow: false, ..Default::default() }
    }

    pub fn limited(max_redirects: usize) -> Self {
        Self { max_redirects, ..Default::default() }
    }
}

/// The (method, URL) pairs visited by one logical request, in order.
#[derive(Debug, Clone, Default)]
pub struct RedirectChain {
    hops: Vec<(Method, Url)>,
}

impl RedirectChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, method: Method, url: Url) {
        self.hops.push((method, url));
    }

    /// Redirects followed so far.
    pub fn redirects(&self) -> usize {
        self.hops.len().saturating_sub(1)
    }

    pub fn urls(&self) -> impl Iterator<Item = &Url> {
        self.hops.iter().map(|(_, url)| url)
    }

    fn last(&self) -> Option<&(Method, Url)> {
        self.hops.last()
    }
}

pub fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// Resolve a `Location` value against the URL that produced it. Relative and
/// scheme-relative targets are supported; the old fragment carries over when
/// the target has none.
pub fn resolve_location(current: &Url, location: &str) -> Result<Url, NetError> {
    let mut target = current.join(location.trim()).map_err(|_| NetError::InvalidRedirect)?;
    if target.fragment().is_none() {
        target.set_fragment(current.fragment());
    }
    match target.scheme() {
        "http" | "https" => Ok(target),
        _ => Err(NetError::UnsafeRedirect),
    }
}

/// Whether credentials must be dropped going from `old` to `new`.
///
/// Same host is required. A scheme/port change is tolerated only for the
/// http:80 -> https:443 upgrade or when both ports are the scheme defaults.
pub fn should_strip_auth(old: &Url, new: &Url) -> bool {
    if old.host_str() != new.host_str() {
        return true;
    }
    if old.scheme() == "http"
        && old.port_or_known_default() == Some(80)
        && new.scheme() == "https"
        && new.port_or_known_default() == Some(443)
    {
        return false;
    }
    let changed_port = old.port_or_known_default() != new.port_or_known_default();
    let changed_scheme = old.scheme() != new.scheme();
    let default_ports = old.port().is_none() && new.port().is_none();
    if changed_port && !(changed_scheme && default_ports) {
        return true;
    }
    changed_scheme && !default_ports
}

/// The method the next hop uses.
fn rewritten_method(status: StatusCode, method: &Method, policy: &RedirectPolicy) -> Method {
    let downgrade = matches!(status.as_u16(), 301 | 302 | 303)
        && *method != Method::GET
        && *method != Method::HEAD
        && !policy.preserve_method;
    if downgrade { Method::GET } else { method.clone() }
}

fn location(headers: &HeaderMap) -> Option<Result<&str, NetError>> {
    headers
        .get(header::LOCATION)
        .map(|v| v.to_str().map_err(|_| NetError::InvalidRedirect))
}

/// Build the next request if `status`/`headers` describe a redirect to
/// follow. `current` is the request that produced the response; `chain`
/// already contains it.
pub fn follow(
    current: &Request,
    status: StatusCode,
    headers: &HeaderMap,
    chain: &RedirectChain,
    policy: &RedirectPolicy,
) -> Result<Option<Request>, NetError> {
    if !policy.follow || !is_redirect(status) {
        return Ok(None);
    }
    let Some(location) = location(headers) else {
        return Ok(None);
    };
    if chain.redirects() >= policy.max_redirects {
        return Err(NetError::TooManyRedirects);
    }

    let target = resolve_location(current.url(), location?)?;
    let method = rewritten_method(status, current.method(), policy);

    if !policy.allow_cycles && chain.last().is_some_and(|(m, u)| *m == method && *u == target) {
        return Err(NetError::RedirectCycleDetected);
    }

    // Only 307/308 carry the body forward unless the caller preserves methods.
    let keeps_body = matches!(status.as_u16(), 307 | 308) || policy.preserve_method;
    let mut next = current.clone();
    if method != *current.method() || !keeps_body {
        next.set_body(RequestBody::Empty);
        for name in &BODY_HEADERS {
            next.headers_mut().remove(name);
        }
    } else if matches!(next.body_ref(), RequestBody::Stream(s) if s.is_consumed()) {
        // A one-shot body cannot be replayed to the next hop.
        return Err(NetError::RequestBodyConsumed);
    }
    if should_strip_auth(current.url(), &target) {
        for name in &CREDENTIAL_HEADERS {
            next.headers_mut().remove(name);
        }
    }
    tracing::debug!(from = %current.url(), to = %target, %status, %method, "following redirect");
    next.set_method(method);
    next.set_url(target);
    Ok(Some(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn redirect_to(location: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_str(location).unwrap());
        headers
    }

    fn chain_of(req: &Request) -> RedirectChain {
        let mut chain = RedirectChain::new();
        chain.push(req.method().clone(), req.url().clone());
        chain
    }

    #[test]
    fn test_resolve_relative_and_scheme_relative() {
        let base = url("https://a.example/dir/page#top");
        assert_eq!(resolve_location(&base, "other").unwrap().as_str(), "https://a.example/dir/other#top");
        assert_eq!(
            resolve_location(&base, "//b.example/x").unwrap().as_str(),
            "https://b.example/x#top"
        );
        assert_eq!(resolve_location(&base, "/y#frag").unwrap().as_str(), "https://a.example/y#frag");
        assert_eq!(resolve_location(&base, "ftp://a.example/").unwrap_err(), NetError::UnsafeRedirect);
    }

    #[test]
    fn test_should_strip_auth() {
        assert!(!should_strip_auth(&url("http://a.example/"), &url("https://a.example/")));
        assert!(!should_strip_auth(&url("https://a.example/"), &url("https://a.example:443/x")));
        assert!(should_strip_auth(&url("https://a.example/"), &url("https://b.example/")));
        assert!(should_strip_auth(&url("https://a.example/"), &url("http://a.example/")));
        assert!(should_strip_auth(&url("https://a.example/"), &url("https://a.example:8443/")));
        assert!(should_strip_auth(&url("http://a.example:8080/"), &url("https://a.example/")));
    }

    #[test]
    fn test_post_301_becomes_get_without_body() {
        let req = Request::post("https://a.example/form")
            .unwrap()
            .header("content-type", "text/plain")
            .header("content-length", "4")
            .body("data");
        let next = follow(&req, StatusCode::MOVED_PERMANENTLY, &redirect_to("/done"), &chain_of(&req), &RedirectPolicy::default())
            .unwrap()
            .unwrap();
        assert_eq!(next.method(), Method::GET);
        assert!(next.body_ref().is_empty());
        assert!(next.headers().get(header::CONTENT_TYPE).is_none());
        assert!(next.headers().get(header::CONTENT_LENGTH).is_none());
        assert_eq!(next.url().as_str(), "https://a.example/done");
    }

    #[test]
    fn test_302_drops_body_even_without_downgrade() {
        let req = Request::get("https://a.example/search")
            .unwrap()
            .header("content-type", "application/json")
            .header("content-length", "2")
            .body("{}");
        let next = follow(&req, StatusCode::FOUND, &redirect_to("/results"), &chain_of(&req), &RedirectPolicy::default())
            .unwrap()
            .unwrap();
        assert_eq!(next.method(), Method::GET);
        assert!(next.body_ref().is_empty());
        assert!(next.headers().get(header::CONTENT_TYPE).is_none());
        assert!(next.headers().get(header::CONTENT_LENGTH).is_none());
    }

    #[test]
    fn test_preserve_method() {
        let req = Request::post("https://a.example/form").unwrap().body("data");
        let policy = RedirectPolicy { preserve_method: true, ..Default::default() };
        let next = follow(&req, StatusCode::MOVED_PERMANENTLY, &redirect_to("/done"), &chain_of(&req), &policy)
            .unwrap()
            .unwrap();
        assert_eq!(next.method(), Method::POST);
        assert_eq!(next.body_ref().size_hint(), Some(4));
    }

    #[test]
    fn test_307_keeps_method_and_body() {
        let req = Request::new(Method::PUT, "https://a.example/x").unwrap().body("data");
        let next = follow(&req, StatusCode::TEMPORARY_REDIRECT, &redirect_to("/y"), &chain_of(&req), &RedirectPolicy::default())
            .unwrap()
            .unwrap();
        assert_eq!(next.method(), Method::PUT);
        assert_eq!(next.body_ref().size_hint(), Some(4));
    }

    #[test]
    fn test_head_is_never_downgraded() {
        let req = Request::new(Method::HEAD, "https://a.example/x").unwrap();
        let next = follow(&req, StatusCode::SEE_OTHER, &redirect_to("/y"), &chain_of(&req), &RedirectPolicy::default())
            .unwrap()
            .unwrap();
        assert_eq!(next.method(), Method::HEAD);
    }

    #[test]
    fn test_cross_host_strips_credentials() {
        let req = Request::get("https://a.example/")
            .unwrap()
            .header("authorization", "Bearer t")
            .header("cookie", "a=b")
            .header("x-keep", "1");
        let next = follow(&req, StatusCode::FOUND, &redirect_to("https://b.example/"), &chain_of(&req), &RedirectPolicy::default())
            .unwrap()
            .unwrap();
        assert!(next.headers().get(header::AUTHORIZATION).is_none());
        assert!(next.headers().get(header::COOKIE).is_none());
        assert_eq!(next.headers()["x-keep"], "1");
    }

    #[test]
    fn test_redirect_cap() {
        let req = Request::get("https://a.example/0").unwrap();
        let mut chain = chain_of(&req);
        chain.push(Method::GET, url("https://a.example/1"));
        chain.push(Method::GET, url("https://a.example/2"));
        let err = follow(&req, StatusCode::FOUND, &redirect_to("/3"), &chain, &RedirectPolicy::limited(2))
            .unwrap_err();
        assert_eq!(err, NetError::TooManyRedirects);
    }

    #[test]
    fn test_cycle_to_previous_hop() {
        let req = Request::get("https://a.example/loop").unwrap();
        let chain = chain_of(&req);
        let err = follow(&req, StatusCode::FOUND, &redirect_to("/loop"), &chain, &RedirectPolicy::default())
            .unwrap_err();
        assert_eq!(err, NetError::RedirectCycleDetected);

        let policy = RedirectPolicy { allow_cycles: true, ..Default::default() };
        assert!(follow(&req, StatusCode::FOUND, &redirect_to("/loop"), &chain, &policy).unwrap().is_some());
    }

    #[test]
    fn test_not_followed() {
        let req = Request::get("https://a.example/").unwrap();
        let chain = chain_of(&req);
        assert!(follow(&req, StatusCode::OK, &redirect_to("/x"), &chain, &RedirectPolicy::default()).unwrap().is_none());
        assert!(follow(&req, StatusCode::FOUND, &HeaderMap::new(), &chain, &RedirectPolicy::default()).unwrap().is_none());
        assert!(follow(&req, StatusCode::FOUND, &redirect_to("/x"), &chain, &RedirectPolicy::none()).unwrap().is_none());
    }
}
