//! Logical request state machine.
//!
//! Based on Chromium's `HttpNetworkTransaction` loop, but with no I/O of its
//! own: [`Transaction::step`] returns the next [`Need`] and a driver reports
//! back with an [`Event`]. The async and blocking drivers in `session` only
//! differ in how they wait.

use crate::base::error::{AttemptTarget, ConnectError, SessionError};
use crate::base::loadstate::LoadState;
use crate::base::neterror::{ErrorClass, NetError};
use crate::http::connection::{ConnectionInfo, Protocol};
use crate::http::redirect::{self, RedirectChain, RedirectPolicy};
use crate::http::request::Request;
use crate::http::response::HttpResponse;
use crate::http::retry::{calculate_backoff, should_retry, RetryConfig, RetryContext, RetryReason};
use crate::http::transport::ExchangeError;
use crate::socket::pool::{AcquireHint, PoolKey};
use crate::socket::proxy::ProxySettings;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;

/// Retry and redirect rules applied by [`decide`].
#[derive(Debug, Clone, Default)]
pub struct Policy {
    pub retry: RetryConfig,
    pub redirect: RedirectPolicy,
}

/// A failed attempt, as far as the decision engine cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub error: NetError,
    /// Request bytes may have reached the peer.
    pub request_sent: bool,
    /// Response bytes had started arriving.
    pub response_started: bool,
    pub connection: Option<ConnectionInfo>,
    pub address: Option<SocketAddr>,
}

impl AttemptFailure {
    pub fn connect(error: ConnectError) -> Self {
        Self {
            error: error.error,
            request_sent: false,
            response_started: false,
            connection: None,
            address: error.address,
        }
    }

    pub fn exchange(error: ExchangeError, connection: Option<ConnectionInfo>) -> Self {
        let address = connection.as_ref().and_then(|c| c.remote_addr);
        Self {
            error: error.error,
            request_sent: error.request_sent,
            response_started: error.response_started,
            connection,
            address,
        }
    }
}

#[derive(Debug)]
pub enum AttemptResult {
    Response { response: http::Response<Bytes>, connection: Option<ConnectionInfo> },
    Failed(AttemptFailure),
}

#[derive(Debug)]
pub enum Decision {
    /// Try the same request again after `delay`.
    Retry { delay: Duration },
    /// Follow a redirect; `response` is the hop that asked for it.
    Redirect { next: Request, response: http::Response<Bytes> },
    GiveUp(SessionError),
    Done(http::Response<Bytes>),
}

fn attempt_target(
    request: &Request,
    connection: Option<&ConnectionInfo>,
    address: Option<SocketAddr>,
) -> AttemptTarget {
    let url = request.url();
    AttemptTarget {
        host: url.host_str().unwrap_or_default().to_string(),
        port: url.port_or_known_default().unwrap_or_default(),
        protocol: connection.map(|c| c.protocol),
        address: connection.and_then(|c| c.remote_addr).or(address),
    }
}

/// Decide what follows an attempt of `request`.
///
/// Redirect statuses are checked first. Failures are retried only when the
/// error is transient, no response bytes were seen, re-sending is legal and
/// the budget allows; the last failed connection and address are recorded
/// so the next attempt avoids them.
pub fn decide(
    request: &Request,
    result: AttemptResult,
    retry: &mut RetryContext,
    chain: &mut RedirectChain,
    policy: &Policy,
) -> Decision {
    let failure = match result {
        AttemptResult::Response { response, connection } => {
            let next = redirect::follow(
                request,
                response.status(),
                response.headers(),
                chain,
                &policy.redirect,
            );
            return match next {
                Ok(Some(next)) => {
                    chain.push(next.method().clone(), next.url().clone());
                    retry.body_replayable = next.body_ref().is_replayable();
                    Decision::Redirect { next, response }
                }
                Ok(None) => Decision::Done(response),
                Err(error) => {
                    let target = attempt_target(request, connection.as_ref(), None);
                    Decision::GiveUp(SessionError::attempt(error, target))
                }
            };
        }
        AttemptResult::Failed(failure) => failure,
    };

    let target = attempt_target(request, failure.connection.as_ref(), failure.address);
    let error = failure.error;
    if failure.response_started {
        return Decision::GiveUp(SessionError::PartialResponse { error, target });
    }
    match error.class() {
        ErrorClass::InvalidRequest => return Decision::GiveUp(SessionError::InvalidRequest(error)),
        ErrorClass::Security
        | ErrorClass::PoolExhaustion
        | ErrorClass::Shutdown
        | ErrorClass::RedirectPolicy => {
            return Decision::GiveUp(SessionError::attempt(error, target));
        }
        _ => {}
    }

    // A transport may take a one-shot body and still fail before sending it.
    if request.body_ref().is_consumed() {
        tracing::debug!(%error, "request body already consumed");
        return Decision::GiveUp(SessionError::attempt(error, target));
    }

    let Some(reason) = RetryReason::from_error(&error) else {
        return Decision::GiveUp(SessionError::attempt(error, target));
    };
    let sent = failure.request_sent && !reason.is_unprocessed();
    if !retry.is_legal(sent, request.is_idempotent(), &policy.retry) {
        tracing::debug!(%error, method = %request.method(), "retry not permitted");
        return Decision::GiveUp(SessionError::attempt(error, target));
    }
    if !should_retry(retry.retries, &policy.retry) {
        let last = SessionError::attempt(error, target);
        if retry.retries == 0 {
            return Decision::GiveUp(last);
        }
        return Decision::GiveUp(SessionError::RetryExhausted {
            attempts: retry.retries + 1,
            last: Box::new(last),
        });
    }

    retry.retries += 1;
    retry.record_failure(failure.connection.as_ref().map(|c| c.id), failure.address);
    let delay = calculate_backoff(retry.retries, &policy.retry);
    tracing::debug!(?reason, retry = retry.retries, ?delay, %target, "retrying request");
    Decision::Retry { delay }
}

/// What the driver must provide before the transaction can continue.
#[derive(Debug)]
pub enum Need {
    /// Acquire a stream for `key`.
    Connection { key: PoolKey, hint: AcquireHint },
    /// Send this request on the acquired stream and read the response.
    Exchange(Request),
    /// Wait before the next attempt.
    Backoff(Duration),
    /// The logical request is finished.
    Complete(Result<HttpResponse, SessionError>),
}

/// Driver reports, answering the last [`Need`].
#[derive(Debug)]
pub enum Event {
    Connected(ConnectionInfo),
    ConnectFailed(ConnectError),
    Exchanged(http::Response<Bytes>),
    ExchangeFailed(ExchangeError),
    BackoffElapsed,
}

/// Internal state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Connecting,
    Exchanging,
    BackingOff,
    Done,
}

pub struct Transaction {
    request: Request,
    policy: Policy,
    proxy: Option<ProxySettings>,
    retry: RetryContext,
    chain: RedirectChain,
    history: Vec<HttpResponse>,
    connection: Option<ConnectionInfo>,
    state: State,
    load_state: LoadState,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("method", self.request.method())
            .field("url", &self.request.url().as_str())
            .field("state", &self.state)
            .field("retries", &self.retry.retries)
            .field("redirects", &self.chain.redirects())
            .finish()
    }
}

impl Transaction {
    pub fn new(request: Request, policy: Policy, proxy: Option<ProxySettings>) -> Self {
        let retry = RetryContext::new(request.body_ref().is_replayable());
        let mut chain = RedirectChain::new();
        chain.push(request.method().clone(), request.url().clone());
        Self {
            request,
            policy,
            proxy,
            retry,
            chain,
            history: Vec::new(),
            connection: None,
            state: State::Start,
            load_state: LoadState::Idle,
        }
    }

    /// Current request (the latest redirect hop).
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn load_state(&self) -> LoadState {
        self.load_state
    }

    pub fn retries(&self) -> usize {
        self.retry.retries
    }

    /// The request has been handed to the stream.
    pub fn request_sent(&mut self) {
        if self.state == State::Exchanging {
            self.load_state = LoadState::WaitingForResponse;
        }
    }

    /// Where the latest attempt was headed.
    pub fn last_target(&self) -> AttemptTarget {
        attempt_target(&self.request, self.connection.as_ref(), None)
    }

    /// Terminate with `error` tagged with the last target, e.g. when the
    /// overall deadline passes.
    pub fn abort(&mut self, error: NetError) -> SessionError {
        self.state = State::Done;
        self.load_state = LoadState::Idle;
        SessionError::attempt(error, self.last_target())
    }

    /// Advance the state machine. `event` answers the previous [`Need`];
    /// pass `None` on the first call.
    pub fn step(&mut self, event: Option<Event>) -> Need {
        match (self.state, event) {
            (State::Start, None) | (State::BackingOff, Some(Event::BackoffElapsed)) => {
                self.start_attempt()
            }
            (State::Connecting, Some(Event::Connected(info))) => {
                tracing::trace!(conn = info.id, protocol = %info.protocol, reused = info.reused, "attempt connected");
                self.connection = Some(info);
                self.state = State::Exchanging;
                self.load_state = LoadState::SendingRequest;
                Need::Exchange(self.request.clone())
            }
            (State::Connecting, Some(Event::ConnectFailed(error))) => {
                self.resolve(AttemptResult::Failed(AttemptFailure::connect(error)))
            }
            (State::Exchanging, Some(Event::Exchanged(response))) => {
                let connection = self.connection.clone();
                self.resolve(AttemptResult::Response { response, connection })
            }
            (State::Exchanging, Some(Event::ExchangeFailed(error))) => {
                let failure = AttemptFailure::exchange(error, self.connection.clone());
                self.resolve(AttemptResult::Failed(failure))
            }
            (state, event) => {
                tracing::error!(?state, ?event, "unexpected transaction event");
                Need::Complete(Err(self.abort(NetError::Aborted)))
            }
        }
    }

    fn start_attempt(&mut self) -> Need {
        let key = match PoolKey::from_url(self.request.url(), self.proxy.as_ref()) {
            Ok(key) => key,
            Err(error) => {
                self.state = State::Done;
                return Need::Complete(Err(SessionError::InvalidRequest(error)));
            }
        };
        let hint = AcquireHint {
            protocol: key.is_secure().then_some(Protocol::Http3),
            avoid_connections: self.retry.failed_connections.clone(),
            avoid_addrs: self.retry.failed_addrs.clone(),
        };
        self.connection = None;
        self.state = State::Connecting;
        self.load_state = LoadState::WaitingForAvailableConnection;
        Need::Connection { key, hint }
    }

    fn resolve(&mut self, result: AttemptResult) -> Need {
        let decision =
            decide(&self.request, result, &mut self.retry, &mut self.chain, &self.policy);
        match decision {
            Decision::Retry { delay } => {
                self.state = State::BackingOff;
                self.load_state = LoadState::WaitingForRetry;
                Need::Backoff(delay)
            }
            Decision::Redirect { next, response } => {
                let hop = HttpResponse::new(response, self.request.url().clone(), self.connection.take());
                self.history.push(hop);
                self.request = next;
                self.start_attempt()
            }
            Decision::GiveUp(error) => {
                self.state = State::Done;
                self.load_state = LoadState::Idle;
                Need::Complete(Err(error))
            }
            Decision::Done(response) => {
                self.state = State::Done;
                self.load_state = LoadState::Idle;
                let history = std::mem::take(&mut self.history);
                let response =
                    HttpResponse::new(response, self.request.url().clone(), self.connection.clone())
                        .with_history(history);
                Need::Complete(Ok(response))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::RequestBody;
    use http::{Method, StatusCode};

    fn info(id: u64) -> ConnectionInfo {
        ConnectionInfo {
            id,
            protocol: Protocol::Http2,
            remote_addr: Some(format!("10.0.0.{}:443", id).parse().unwrap()),
            reused: false,
        }
    }

    fn response(status: u16, location: Option<&str>) -> http::Response<Bytes> {
        let mut builder = http::Response::builder().status(status);
        if let Some(location) = location {
            builder = builder.header(http::header::LOCATION, location);
        }
        builder.body(Bytes::from_static(b"ok")).unwrap()
    }

    fn immediate() -> Policy {
        Policy { retry: RetryConfig::immediate(3), ..Default::default() }
    }

    fn expect_connection(need: Need) -> (PoolKey, AcquireHint) {
        match need {
            Need::Connection { key, hint } => (key, hint),
            other => panic!("expected connection need, got {:?}", other),
        }
    }

    fn expect_exchange(need: Need) -> Request {
        match need {
            Need::Exchange(request) => request,
            other => panic!("expected exchange need, got {:?}", other),
        }
    }

    fn expect_complete(need: Need) -> Result<HttpResponse, SessionError> {
        match need {
            Need::Complete(result) => result,
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn test_happy_path() {
        let mut tx = Transaction::new(Request::get("https://a.example/").unwrap(), immediate(), None);
        assert_eq!(tx.load_state(), LoadState::Idle);

        let (key, hint) = expect_connection(tx.step(None));
        assert_eq!(key, PoolKey::new("https", "a.example", 443, None));
        assert_eq!(hint.protocol, Some(Protocol::Http3));
        assert_eq!(tx.load_state(), LoadState::WaitingForAvailableConnection);

        expect_exchange(tx.step(Some(Event::Connected(info(1)))));
        tx.request_sent();
        assert_eq!(tx.load_state(), LoadState::WaitingForResponse);

        let resp = expect_complete(tx.step(Some(Event::Exchanged(response(200, None))))).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.connection().map(|c| c.id), Some(1));
    }

    #[test]
    fn test_get_retried_on_another_connection() {
        let mut tx = Transaction::new(Request::get("https://a.example/").unwrap(), immediate(), None);
        expect_connection(tx.step(None));
        expect_exchange(tx.step(Some(Event::Connected(info(1)))));

        let need = tx.step(Some(Event::ExchangeFailed(ExchangeError::connection(NetError::ConnectionReset))));
        assert!(matches!(need, Need::Backoff(d) if d == Duration::ZERO));
        assert_eq!(tx.load_state(), LoadState::WaitingForRetry);

        let (_, hint) = expect_connection(tx.step(Some(Event::BackoffElapsed)));
        assert_eq!(hint.avoid_connections, vec![1]);
        assert_eq!(hint.avoid_addrs, vec!["10.0.0.1:443".parse::<SocketAddr>().unwrap()]);

        expect_exchange(tx.step(Some(Event::Connected(info(2)))));
        let resp = expect_complete(tx.step(Some(Event::Exchanged(response(200, None))))).unwrap();
        assert_eq!(resp.connection().map(|c| c.id), Some(2));
        assert_eq!(tx.retries(), 1);
    }

    #[test]
    fn test_post_not_retried_after_send() {
        let req = Request::post("https://a.example/").unwrap().body("x");
        let mut tx = Transaction::new(req, immediate(), None);
        expect_connection(tx.step(None));
        expect_exchange(tx.step(Some(Event::Connected(info(1)))));

        let err = expect_complete(tx.step(Some(Event::ExchangeFailed(ExchangeError::connection(
            NetError::ConnectionReset,
        )))))
        .unwrap_err();
        assert_eq!(err.net_error(), NetError::ConnectionReset);
        assert_eq!(err.target().unwrap().protocol, Some(Protocol::Http2));
    }

    #[test]
    fn test_post_retried_when_unprocessed() {
        let req = Request::post("https://a.example/").unwrap().body("x");
        let mut tx = Transaction::new(req, immediate(), None);
        expect_connection(tx.step(None));
        expect_exchange(tx.step(Some(Event::Connected(info(1)))));

        let refused = ExchangeError::stream(NetError::Http2ServerRefusedStream);
        assert!(matches!(tx.step(Some(Event::ExchangeFailed(refused))), Need::Backoff(_)));
    }

    #[test]
    fn test_consumed_body_gives_up_with_transport_error() {
        let chunks = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from_static(b"x"))]);
        let body = RequestBody::stream(Box::pin(chunks), Some(1));
        let req = Request::new(Method::PUT, "https://a.example/blob").unwrap().body(body.clone());
        let mut tx = Transaction::new(req, immediate(), None);
        expect_connection(tx.step(None));
        expect_exchange(tx.step(Some(Event::Connected(info(1)))));

        // The transport took the body, then found the connection closed.
        let RequestBody::Stream(one_shot) = body else { unreachable!() };
        assert!(one_shot.take().is_some());
        let closed = ExchangeError::connection(NetError::ConnectionClosed).unsent();
        let err = expect_complete(tx.step(Some(Event::ExchangeFailed(closed)))).unwrap_err();

        assert_eq!(err.net_error(), NetError::ConnectionClosed);
        let target = err.target().unwrap();
        assert_eq!(target.host, "a.example");
        assert_eq!(target.protocol, Some(Protocol::Http2));
        assert_eq!(target.address, "10.0.0.1:443".parse().ok());
        assert_eq!(tx.retries(), 0);
    }

    #[test]
    fn test_partial_response_never_retried() {
        let req = Request::get("https://a.example/").unwrap();
        let mut tx = Transaction::new(req, immediate(), None);
        expect_connection(tx.step(None));
        expect_exchange(tx.step(Some(Event::Connected(info(1)))));

        let broken = ExchangeError::connection(NetError::ConnectionReset).after_response_started();
        let err = expect_complete(tx.step(Some(Event::ExchangeFailed(broken)))).unwrap_err();
        assert!(matches!(err, SessionError::PartialResponse { error: NetError::ConnectionReset, .. }));
    }

    #[test]
    fn test_retry_exhaustion_carries_last_error() {
        let policy = Policy { retry: RetryConfig::immediate(2), ..Default::default() };
        let mut tx = Transaction::new(Request::get("https://a.example/").unwrap(), policy, None);
        let mut need = tx.step(None);
        for _ in 0..2 {
            expect_connection(need);
            let failed = ConnectError::new(NetError::ConnectionRefused, None);
            assert!(matches!(tx.step(Some(Event::ConnectFailed(failed))), Need::Backoff(_)));
            need = tx.step(Some(Event::BackoffElapsed));
        }
        expect_connection(need);
        let failed = ConnectError::new(NetError::ConnectionRefused, "10.0.0.9:443".parse().ok());
        let err = expect_complete(tx.step(Some(Event::ConnectFailed(failed)))).unwrap_err();

        let SessionError::RetryExhausted { attempts, last } = err else {
            panic!("expected retry exhaustion");
        };
        assert_eq!(attempts, 3);
        assert_eq!(last.net_error(), NetError::ConnectionRefused);
        assert_eq!(last.target().unwrap().address, "10.0.0.9:443".parse().ok());
    }

    #[test]
    fn test_security_error_is_immediate() {
        let mut tx = Transaction::new(Request::get("https://a.example/").unwrap(), immediate(), None);
        expect_connection(tx.step(None));
        let err = expect_complete(tx.step(Some(Event::ConnectFailed(NetError::CertAuthorityInvalid.into()))))
            .unwrap_err();
        assert!(matches!(err, SessionError::Security { .. }));
        assert_eq!(tx.retries(), 0);
    }

    #[test]
    fn test_pool_exhaustion_is_immediate() {
        let mut tx = Transaction::new(Request::get("https://a.example/").unwrap(), immediate(), None);
        expect_connection(tx.step(None));
        let err = expect_complete(tx.step(Some(Event::ConnectFailed(NetError::PoolExhausted.into()))))
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::PoolExhaustion);
    }

    #[test]
    fn test_redirect_builds_history() {
        let req = Request::post("https://a.example/form").unwrap().body("x");
        let mut tx = Transaction::new(req, immediate(), None);
        expect_connection(tx.step(None));
        expect_exchange(tx.step(Some(Event::Connected(info(1)))));

        let (key, _) = expect_connection(
            tx.step(Some(Event::Exchanged(response(301, Some("https://b.example/done"))))),
        );
        assert_eq!(key.host, "b.example");

        let next = expect_exchange(tx.step(Some(Event::Connected(info(2)))));
        assert_eq!(next.method(), Method::GET);
        assert!(next.body_ref().is_empty());

        let resp = expect_complete(tx.step(Some(Event::Exchanged(response(200, None))))).unwrap();
        assert_eq!(resp.url().as_str(), "https://b.example/done");
        assert_eq!(resp.history().len(), 1);
        assert_eq!(resp.history()[0].status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(resp.history()[0].url().as_str(), "https://a.example/form");
    }

    #[test]
    fn test_redirect_limit() {
        let policy = Policy { redirect: RedirectPolicy::limited(2), ..immediate() };
        let mut tx = Transaction::new(Request::get("https://a.example/0").unwrap(), policy, None);
        let mut need = tx.step(None);
        for hop in 1..=2 {
            expect_connection(need);
            expect_exchange(tx.step(Some(Event::Connected(info(1)))));
            let location = format!("/{}", hop);
            need = tx.step(Some(Event::Exchanged(response(302, Some(&location)))));
        }
        expect_connection(need);
        expect_exchange(tx.step(Some(Event::Connected(info(1)))));
        let err = expect_complete(tx.step(Some(Event::Exchanged(response(302, Some("/3"))))))
            .unwrap_err();
        assert_eq!(err.net_error(), NetError::TooManyRedirects);
        assert_eq!(err.class(), ErrorClass::RedirectPolicy);
    }

    #[test]
    fn test_unsupported_scheme() {
        let mut tx = Transaction::new(Request::get("ftp://a.example/").unwrap(), immediate(), None);
        let err = expect_complete(tx.step(None)).unwrap_err();
        assert_eq!(err, SessionError::InvalidRequest(NetError::UnknownUrlScheme));
    }

    #[test]
    fn test_abort_tags_last_target() {
        let mut tx = Transaction::new(Request::get("https://a.example/").unwrap(), immediate(), None);
        expect_connection(tx.step(None));
        expect_exchange(tx.step(Some(Event::Connected(info(4)))));
        let err = tx.abort(NetError::TimedOut);
        let target = err.target().unwrap();
        assert_eq!(target.host, "a.example");
        assert_eq!(target.protocol, Some(Protocol::Http2));
        assert_eq!(target.address, "10.0.0.4:443".parse().ok());
    }

    #[test]
    fn test_unexpected_event() {
        let mut tx = Transaction::new(Request::get("https://a.example/").unwrap(), immediate(), None);
        let err = expect_complete(tx.step(Some(Event::BackoffElapsed))).unwrap_err();
        assert_eq!(err.net_error(), NetError::Aborted);
    }
}
