mod common;

use common::{fail, hang, respond, MockConnector};
use futures::stream;
use quicnet::http::transport::ExchangeError;
use quicnet::{
    ErrorClass, NetError, Protocol, Request, RequestBody, RetryConfig, Session, SessionConfig,
    SessionError,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn session(mock: &MockConnector, config: SessionConfig) -> Session {
    Session::builder().config(config).connector(mock.arc()).build()
}

/// Fails the first `n` exchanges with `error`, then answers 200.
fn failing_first(protocol: Protocol, n: usize, error: ExchangeError) -> MockConnector {
    let seen = Arc::new(AtomicUsize::new(0));
    MockConnector::new(protocol, None, move |_| {
        if seen.fetch_add(1, Ordering::SeqCst) < n {
            fail(error)
        } else {
            respond(200)
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_get_retried_on_fresh_connection() {
    let mock = MockConnector::new(Protocol::Http2, None, |ex| {
        if ex.connection == 0 {
            fail(ExchangeError::connection(NetError::ConnectionReset))
        } else {
            respond(200)
        }
    });
    let session = session(&mock, SessionConfig::default());

    let resp = session.get("https://a.example/").await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.connection().unwrap().remote_addr, Some("10.0.0.2:443".parse().unwrap()));
    assert_eq!(mock.exchanges(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_is_retried() {
    let mock = MockConnector::ok(Protocol::Http11);
    mock.fail_next_connect(NetError::ConnectionRefused);
    let session = session(&mock, SessionConfig::default());

    let resp = session.post("http://a.example/submit", "payload").await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(mock.connects(), 1);
    assert_eq!(mock.exchanges(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sent_post_is_not_retried() {
    let mock = failing_first(Protocol::Http11, 1, ExchangeError::connection(NetError::ConnectionReset));
    let session = session(&mock, SessionConfig::default());

    let err = session.post("http://a.example/submit", "payload").await.unwrap_err();
    assert_eq!(err.net_error(), NetError::ConnectionReset);
    assert_eq!(err.class(), ErrorClass::Transport);
    let target = err.target().unwrap();
    assert_eq!(target.host, "a.example");
    assert_eq!(target.protocol, Some(Protocol::Http11));
    assert_eq!(mock.exchanges(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_refused_stream_post_is_retried() {
    let mock = failing_first(Protocol::Http2, 1, ExchangeError::stream(NetError::Http2ServerRefusedStream));
    let session = session(&mock, SessionConfig::default());

    let resp = session.post("https://a.example/submit", "payload").await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(mock.exchanges(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_non_idempotent_retry_when_allowed() {
    let mock = failing_first(Protocol::Http11, 1, ExchangeError::connection(NetError::ConnectionReset));
    let session = session(&mock, SessionConfig::new().retry_non_idempotent(true));

    let resp = session.post("http://a.example/submit", "payload").await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(mock.exchanges(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_partial_response_is_never_retried() {
    let error = ExchangeError::connection(NetError::ConnectionReset).after_response_started();
    let mock = failing_first(Protocol::Http2, 1, error);
    let session = session(&mock, SessionConfig::default());

    let err = session.get("https://a.example/large").await.unwrap_err();
    assert!(matches!(err, SessionError::PartialResponse { .. }));
    assert_eq!(err.net_error(), NetError::PartialResponse);
    assert_eq!(err.target().unwrap().protocol, Some(Protocol::Http2));
    assert_eq!(mock.exchanges(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_exhausted() {
    let mock = failing_first(Protocol::Http2, usize::MAX, ExchangeError::stream(NetError::StreamReset));
    let session = session(&mock, SessionConfig::new().max_retries(2));

    let err = session.get("https://a.example/").await.unwrap_err();
    match &err {
        SessionError::RetryExhausted { attempts, last } => {
            assert_eq!(*attempts, 3);
            assert_eq!(last.net_error(), NetError::StreamReset);
        }
        other => panic!("expected RetryExhausted, got {:?}", other),
    }
    assert_eq!(err.class(), ErrorClass::RetryExhausted);
    assert_eq!(mock.exchanges(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_no_retries_reports_plain_error() {
    let mock = failing_first(Protocol::Http2, usize::MAX, ExchangeError::stream(NetError::StreamReset));
    let session = session(&mock, SessionConfig::new().retry(RetryConfig::no_retry()));

    let err = session.get("https://a.example/").await.unwrap_err();
    assert!(matches!(err, SessionError::Attempt { error: NetError::StreamReset, .. }));
    assert_eq!(mock.exchanges(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_one_shot_body_is_not_resent() {
    let mock = failing_first(Protocol::Http11, 1, ExchangeError::connection(NetError::ConnectionReset));
    let session = session(&mock, SessionConfig::default());

    let chunks = stream::iter(vec![Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"chunk"))]);
    let body = RequestBody::stream(Box::pin(chunks), Some(5));
    let request = Request::new(http::Method::PUT, "http://a.example/blob").unwrap().body(body);

    let err = session.execute(request).await.unwrap_err();
    assert_eq!(err.net_error(), NetError::ConnectionReset);
    assert_eq!(mock.exchanges(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_read_timeout_resets_stream_and_retries() {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let mock = MockConnector::new(Protocol::Http2, None, move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 { hang() } else { respond(200) }
    });
    let config = SessionConfig::new().read_timeout(Duration::from_millis(50));
    let session = session(&mock, config);

    let resp = session.get("https://a.example/").await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert_eq!(mock.resets(), 1);
    assert_eq!(session.pool().open_stream_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_total_timeout_names_last_target() {
    let mock = MockConnector::new(Protocol::Http2, None, |_| hang());
    let config = SessionConfig::new().total_timeout(Duration::from_millis(200));
    let session = session(&mock, config);

    let started = tokio::time::Instant::now();
    let err = session.get("https://a.example/slow").await.unwrap_err();
    assert!(started.elapsed() >= Duration::from_millis(200));

    assert_eq!(err.net_error(), NetError::TimedOut);
    let target = err.target().unwrap();
    assert_eq!(target.host, "a.example");
    assert_eq!(target.port, 443);
    assert_eq!(target.protocol, Some(Protocol::Http2));
    assert_eq!(target.address, Some("10.0.0.1:443".parse::<SocketAddr>().unwrap()));

    // The abandoned stream was cancelled, the connection kept.
    assert_eq!(mock.resets(), 1);
    assert_eq!(session.pool().open_stream_count(), 0);
    assert_eq!(session.pool().total_connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_certificate_failure_is_immediate() {
    let mock = MockConnector::ok(Protocol::Http2);
    mock.fail_next_connect(NetError::CertAuthorityInvalid);
    let session = session(&mock, SessionConfig::default());

    let err = session.get("https://a.example/").await.unwrap_err();
    assert!(matches!(err, SessionError::Security { error: NetError::CertAuthorityInvalid, .. }));
    assert_eq!(err.class(), ErrorClass::Security);
    assert_eq!(mock.connects(), 0);
    assert_eq!(mock.exchanges(), 0);
}

#[tokio::test]
async fn test_unsupported_scheme_is_invalid_request() {
    let mock = MockConnector::ok(Protocol::Http11);
    let session = session(&mock, SessionConfig::default());

    let err = session.get("ftp://a.example/file").await.unwrap_err();
    assert_eq!(err, SessionError::InvalidRequest(NetError::UnknownUrlScheme));
    assert_eq!(err.class(), ErrorClass::InvalidRequest);
    assert_eq!(mock.connects(), 0);
}
