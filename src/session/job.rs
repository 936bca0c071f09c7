//! Cooperative driver.
//!
//! Interprets [`Need`]s by awaiting: a pending acquire, exchange or backoff
//! suspends only this request's task. Every wait is bounded by the request's
//! overall deadline; hitting it cancels the stream in flight and fails with
//! [`NetError::TimedOut`] tagged with the last target.

use crate::base::error::SessionError;
use crate::base::neterror::NetError;
use crate::http::request::Request;
use crate::http::response::HttpResponse;
use crate::http::stream::Stream;
use crate::http::transaction::{Event, Need, Transaction};
use crate::http::transport::ExchangeError;
use crate::session::context::SessionInner;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};

/// Resolve one logical request.
pub(crate) async fn execute(
    inner: &SessionInner,
    mut request: Request,
) -> Result<HttpResponse, SessionError> {
    if inner.pool.is_closed() {
        return Err(SessionError::Shutdown);
    }
    inner.middleware.pre_request(&mut request).map_err(SessionError::InvalidRequest)?;

    let deadline = Instant::now() + inner.config.total_timeout_for(request.method());
    let mut tx = Transaction::new(request, inner.config.policy(), inner.config.proxy.clone());
    let mut stream: Option<Stream> = None;
    let mut event = None;

    loop {
        let next = match tx.step(event.take()) {
            Need::Complete(result) => return inner.finish(result),
            Need::Connection { key, hint } => {
                match timeout_at(deadline, inner.pool.acquire(&key, &hint)).await {
                    Ok(Ok(acquired)) => {
                        let info = acquired.connection_info();
                        stream = Some(acquired);
                        Event::Connected(info)
                    }
                    Ok(Err(e)) => Event::ConnectFailed(e),
                    Err(_) => return Err(tx.abort(NetError::TimedOut)),
                }
            }
            Need::Exchange(request) => {
                let Some(stream) = stream.take() else {
                    return Err(tx.abort(NetError::SocketNotConnected));
                };
                match exchange(inner, &mut tx, stream, request, deadline).await {
                    Some(event) => event,
                    None => return Err(tx.abort(NetError::TimedOut)),
                }
            }
            Need::Backoff(delay) => {
                if !delay.is_zero() && timeout_at(deadline, tokio::time::sleep(delay)).await.is_err()
                {
                    return Err(tx.abort(NetError::TimedOut));
                }
                Event::BackoffElapsed
            }
        };
        event = Some(next);
    }
}

/// Run one exchange on `stream`. `None` means the deadline passed; the
/// stream is cancelled on the way out.
async fn exchange(
    inner: &SessionInner,
    tx: &mut Transaction,
    mut stream: Stream,
    request: Request,
    deadline: Instant,
) -> Option<Event> {
    let info = stream.connection_info();
    inner.middleware.pre_send(&request, &info);
    let url = request.url().clone();
    if let Err(e) = stream.send(request) {
        return Some(Event::ExchangeFailed(ExchangeError::stream(e).unsent()));
    }
    tx.request_sent();

    let received = timeout_at(deadline, receive(&mut stream, inner.config.read_timeout)).await;
    match received {
        Ok(Ok(response)) => {
            inner.observe(&url, info.protocol, &response);
            Some(Event::Exchanged(response))
        }
        Ok(Err(e)) => Some(Event::ExchangeFailed(e)),
        Err(_) => None,
    }
}

async fn receive(
    stream: &mut Stream,
    read_timeout: Option<Duration>,
) -> Result<http::Response<bytes::Bytes>, ExchangeError> {
    match read_timeout {
        Some(limit) => match timeout(limit, stream.receive()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(stream = stream.id(), ?limit, "read timeout");
                Err(ExchangeError::stream(NetError::TimedOut))
            }
        },
        None => stream.receive().await,
    }
}
