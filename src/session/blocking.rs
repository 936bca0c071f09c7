//! Thread-blocking driver.
//!
//! [`BlockingSession`] owns a tokio runtime for connection I/O and runs the
//! same [`Transaction`] as the async driver, parking the calling thread on
//! each [`Need`]. Many threads may call [`BlockingSession::execute`] at once.

use crate::base::context::net_error_from_io;
use crate::base::error::SessionError;
use crate::base::neterror::NetError;
use crate::http::request::Request;
use crate::http::response::HttpResponse;
use crate::http::stream::Stream;
use crate::http::transaction::{Event, Need, Transaction};
use crate::http::transport::ExchangeError;
use crate::session::context::{Session, SessionBuilder};
use std::time::Instant;
use tokio::runtime::{Builder, Runtime};

pub struct BlockingSession {
    session: Session,
    runtime: Runtime,
}

impl std::fmt::Debug for BlockingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingSession").field("session", &self.session).finish()
    }
}

impl BlockingSession {
    /// Create a blocking session with default settings.
    pub fn new() -> Result<Self, NetError> {
        Self::from_builder(Session::builder())
    }

    /// Build the session inside a dedicated runtime.
    pub fn from_builder(builder: SessionBuilder) -> Result<Self, NetError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("quicnet-io")
            .enable_all()
            .build()
            .map_err(|e| net_error_from_io(&e))?;
        let session = {
            let _guard = runtime.enter();
            builder.build()
        };
        Ok(Self { session, runtime })
    }

    /// The underlying session; usable from async code on any runtime.
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn get(&self, url: &str) -> Result<HttpResponse, SessionError> {
        self.execute(Request::get(url).map_err(SessionError::InvalidRequest)?)
    }

    /// Resolve one logical request, blocking the calling thread.
    ///
    /// Must not be called from within an async context.
    pub fn execute(&self, mut request: Request) -> Result<HttpResponse, SessionError> {
        let inner = self.session.inner();
        if inner.pool.is_closed() {
            return Err(SessionError::Shutdown);
        }
        inner.middleware.pre_request(&mut request).map_err(SessionError::InvalidRequest)?;

        let deadline = Instant::now() + inner.config.total_timeout_for(request.method());
        let tokio_deadline = tokio::time::Instant::from_std(deadline);
        let mut tx = Transaction::new(request, inner.config.policy(), inner.config.proxy.clone());
        let mut stream: Option<Stream> = None;
        let mut event = None;

        loop {
            let next = match tx.step(event.take()) {
                Need::Complete(result) => return inner.finish(result),
                Need::Connection { key, hint } => {
                    let acquired = self.runtime.block_on(async {
                        tokio::time::timeout_at(tokio_deadline, inner.pool.acquire(&key, &hint)).await
                    });
                    match acquired {
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
                    let Some(mut current) = stream.take() else {
                        return Err(tx.abort(NetError::SocketNotConnected));
                    };
                    let info = current.connection_info();
                    inner.middleware.pre_send(&request, &info);
                    let url = request.url().clone();
                    if let Err(e) = current.send(request) {
                        Event::ExchangeFailed(ExchangeError::stream(e).unsent())
                    } else {
                        tx.request_sent();
                        let read_timeout = inner.config.read_timeout;
                        let received = self.runtime.block_on(async {
                            let receive = async {
                                match read_timeout {
                                    Some(limit) => tokio::time::timeout(limit, current.receive())
                                        .await
                                        .unwrap_or(Err(ExchangeError::stream(NetError::TimedOut))),
                                    None => current.receive().await,
                                }
                            };
                            tokio::time::timeout_at(tokio_deadline, receive).await
                        });
                        match received {
                            Ok(Ok(response)) => {
                                inner.observe(&url, info.protocol, &response);
                                Event::Exchanged(response)
                            }
                            Ok(Err(e)) => Event::ExchangeFailed(e),
                            Err(_) => return Err(tx.abort(NetError::TimedOut)),
                        }
                    }
                }
                Need::Backoff(delay) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if delay >= remaining {
                        std::thread::sleep(remaining);
                        return Err(tx.abort(NetError::TimedOut));
                    }
                    std::thread::sleep(delay);
                    Event::BackoffElapsed
                }
            };
            event = Some(next);
        }
    }

    pub fn close(&self) {
        self.session.close();
    }
}

impl Drop for BlockingSession {
    fn drop(&mut self) {
        self.session.close();
    }
}
