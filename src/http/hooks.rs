//! Lifecycle hooks around a logical request.

use crate::base::neterror::NetError;
use crate::http::connection::ConnectionInfo;
use crate::http::request::Request;
use crate::http::response::HttpResponse;
use std::sync::Arc;

/// Observes and adjusts requests as a session processes them.
///
/// All methods default to no-ops.
pub trait Middleware: Send + Sync {
    /// Called once per logical request before any connection work.
    /// An error rejects the request.
    fn pre_request(&self, _request: &mut Request) -> Result<(), NetError> {
        Ok(())
    }

    /// Called before each hop is sent, once a live connection was picked.
    fn pre_send(&self, _request: &Request, _connection: &ConnectionInfo) {}

    /// Called on the final response.
    fn response(&self, _response: &mut HttpResponse) {}
}

/// Middleware run in registration order.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain").field("len", &self.middlewares.len()).finish()
    }
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub fn pre_request(&self, request: &mut Request) -> Result<(), NetError> {
        self.middlewares.iter().try_for_each(|m| m.pre_request(request))
    }

    pub fn pre_send(&self, request: &Request, connection: &ConnectionInfo) {
        for m in &self.middlewares {
            m.pre_send(request, connection);
        }
    }

    pub fn response(&self, response: &mut HttpResponse) {
        for m in &self.middlewares {
            m.response(response);
        }
    }
}
