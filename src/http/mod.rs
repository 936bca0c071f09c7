//! HTTP session machinery.
//!
//! - [`connection`] / [`stream`]: per-connection stream table and the stream multiplexer
//! - [`transport`]: the capability seam a frame codec implements, plus hyper-backed HTTP/1.1 and HTTP/2
//! - [`negotiator`] / [`altsvc`]: protocol choice and HTTP/3 hints
//! - [`transaction`], [`retry`], [`redirect`]: the decision engine driving one logical request

pub mod altsvc;
pub mod connection;
pub mod hooks;
pub mod negotiator;
pub mod redirect;
pub mod request;
pub mod response;
pub mod retry;
pub mod stream;
pub mod transaction;
pub mod transport;

// Re-exports for convenience
pub use connection::{ConnectionInfo, Protocol};
pub use hooks::Middleware;
pub use request::{Request, RequestBody};
pub use response::HttpResponse;
pub use retry::RetryConfig;
pub use redirect::RedirectPolicy;
