//! Sessions and the two execution drivers.
//!
//! Both drivers run the same [`Transaction`](crate::http::transaction::Transaction)
//! decision logic; they only differ in how a pending need is waited on:
//! - [`Session`]: cooperative, awaits on the caller's tokio runtime
//! - [`BlockingSession`]: parks the calling thread, I/O runs on an owned runtime

pub mod blocking;
pub mod config;
pub mod context;
mod job;

pub use blocking::BlockingSession;
pub use config::SessionConfig;
pub use context::{Session, SessionBuilder};
