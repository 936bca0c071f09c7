//! Base types and error handling.
//!
//! Provides foundational types mirroring Chromium's `net/base/`:
//! - [`NetError`](neterror::NetError): Network error codes matching `net_error_list.h`
//! - [`SessionError`](error::SessionError): The terminal error of a logical request
//! - [`LoadState`](loadstate::LoadState): Request loading states from `load_states_list.h`

pub mod context;
pub mod error;
pub mod loadstate;
pub mod neterror;
