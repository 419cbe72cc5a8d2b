//! FFI bindings for native player shells
//!
//! A uniffi `Session` object wraps the peer runtime; the native side supplies
//! the media element and receives session events through callback interfaces.

mod handlers;
mod session;
mod types;

pub use session::*;
pub use types::*;
