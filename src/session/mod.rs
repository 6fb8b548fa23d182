//! Session Management Module
//!
//! A session pairs one user channel with one backend stream:
//! - `Session`: lifecycle flags, timestamps and the stop token
//! - `SessionRegistry`: thread-safe lookup via DashMap
//! - `bridge`: the relay loop and its teardown

mod bridge;
mod registry;
mod types;

pub use bridge::bridge;
pub use registry::SessionRegistry;
pub use types::{Session, SessionInfo, SessionTarget};
