//! SSH module - outbound connections to backend instances
//!
//! # Features
//! - Key-first authentication with password fallback
//! - Trust-on-first-use host keys (see `known_hosts`)
//! - Single-owner handle task (see `handle_owner`)
//! - Authorized-key body matching and diagnostics fingerprints (see `keys`)

mod client;
mod config;
mod error;
mod handle_owner;
pub mod keys;
pub mod known_hosts;

pub use client::{ClientHandler, SshClient};
pub use config::{Asset, ConnectOptions, SystemUser};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
