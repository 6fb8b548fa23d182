//! CAE Bastion - SSH entry point for container instances
//!
//! Users log in as `<instance>:<remote-user>` with a public key registered on
//! the instance. Each interactive channel is bridged to a pooled SSH shell, a
//! container exec session, or a TCP tunnel into the instance.

pub mod backend;
pub mod bastion;
pub mod config;
pub mod container;
pub mod dispatch;
pub mod instance;
pub mod pool;
pub mod server;
pub mod session;
pub mod ssh;

#[cfg(test)]
mod testing;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use bastion::{Bastion, BastionError};
pub use config::BastionConfig;

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
