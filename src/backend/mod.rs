//! Backend stream adapters
//!
//! Every bridged operation pairs two `Endpoint`s: the user-facing SSH channel
//! and a backend `Server`. The three backend kinds are a shell channel on a
//! pooled SSH transport, a container exec stream, and a raw TCP socket.
//!
//! `recv` implementations must be cancel-safe: the bridge polls both sides in
//! one `tokio::select!` and drops whichever future lost the race.

mod channel;
mod direct;
mod exec;
mod pooled;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::container::ContainerError;
use crate::pool::PoolError;
use crate::ssh::SshError;

pub use channel::ChannelEndpoint;
pub use direct::{DirectTunnel, TunnelServer};
pub use exec::{ExecServer, EXIT_COMMAND, SHELLS};
pub use pooled::{PooledShell, PooledShellServer};

/// Upper bound on a single relayed chunk
pub const CHUNK_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("container no shell")]
    NoShell,

    #[error("no server connection available: {0}")]
    Unavailable(String),

    #[error("Connect timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which adapter produced a `Server`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Pooled,
    Exec,
    Tunnel,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Pooled => write!(f, "proxy"),
            BackendKind::Exec => write!(f, "exec"),
            BackendKind::Tunnel => write!(f, "direct"),
        }
    }
}

/// One side of a bridged byte stream
#[async_trait]
pub trait Endpoint: Send {
    /// Next chunk of at most `CHUNK_SIZE` bytes. Empty means the peer hung up.
    async fn recv(&mut self) -> Bytes;

    /// Write `data`, returning the number of bytes sent. Errors are logged
    /// and reported as 0.
    async fn send(&mut self, data: &[u8]) -> usize;

    fn closed(&self) -> bool;

    async fn close(&mut self);
}

/// A backend stream owned by exactly one session
#[async_trait]
pub trait Server: Endpoint {
    fn kind(&self) -> BackendKind;

    async fn resize(&mut self, width: u32, height: u32) -> Result<(), BackendError>;
}

/// Wrap a message in the red warning escape used for user-facing errors
pub fn warning(message: &str) -> String {
    format!("\x1b[31m{}\x1b[0m\r\n", message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_wraps_in_red() {
        assert_eq!(warning("boom"), "\x1b[31mboom\x1b[0m\r\n");
    }

    #[test]
    fn test_no_shell_message() {
        assert_eq!(BackendError::NoShell.to_string(), "container no shell");
    }
}
