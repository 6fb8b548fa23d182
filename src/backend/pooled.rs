//! Shell channel on a pooled backend SSH transport

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, error, warn};

use super::{BackendError, BackendKind, Endpoint, Server};
use crate::pool::{BackendPool, Lease};
use crate::ssh::{Asset, SystemUser};

pub struct PooledShell;

impl PooledShell {
    /// Lease a transport and open an interactive shell on it.
    ///
    /// A reused transport that can no longer open a shell is evicted and the
    /// open is retried once on a fresh connection. The lease is handed back
    /// before returning if the shell cannot be opened.
    pub async fn open(
        pool: Arc<BackendPool>,
        user: &str,
        asset: &Asset,
        system_user: &SystemUser,
        terminal: (String, u32, u32),
    ) -> Result<PooledShellServer, BackendError> {
        let (term, width, height) = terminal;
        let mut retried = false;

        loop {
            let lease = pool.acquire(user, asset, system_user).await?;
            match lease
                .connection()
                .transport()
                .open_shell(&term, width, height)
                .await
            {
                Ok(inner) => {
                    debug!(
                        "Shell opened on {} ({}x{}, reused: {})",
                        lease.key(),
                        width,
                        height,
                        lease.reused()
                    );
                    return Ok(PooledShellServer {
                        inner,
                        reused: lease.reused(),
                        lease: Some(lease),
                        pool,
                    });
                }
                Err(e) if lease.reused() && !retried => {
                    warn!("Reused connection {} is gone ({}), reconnecting", lease.key(), e);
                    pool.invalidate(&lease).await;
                    pool.release(lease).await;
                    retried = true;
                }
                Err(e) => {
                    error!("Open shell on {} failed: {}", lease.key(), e);
                    let target = format!("{}@{}", system_user.username, asset);
                    pool.release(lease).await;
                    return Err(BackendError::Unavailable(format!("{}: {}", target, e)));
                }
            }
        }
    }
}

pub struct PooledShellServer {
    inner: Box<dyn Server>,
    lease: Option<Lease>,
    reused: bool,
    pool: Arc<BackendPool>,
}

impl PooledShellServer {
    /// False when this shell caused a fresh login
    pub fn reused(&self) -> bool {
        self.reused
    }
}

#[async_trait]
impl Endpoint for PooledShellServer {
    async fn recv(&mut self) -> Bytes {
        self.inner.recv().await
    }

    async fn send(&mut self, data: &[u8]) -> usize {
        self.inner.send(data).await
    }

    fn closed(&self) -> bool {
        self.lease.is_none() || self.inner.closed()
    }

    async fn close(&mut self) {
        self.inner.close().await;
        if let Some(lease) = self.lease.take() {
            self.pool.release(lease).await;
        }
    }
}

#[async_trait]
impl Server for PooledShellServer {
    fn kind(&self) -> BackendKind {
        BackendKind::Pooled
    }

    async fn resize(&mut self, width: u32, height: u32) -> Result<(), BackendError> {
        self.inner.resize(width, height).await
    }
}
