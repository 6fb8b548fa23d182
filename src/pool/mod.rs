//! Backend Connection Pool
//!
//! Caches outbound SSH transports keyed by `user × address × remote user` and
//! shares each one across every session that targets the same login.
//!
//! # Locking
//!
//! ```text
//! slots: DashMap<PoolKey, Arc<Mutex<Slot>>>
//!          │                  └─ per-key async lock: lookup, refcount change
//!          │                     and eviction happen in one critical section
//!          └─ shard locks are only held to find or remove a slot
//! ```
//!
//! A slot that drops its last connection is marked `retired` and removed
//! from the map while still locked. Waiters that cloned it earlier see the
//! flag and start over with a fresh slot.

mod ssh;

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::backend::Server;
use crate::ssh::{Asset, SshError, SystemUser};

pub use ssh::{SshConnector, SshTransport};

#[derive(Debug, Error)]
pub enum PoolError {
    /// `summary` is for operator logs only and stays out of the message
    #[error("no server connection available: {target}")]
    NoServerConnection {
        target: String,
        summary: String,
        #[source]
        source: SshError,
    },
}

/// An established outbound transport
#[async_trait]
pub trait BackendTransport: Send + Sync {
    fn is_alive(&self) -> bool;

    /// Open an interactive shell channel with a pty of the given size
    async fn open_shell(
        &self,
        term: &str,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn Server>, SshError>;

    async fn close(&self) -> Result<(), SshError>;
}

/// Opens new transports on a cache miss
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(
        &self,
        asset: &Asset,
        system_user: &SystemUser,
    ) -> Result<Arc<dyn BackendTransport>, SshError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub user: String,
    pub address: String,
    pub remote_user: String,
}

impl PoolKey {
    pub fn new(user: &str, asset: &Asset, remote_user: &str) -> Self {
        Self {
            user: user.to_string(),
            address: asset.to_string(),
            remote_user: remote_user.to_string(),
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.user, self.address, self.remote_user)
    }
}

/// One cached transport
pub struct BackendConnection {
    pub id: String,
    pub key: PoolKey,
    transport: Arc<dyn BackendTransport>,
    ref_count: AtomicU32,
    last_active: AtomicU64,
}

impl BackendConnection {
    fn new(key: PoolKey, transport: Arc<dyn BackendTransport>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            key,
            transport,
            ref_count: AtomicU32::new(0),
            last_active: AtomicU64::new(Utc::now().timestamp() as u64),
        }
    }

    pub fn add_ref(&self) -> u32 {
        let count = self.ref_count.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        debug!("Connection {} ref count increased to {}", self.id, count);
        self.update_activity();
        count
    }

    pub fn release(&self) -> u32 {
        let current = self.ref_count.load(Ordering::SeqCst);
        if current == 0 {
            warn!("Connection {} ref count already 0, not decrementing", self.id);
            return 0;
        }
        let prev = self.ref_count.fetch_sub(1, Ordering::SeqCst);
        let count = prev.saturating_sub(1);
        debug!("Connection {} ref count decreased to {}", self.id, count);
        self.update_activity();
        count
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn update_activity(&self) {
        self.last_active
            .store(Utc::now().timestamp() as u64, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    pub fn transport(&self) -> &Arc<dyn BackendTransport> {
        &self.transport
    }
}

/// A counted hold on a pooled connection; hand it back with `BackendPool::release`
pub struct Lease {
    key: PoolKey,
    connection: Arc<BackendConnection>,
    reused: bool,
}

impl Lease {
    pub fn connection(&self) -> &Arc<BackendConnection> {
        &self.connection
    }

    /// True when an already established transport was handed out
    pub fn reused(&self) -> bool {
        self.reused
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }
}

#[derive(Default)]
struct Slot {
    conn: Option<Arc<BackendConnection>>,
    retired: bool,
}

pub struct BackendPool {
    slots: DashMap<PoolKey, Arc<Mutex<Slot>>>,
    connector: Arc<dyn BackendConnector>,
}

impl BackendPool {
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            slots: DashMap::new(),
            connector,
        }
    }

    fn slot(&self, key: &PoolKey) -> Arc<Mutex<Slot>> {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Slot::default())))
            .clone()
    }

    fn remove_slot(&self, key: &PoolKey, slot: &Arc<Mutex<Slot>>) {
        self.slots.remove_if(key, |_, current| Arc::ptr_eq(current, slot));
    }

    /// Reuse a live cached transport or connect a fresh one
    pub async fn acquire(
        &self,
        user: &str,
        asset: &Asset,
        system_user: &SystemUser,
    ) -> Result<Lease, PoolError> {
        let key = PoolKey::new(user, asset, &system_user.username);

        loop {
            let slot = self.slot(&key);
            let mut guard = slot.lock().await;
            if guard.retired {
                continue;
            }

            if let Some(conn) = guard.conn.clone() {
                if conn.is_alive() {
                    let count = conn.add_ref();
                    info!("Reuse connection: {} (ref_count: {})", key, count);
                    return Ok(Lease {
                        key,
                        connection: conn,
                        reused: true,
                    });
                }
                warn!("Cached connection {} is dead, evicting", key);
                guard.conn = None;
            }

            match self.connector.connect(asset, system_user).await {
                Ok(transport) => {
                    let conn = Arc::new(BackendConnection::new(key.clone(), transport));
                    conn.add_ref();
                    guard.conn = Some(conn.clone());
                    info!("Cached new connection: {} ({})", key, conn.id);
                    return Ok(Lease {
                        key,
                        connection: conn,
                        reused: false,
                    });
                }
                Err(e) => {
                    let summary = system_user.summary();
                    error!(
                        "Connect {}@{} auth failed, {}: {}",
                        system_user.username, asset, summary, e
                    );
                    guard.retired = true;
                    self.remove_slot(&key, &slot);
                    return Err(PoolError::NoServerConnection {
                        target: format!("{}@{}", system_user.username, asset),
                        summary,
                        source: e,
                    });
                }
            }
        }
    }

    /// Drop one hold; the transport closes when the last hold is gone
    pub async fn release(&self, lease: Lease) {
        let Lease {
            key, connection, ..
        } = lease;

        let slot = self.slots.get(&key).map(|entry| entry.value().clone());
        let mut guard = match &slot {
            Some(slot) => Some(slot.lock().await),
            None => None,
        };

        let remaining = connection.release();
        if remaining > 0 {
            debug!("Connection {} still in use (ref_count: {})", key, remaining);
            return;
        }

        if let (Some(slot), Some(guard)) = (&slot, guard.as_mut()) {
            // an invalidated slot left empty goes away with its last holder
            let cached = match guard.conn.as_ref() {
                Some(c) => Arc::ptr_eq(c, &connection),
                None => !guard.retired,
            };
            if cached {
                guard.conn = None;
                guard.retired = true;
                self.remove_slot(&key, slot);
            }
        }
        drop(guard);

        info!("Closing connection {} ({})", key, connection.id);
        if let Err(e) = connection.transport.close().await {
            warn!("Close connection {} failed: {}", key, e);
        }
    }

    /// Drop the cached entry behind `lease` so the next acquire reconnects.
    /// The lease itself still has to be released.
    pub async fn invalidate(&self, lease: &Lease) {
        let Some(slot) = self.slots.get(&lease.key).map(|entry| entry.value().clone()) else {
            return;
        };
        let mut guard = slot.lock().await;
        let cached = guard
            .conn
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, &lease.connection));
        if cached {
            warn!("Evicting connection {} ({})", lease.key, lease.connection.id);
            guard.conn = None;
        }
    }

    /// Number of cached keys
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Current ref count of the live entry for `key`, if any
    pub async fn ref_count(&self, key: &PoolKey) -> Option<u32> {
        let slot = self.slots.get(key).map(|entry| entry.value().clone())?;
        let guard = slot.lock().await;
        guard.conn.as_ref().map(|c| c.ref_count())
    }
}
