//! Session Types

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::BackendKind;
use crate::server::Client;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S +0000";

/// Backend side of a session, for display
#[derive(Debug, Clone)]
pub struct SessionTarget {
    pub asset: String,
    pub system_user: String,
    pub kind: BackendKind,
}

/// One user channel bridged to one backend stream
pub struct Session {
    pub id: String,
    pub client_id: u32,
    pub connection_id: String,
    pub user: String,
    pub login_from: &'static str,
    pub remote_addr: Option<SocketAddr>,
    pub target: SessionTarget,
    date_start: DateTime<Utc>,
    date_end: parking_lot::Mutex<Option<DateTime<Utc>>>,
    last_active: AtomicI64,
    finished: AtomicBool,
    closed: AtomicBool,
    stop: CancellationToken,
}

impl Session {
    /// The stop token is a child of the client's, so closing the client ends the session
    pub fn new(client: &Client, target: SessionTarget) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            client_id: client.id,
            connection_id: client.connection_id.clone(),
            user: client
                .user()
                .map(|u| u.username.clone())
                .unwrap_or_default(),
            login_from: client.login_from,
            remote_addr: client.remote_addr,
            target,
            date_start: now,
            date_end: parking_lot::Mutex::new(None),
            last_active: AtomicI64::new(now.timestamp()),
            finished: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stop: client.stop_token().child_token(),
        }
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Ask the bridge to exit
    pub fn stop(&self) {
        info!("Session stop requested: {}", self.id);
        self.stop.cancel();
    }

    pub fn touch(&self) {
        self.last_active.store(Utc::now().timestamp(), Ordering::SeqCst);
    }

    pub fn date_end(&self) -> Option<DateTime<Utc>> {
        *self.date_end.lock()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark finished and closed and stamp the end time. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            info!("Session has been closed: {}", self.id);
            return;
        }
        info!("Close the session: {}", self.id);
        self.finished.store(true, Ordering::SeqCst);
        *self.date_end.lock() = Some(Utc::now());
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            user: self.user.clone(),
            asset: self.target.asset.clone(),
            system_user: self.target.system_user.clone(),
            login_from: self.login_from.to_string(),
            remote_addr: self.remote_addr.map(|a| a.ip().to_string()),
            is_finished: self.is_finished(),
            date_start: self.date_start.format(DATE_FORMAT).to_string(),
            last_active: Utc
                .timestamp_opt(self.last_active.load(Ordering::SeqCst), 0)
                .single()
                .unwrap_or(self.date_start)
                .format(DATE_FORMAT)
                .to_string(),
            date_end: self.date_end().map(|d| d.format(DATE_FORMAT).to_string()),
        }
    }
}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Session record for audit output
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub user: String,
    pub asset: String,
    pub system_user: String,
    pub login_from: String,
    pub remote_addr: Option<String>,
    pub is_finished: bool,
    pub date_start: String,
    pub last_active: String,
    pub date_end: Option<String>,
}
