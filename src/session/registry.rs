//! Session Registry
//!
//! Live sessions keyed by id. Removal closes the session record.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::types::{Session, SessionInfo};

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        debug!("Session {} registered", session.id);
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(id)?;
        session.close();
        Some(session)
    }

    /// Signal every live session's bridge to exit
    pub fn stop_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().stop();
        }
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|s| s.value().info()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
