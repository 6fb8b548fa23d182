//! Backend SSH configuration

use std::fmt;
use std::sync::Arc;

use russh::keys::PrivateKey;
use serde::{Deserialize, Serialize};

use super::keys::{private_key_fingerprint, redact_password};

/// A backend address reachable from the bastion
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    /// Instance address (container IP)
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Asset {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Credentials used to log into the backend as the remote user
#[derive(Clone)]
pub struct SystemUser {
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<Arc<PrivateKey>>,
}

impl SystemUser {
    pub fn with_key(username: impl Into<String>, key: Arc<PrivateKey>) -> Self {
        Self {
            username: username.into(),
            password: None,
            private_key: Some(key),
        }
    }

    /// Display-safe credential summary for operator diagnostics
    pub fn summary(&self) -> String {
        let password = self
            .password
            .as_deref()
            .map(redact_password)
            .unwrap_or_else(|| "None".to_string());
        let key = self
            .private_key
            .as_deref()
            .map(private_key_fingerprint)
            .unwrap_or_else(|| "None".to_string());
        format!("password: {}, key: {}", password, key)
    }
}

impl fmt::Debug for SystemUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemUser")
            .field("username", &self.username)
            .field("summary", &self.summary())
            .finish()
    }
}

/// Transport options for outbound backend connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Connect + auth timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Keepalive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            keepalive_secs: default_keepalive(),
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    15
}

fn default_keepalive() -> u64 {
    60
}
