//! Bastion configuration
//!
//! Settings come from the process environment. Every field has a default so
//! an empty environment yields a working local setup.

pub mod host_key;

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use host_key::{load_or_generate_host_key, HostKey, HostKeyError};

/// Seconds the accept loop waits for a new channel to finish negotiating
pub const READY_WAIT: Duration = Duration::from_secs(5);

/// Tick of the bridge loop; only re-checks liveness, never closes a session
pub const BRIDGE_TICK: Duration = Duration::from_secs(60);

/// Tag recorded on every connection accepted by this listener
pub const LOGIN_FROM: &str = "ST";

/// Presence (and non-zero size) marks an instance running sshd
pub const SSHD_PID_PATH: &str = "/var/run/sshd.pid";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BastionConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Backend connect + auth timeout in seconds
    #[serde(default = "default_ssh_timeout")]
    pub ssh_timeout_secs: u64,

    /// Backend keepalive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    #[serde(default = "default_host_private_key")]
    pub host_private_key: PathBuf,

    #[serde(default = "default_host_public_key")]
    pub host_public_key: PathBuf,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_redis_prefix")]
    pub redis_key_prefix: String,

    /// Docker network carrying instance addresses
    #[serde(default = "default_docker_network")]
    pub docker_network: String,
}

impl Default for BastionConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            port: default_port(),
            ssh_timeout_secs: default_ssh_timeout(),
            keepalive_secs: default_keepalive(),
            host_private_key: default_host_private_key(),
            host_public_key: default_host_public_key(),
            redis_url: default_redis_url(),
            redis_key_prefix: default_redis_prefix(),
            docker_network: default_docker_network(),
        }
    }
}

impl BastionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            bind_host: lookup("BIND_HOST").unwrap_or(defaults.bind_host),
            port: parse_var(&lookup, "SSHD_PORT")?.unwrap_or(defaults.port),
            ssh_timeout_secs: parse_var(&lookup, "SSH_TIMEOUT")?
                .unwrap_or(defaults.ssh_timeout_secs),
            keepalive_secs: parse_var(&lookup, "SSH_KEEPALIVE")?
                .unwrap_or(defaults.keepalive_secs),
            host_private_key: lookup("HOST_PRIVATE_KEY")
                .map(PathBuf::from)
                .unwrap_or(defaults.host_private_key),
            host_public_key: lookup("HOST_PUBLIC_KEY")
                .map(PathBuf::from)
                .unwrap_or(defaults.host_public_key),
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            redis_key_prefix: lookup("REDIS_KEY_PREFIX").unwrap_or(defaults.redis_key_prefix),
            docker_network: lookup("DOCKER_NETWORK").unwrap_or(defaults.docker_network),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    pub fn connect_options(&self) -> crate::ssh::ConnectOptions {
        crate::ssh::ConnectOptions {
            timeout_secs: self.ssh_timeout_secs,
            keepalive_secs: self.keepalive_secs,
        }
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        None => Ok(None),
    }
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2222
}

fn default_ssh_timeout() -> u64 {
    15
}

fn default_keepalive() -> u64 {
    60
}

fn default_host_private_key() -> PathBuf {
    PathBuf::from("/channel/id_rsa")
}

fn default_host_public_key() -> PathBuf {
    PathBuf::from("/channel/id_rsa.pub")
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_redis_prefix() -> String {
    "cae".to_string()
}

fn default_docker_network() -> String {
    "caenet".to_string()
}
