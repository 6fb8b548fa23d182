//! Instance directory
//!
//! Answers the two questions the bastion asks about instances: which id and
//! authorized keys belong to a name, and what record belongs to an id.

mod store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use store::RedisDirectory;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed instance record {key}: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Instance record as stored by the management API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    #[serde(default)]
    pub id: String,

    pub name: String,

    /// Last known network address, when the record carries one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default)]
    pub auth_keys: Vec<String>,
}

#[async_trait]
pub trait InstanceDirectory: Send + Sync {
    async fn lookup_by_name(&self, name: &str) -> Result<Option<InstanceRecord>, DirectoryError>;

    async fn lookup_by_id(&self, id: &str) -> Result<Option<InstanceRecord>, DirectoryError>;
}
