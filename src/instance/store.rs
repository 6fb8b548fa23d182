//! Redis-backed instance directory
//!
//! Layout written by the management API:
//! - `HGET {prefix}/instanceid <name>` -> instance id
//! - `GET {prefix}/instance/<id>` -> JSON instance record

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::debug;

use super::{DirectoryError, InstanceDirectory, InstanceRecord};

#[derive(Clone)]
pub struct RedisDirectory {
    redis: ConnectionManager,
    prefix: String,
}

impl RedisDirectory {
    pub async fn new(redis_url: &str, prefix: impl Into<String>) -> Result<Self, DirectoryError> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;

        Ok(Self {
            redis,
            prefix: prefix.into(),
        })
    }

    fn id_index_key(&self) -> String {
        format!("{}/instanceid", self.prefix)
    }

    fn record_key(&self, id: &str) -> String {
        format!("{}/instance/{}", self.prefix, id)
    }
}

fn decode_record(key: &str, id: &str, payload: &str) -> Result<InstanceRecord, DirectoryError> {
    let mut record: InstanceRecord =
        serde_json::from_str(payload).map_err(|source| DirectoryError::Malformed {
            key: key.to_string(),
            source,
        })?;
    if record.id.is_empty() {
        record.id = id.to_string();
    }
    Ok(record)
}

#[async_trait]
impl InstanceDirectory for RedisDirectory {
    async fn lookup_by_name(&self, name: &str) -> Result<Option<InstanceRecord>, DirectoryError> {
        let mut conn = self.redis.clone();
        let id: Option<String> = conn.hget(self.id_index_key(), name).await?;
        match id {
            Some(id) if !id.is_empty() => self.lookup_by_id(&id).await,
            _ => {
                debug!("No instance id indexed for name {}", name);
                Ok(None)
            }
        }
    }

    async fn lookup_by_id(&self, id: &str) -> Result<Option<InstanceRecord>, DirectoryError> {
        let mut conn = self.redis.clone();
        let key = self.record_key(id);
        let payload: Option<String> = conn.get(&key).await?;
        payload
            .map(|payload| decode_record(&key, id, &payload))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_record_fills_missing_id() {
        let record = decode_record(
            "cae/instance/abc123",
            "abc123",
            r#"{"name":"web1","auth_keys":["ssh-ed25519 AAAAC3 me@host"]}"#,
        )
        .unwrap();
        assert_eq!(record.id, "abc123");
        assert_eq!(record.name, "web1");
    }

    #[test]
    fn test_decode_record_rejects_garbage() {
        let err = decode_record("cae/instance/x", "x", "not json").unwrap_err();
        assert!(err.to_string().contains("cae/instance/x"));
    }
}
