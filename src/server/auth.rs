//! Public-key authentication against instance authorized keys

use thiserror::Error;

use crate::instance::{DirectoryError, InstanceDirectory};
use crate::ssh::keys::find_authorized;

/// Identity bound onto a connection once auth succeeds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    /// Remote user inside the instance
    pub username: String,
    pub instance_id: String,
    pub instance_name: String,
    pub auth_keys: Vec<String>,
    /// Authorized-key entry that matched, as stored on the instance
    pub auth_key: String,
}

#[derive(Debug, Error)]
pub enum AuthFailure {
    #[error("username {0:?} is not <instance>:<user>")]
    MalformedUsername(String),

    #[error("unknown instance {0}")]
    UnknownInstance(String),

    #[error("key not authorized for {0}")]
    KeyNotAuthorized(String),

    #[error("instance lookup failed: {0}")]
    Directory(#[from] DirectoryError),
}

/// Split `<instance-name>:<remote-user>` on the first colon
pub fn parse_login(username: &str) -> Option<(&str, &str)> {
    let (instance, user) = username.split_once(':')?;
    if instance.is_empty() || user.is_empty() {
        return None;
    }
    Some((instance, user))
}

/// Resolve the instance named in `username` and match the offered key body
pub async fn authenticate(
    directory: &dyn InstanceDirectory,
    username: &str,
    offered_body: &str,
) -> Result<AuthenticatedUser, AuthFailure> {
    let (instance_name, remote_user) =
        parse_login(username).ok_or_else(|| AuthFailure::MalformedUsername(username.to_string()))?;

    let record = directory
        .lookup_by_name(instance_name)
        .await?
        .ok_or_else(|| AuthFailure::UnknownInstance(instance_name.to_string()))?;

    let matched = find_authorized(&record.auth_keys, offered_body)
        .ok_or_else(|| AuthFailure::KeyNotAuthorized(instance_name.to_string()))?
        .clone();

    Ok(AuthenticatedUser {
        username: remote_user.to_string(),
        instance_id: record.id,
        instance_name: record.name,
        auth_keys: record.auth_keys,
        auth_key: matched,
    })
}
