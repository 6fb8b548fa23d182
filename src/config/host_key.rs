//! Bastion host key
//!
//! One RSA key serves two roles: it is the SSH server host key, and its public
//! half is pushed into instances so the pool can log in as the remote user.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::LineEnding;
use russh::keys::PrivateKey;
use thiserror::Error;
use tracing::info;

const RSA_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum HostKeyError {
    #[error("Failed to load host key {path}: {message}")]
    Load { path: PathBuf, message: String },

    #[error("Failed to generate host key: {0}")]
    Generate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct HostKey {
    pub private_key: Arc<PrivateKey>,
    /// OpenSSH public key line
    pub public_line: String,
}

/// Load the key at `private_path`, generating and saving it when missing.
/// The public file is rewritten from the private key if it is absent.
pub async fn load_or_generate_host_key(
    private_path: &Path,
    public_path: &Path,
) -> Result<HostKey, HostKeyError> {
    let key = if tokio::fs::try_exists(private_path).await? {
        info!("Loading host key from {}", private_path.display());
        russh::keys::load_secret_key(private_path, None).map_err(|e| HostKeyError::Load {
            path: private_path.to_path_buf(),
            message: e.to_string(),
        })?
    } else {
        info!("Generating new {}-bit RSA host key", RSA_BITS);
        let key = tokio::task::spawn_blocking(generate_rsa_key)
            .await
            .map_err(|e| HostKeyError::Generate(e.to_string()))??;
        write_private_key(private_path, &key).await?;
        info!("Saved host key to {}", private_path.display());
        key
    };

    let public_line = key
        .public_key()
        .to_openssh()
        .map_err(|e| HostKeyError::Generate(e.to_string()))?;

    match tokio::fs::read_to_string(public_path).await {
        Ok(existing) if !existing.trim().is_empty() => {}
        _ => {
            if let Some(parent) = public_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(public_path, format!("{}\n", public_line)).await?;
            info!("Saved host public key to {}", public_path.display());
        }
    }

    Ok(HostKey {
        private_key: Arc::new(key),
        public_line,
    })
}

fn generate_rsa_key() -> Result<PrivateKey, HostKeyError> {
    let keypair = RsaKeypair::random(&mut OsRng, RSA_BITS)
        .map_err(|e| HostKeyError::Generate(e.to_string()))?;
    PrivateKey::new(KeypairData::from(keypair), "cae-bastion")
        .map_err(|e| HostKeyError::Generate(e.to_string()))
}

async fn write_private_key(path: &Path, key: &PrivateKey) -> Result<(), HostKeyError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let encoded = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| HostKeyError::Generate(e.to_string()))?;
    tokio::fs::write(path, encoded.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(path, perms).await?;
    }

    Ok(())
}
