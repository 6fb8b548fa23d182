//! Outbound SSH client for backend instances

use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::config::{Asset, ConnectOptions, SystemUser};
use super::error::SshError;
use super::known_hosts::KnownHostsStore;

pub struct SshClient {
    asset: Asset,
    system_user: SystemUser,
    options: ConnectOptions,
    known_hosts: Arc<KnownHostsStore>,
    alive: Arc<AtomicBool>,
}

impl SshClient {
    pub fn new(
        asset: Asset,
        system_user: SystemUser,
        options: ConnectOptions,
        known_hosts: Arc<KnownHostsStore>,
    ) -> Self {
        Self {
            asset,
            system_user,
            options,
            known_hosts,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Cleared by the client handler when the transport disconnects
    pub fn alive_flag(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }

    /// Connect and authenticate, returning the raw handle
    pub async fn connect(self) -> Result<Handle<ClientHandler>, SshError> {
        let addr = self.asset.to_string();

        info!("Connecting to SSH server at {}", addr);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(self.options.keepalive_secs)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            self.asset.host.clone(),
            self.asset.port,
            self.known_hosts.clone(),
            self.alive.clone(),
        );

        let timeout = Duration::from_secs(self.options.timeout_secs);

        let mut handle = tokio::time::timeout(
            timeout,
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout("Connection timed out".to_string()))?
        .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        debug!("SSH handshake completed");

        let authenticated = tokio::time::timeout(timeout, self.authenticate(&mut handle))
            .await
            .map_err(|_| SshError::Timeout("Authentication timed out".to_string()))??;

        if !authenticated {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!(
            "SSH authentication successful for {}@{}",
            self.system_user.username, addr
        );

        Ok(handle)
    }

    /// Offer the key first, then fall back to the password alone when the
    /// key is refused.
    async fn authenticate(&self, handle: &mut Handle<ClientHandler>) -> Result<bool, SshError> {
        let username = &self.system_user.username;

        if let Some(key) = &self.system_user.private_key {
            let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
            let key_with_hash = PrivateKeyWithHashAlg::new(key.clone(), hash_alg);
            match handle.authenticate_publickey(username, key_with_hash).await {
                Ok(result) if result.success() => return Ok(true),
                Ok(_) => {
                    debug!("Public key rejected for {}, retrying without key", username);
                }
                Err(e) => {
                    warn!("Public key auth error for {}: {}, retrying without key", username, e);
                }
            }
        }

        match &self.system_user.password {
            Some(password) => {
                let result = handle
                    .authenticate_password(username, password)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
                Ok(result.success())
            }
            None => Ok(false),
        }
    }
}

/// Client handler for russh callbacks
pub struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: Arc<KnownHostsStore>,
    alive: Arc<AtomicBool>,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        known_hosts: Arc<KnownHostsStore>,
        alive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            host,
            port,
            known_hosts,
            alive,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(self
            .known_hosts
            .check_and_trust(&self.host, self.port, server_public_key))
    }

    async fn disconnected(
        &mut self,
        reason: client::DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        self.alive.store(false, Ordering::SeqCst);
        match reason {
            client::DisconnectReason::ReceivedDisconnect(_) => {
                info!("Backend {}:{} disconnected", self.host, self.port);
                Ok(())
            }
            client::DisconnectReason::Error(e) => {
                warn!("Backend {}:{} lost: {}", self.host, self.port, e);
                Err(e)
            }
        }
    }
}
