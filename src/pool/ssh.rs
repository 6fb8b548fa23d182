//! russh-backed connector and transport for the pool

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{BackendConnector, BackendTransport};
use crate::backend::{ChannelEndpoint, Server};
use crate::ssh::{
    spawn_handle_owner_task, Asset, ConnectOptions, HandleController, KnownHostsStore, SshClient,
    SshError, SystemUser,
};

pub struct SshConnector {
    options: ConnectOptions,
    known_hosts: Arc<KnownHostsStore>,
}

impl SshConnector {
    pub fn new(options: ConnectOptions) -> Self {
        Self {
            options,
            known_hosts: Arc::new(KnownHostsStore::new()),
        }
    }
}

#[async_trait]
impl BackendConnector for SshConnector {
    async fn connect(
        &self,
        asset: &Asset,
        system_user: &SystemUser,
    ) -> Result<Arc<dyn BackendTransport>, SshError> {
        let client = SshClient::new(
            asset.clone(),
            system_user.clone(),
            self.options.clone(),
            self.known_hosts.clone(),
        );
        let alive = client.alive_flag();
        let handle = client.connect().await?;

        let label = format!("{}@{}", system_user.username, asset);
        let controller = spawn_handle_owner_task(handle, label, alive);
        Ok(Arc::new(SshTransport { controller }))
    }
}

pub struct SshTransport {
    controller: HandleController,
}

#[async_trait]
impl BackendTransport for SshTransport {
    fn is_alive(&self) -> bool {
        self.controller.is_connected()
    }

    async fn open_shell(
        &self,
        term: &str,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn Server>, SshError> {
        let channel = self.controller.open_session_channel().await?;

        channel
            .request_pty(false, term, width, height, 0, 0, &[])
            .await
            .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;

        debug!("PTY allocated, requesting shell");

        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;

        Ok(Box::new(ChannelEndpoint::new(channel)))
    }

    async fn close(&self) -> Result<(), SshError> {
        self.controller.disconnect().await;
        Ok(())
    }
}
