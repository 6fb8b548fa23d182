//! Process-wide context shared by every connection task

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::{load_or_generate_host_key, BastionConfig, HostKey, HostKeyError};
use crate::container::{ContainerError, ContainerRuntime, DockerRuntime};
use crate::instance::{DirectoryError, InstanceDirectory, RedisDirectory};
use crate::pool::{BackendConnector, BackendPool, SshConnector};
use crate::server::ConnectionRegistry;
use crate::session::SessionRegistry;

#[derive(Debug, Error)]
pub enum BastionError {
    #[error(transparent)]
    HostKey(#[from] HostKeyError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Container(#[from] ContainerError),
}

pub struct Bastion {
    pub config: BastionConfig,
    pub host_key: HostKey,
    pub connections: ConnectionRegistry,
    pub sessions: SessionRegistry,
    pub pool: Arc<BackendPool>,
    pub directory: Arc<dyn InstanceDirectory>,
    pub runtime: Arc<dyn ContainerRuntime>,
}

impl Bastion {
    pub fn new(
        config: BastionConfig,
        host_key: HostKey,
        directory: Arc<dyn InstanceDirectory>,
        runtime: Arc<dyn ContainerRuntime>,
        connector: Arc<dyn BackendConnector>,
    ) -> Self {
        Self {
            config,
            host_key,
            connections: ConnectionRegistry::new(),
            sessions: SessionRegistry::new(),
            pool: Arc::new(BackendPool::new(connector)),
            directory,
            runtime,
        }
    }

    /// Wire up the production host key, redis directory, docker runtime and
    /// SSH connector
    pub async fn from_config(config: BastionConfig) -> Result<Self, BastionError> {
        let host_key =
            load_or_generate_host_key(&config.host_private_key, &config.host_public_key).await?;

        let directory = RedisDirectory::new(&config.redis_url, config.redis_key_prefix.clone()).await?;
        info!("Instance directory connected ({})", config.redis_key_prefix);

        let runtime = DockerRuntime::connect(config.docker_network.clone())?;
        info!("Container runtime connected (network {})", config.docker_network);

        let connector = SshConnector::new(config.connect_options());

        Ok(Self::new(
            config,
            host_key,
            Arc::new(directory),
            Arc::new(runtime),
            Arc::new(connector),
        ))
    }
}
