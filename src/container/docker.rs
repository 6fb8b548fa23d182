//! Docker Engine implementation of `ContainerRuntime` (bollard)

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    DownloadFromContainerOptions, ListContainersOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::models::ContainerSummary;
use bollard::Docker;
use futures_util::{StreamExt, TryStreamExt};
use tracing::{debug, info};

use super::{ContainerError, ContainerInfo, ContainerRuntime, ExecSession, APP_LABEL};

pub struct DockerRuntime {
    docker: Docker,
    /// Network whose address identifies an instance
    network: String,
}

impl DockerRuntime {
    pub fn connect(network: impl Into<String>) -> Result<Self, ContainerError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self::new(docker, network))
    }

    pub fn new(docker: Docker, network: impl Into<String>) -> Self {
        Self {
            docker,
            network: network.into(),
        }
    }

    /// Address on the instance network, falling back to the IPAM-configured one
    fn network_address(&self, summary: &ContainerSummary) -> Option<String> {
        let endpoint = summary
            .network_settings
            .as_ref()?
            .networks
            .as_ref()?
            .get(&self.network)?;
        endpoint
            .ip_address
            .clone()
            .filter(|ip| !ip.is_empty())
            .or_else(|| {
                endpoint
                    .ipam_config
                    .as_ref()
                    .and_then(|ipam| ipam.ipv4_address.clone())
                    .filter(|ip| !ip.is_empty())
            })
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn find_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<ContainerInfo>, ContainerError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![APP_LABEL.to_string()]);
        filters.insert("id".to_string(), vec![instance_id.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(containers.into_iter().next().and_then(|summary| {
            let id = summary.id.clone()?;
            let name = summary
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();
            let address = self.network_address(&summary);
            Some(ContainerInfo { id, name, address })
        }))
    }

    async fn get_archive(&self, container_id: &str, path: &str) -> Result<Vec<u8>, ContainerError> {
        let chunks: Vec<bytes::Bytes> = self
            .docker
            .download_from_container(
                container_id,
                Some(DownloadFromContainerOptions { path }),
            )
            .try_collect()
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    ContainerError::PathNotFound(path.to_string())
                } else {
                    ContainerError::Docker(e)
                }
            })?;
        let archive = chunks.concat();
        debug!("Fetched {} ({} bytes) from {}", path, archive.len(), container_id);
        Ok(archive)
    }

    async fn put_archive(
        &self,
        container_id: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), ContainerError> {
        self.docker
            .upload_to_container(
                container_id,
                Some(UploadToContainerOptions {
                    path,
                    ..Default::default()
                }),
                archive.into(),
            )
            .await?;
        Ok(())
    }

    async fn exec_shell(
        &self,
        container_id: &str,
        shell: &str,
        user: &str,
    ) -> Result<ExecSession, ContainerError> {
        let created = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(vec![shell]),
                    user: Some(user),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let started = self
            .docker
            .start_exec(
                &created.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: true,
                    ..Default::default()
                }),
            )
            .await?;

        match started {
            StartExecResults::Attached { output, input } => {
                info!("Exec {} started in {} ({})", created.id, container_id, shell);
                let output = output
                    .map(|item| item.map(|log| log.into_bytes()).map_err(ContainerError::from))
                    .boxed();
                Ok(ExecSession {
                    exec_id: created.id,
                    output,
                    input,
                })
            }
            StartExecResults::Detached => Err(ContainerError::Exec(format!(
                "exec {} started detached",
                created.id
            ))),
        }
    }

    async fn resize_exec(
        &self,
        exec_id: &str,
        width: u32,
        height: u32,
    ) -> Result<(), ContainerError> {
        self.docker
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    width: width.min(u16::MAX as u32) as u16,
                    height: height.min(u16::MAX as u32) as u16,
                },
            )
            .await?;
        Ok(())
    }
}
