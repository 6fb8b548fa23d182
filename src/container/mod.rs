//! Container runtime boundary
//!
//! The bastion needs four things from the runtime: find the container behind
//! an instance id, read and write its filesystem as tar archives, and run an
//! interactive exec session with a resizable tty.

pub mod archive;
mod docker;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio::io::AsyncWrite;

pub use archive::PasswdEntry;
pub use docker::DockerRuntime;

/// Label carried by every managed instance container
pub const APP_LABEL: &str = "cae.app=true";

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Path not found in container: {0}")]
    PathNotFound(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Exec error: {0}")]
    Exec(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A running container backing one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    /// Address on the instance network, if attached
    pub address: Option<String>,
}

/// An attached exec session
pub struct ExecSession {
    pub exec_id: String,
    pub output: BoxStream<'static, Result<Bytes, ContainerError>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Container carrying the app label and the given instance id label
    async fn find_instance(&self, instance_id: &str)
        -> Result<Option<ContainerInfo>, ContainerError>;

    /// Fetch `path` as a tar archive
    async fn get_archive(&self, container_id: &str, path: &str) -> Result<Vec<u8>, ContainerError>;

    /// Extract a tar archive into directory `path`
    async fn put_archive(
        &self,
        container_id: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), ContainerError>;

    /// Create and start an attached tty exec running `shell` as `user`
    async fn exec_shell(
        &self,
        container_id: &str,
        shell: &str,
        user: &str,
    ) -> Result<ExecSession, ContainerError>;

    async fn resize_exec(&self, exec_id: &str, width: u32, height: u32)
        -> Result<(), ContainerError>;
}
