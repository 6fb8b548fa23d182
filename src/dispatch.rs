//! Dispatcher
//!
//! Turns one negotiated channel into a bridged session: routing, instance
//! provisioning and backend selection.
//!
//! | channel      | sshd | backend                          |
//! |--------------|------|----------------------------------|
//! | session      | yes  | pooled SSH shell (keys pushed)   |
//! | session      | no   | container exec                   |
//! | direct-tcpip | yes  | TCP tunnel to the instance only  |
//! | direct-tcpip | no   | rejected                         |

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::backend::{BackendError, DirectTunnel, ExecServer, PooledShell, Server};
use crate::bastion::Bastion;
use crate::config::SSHD_PID_PATH;
use crate::container::archive::{
    authorized_keys_archive, find_passwd_entry, first_entry_size, read_first_file,
};
use crate::container::ContainerError;
use crate::instance::DirectoryError;
use crate::server::{AuthenticatedUser, ChannelKind, Client, Connection, HostPort, Request};
use crate::session::{bridge, Session, SessionTarget};
use crate::ssh::{Asset, SystemUser};

const PASSWD_PATH: &str = "/etc/passwd";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Request type `{0}` not support now")]
    Unsupported(String),

    #[error("Tunnel to {destination} denied, only {address} is reachable")]
    SelfTunnel { destination: String, address: String },

    #[error("Tunnel needs sshd running in the instance")]
    TunnelWithoutSshd,

    #[error("Tunnel destination missing")]
    MissingDestination,

    #[error("Channel has no authenticated user")]
    NotAuthenticated,

    #[error("Instance {0} not found")]
    InstanceNotFound(String),

    #[error("Instance {0} has no network address")]
    NoAddress(String),

    #[error("Provision failed: {0}")]
    Provision(String),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl DispatchError {
    /// Rejections of what the user asked for, as opposed to backend failures
    fn is_rejection(&self) -> bool {
        matches!(
            self,
            DispatchError::Unsupported(_)
                | DispatchError::SelfTunnel { .. }
                | DispatchError::TunnelWithoutSshd
                | DispatchError::MissingDestination
        )
    }
}

/// Container behind the bound instance
struct Instance {
    container_id: String,
    address: Option<String>,
}

impl Instance {
    fn address(&self) -> Result<&str, DispatchError> {
        self.address
            .as_deref()
            .ok_or_else(|| DispatchError::NoAddress(self.container_id.clone()))
    }
}

pub struct Dispatcher {
    ctx: Arc<Bastion>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<Bastion>) -> Self {
        Self { ctx }
    }

    /// Route the channel and bridge it. The client is always deregistered
    /// from `connection` on return.
    pub async fn dispatch(&self, connection: &Connection, client: Arc<Client>) {
        if let Err(e) = self.run(&client).await {
            if e.is_rejection() {
                warn!(conn_id = %client.connection_id, channel = client.id, "Rejected {}: {}", client, e);
            } else {
                error!(conn_id = %client.connection_id, channel = client.id, "Dispatch {} failed: {}", client, e);
            }
            client.send_warning(&e.to_string()).await;
        }
        connection.remove_client(client.id).await;
    }

    async fn run(&self, client: &Arc<Client>) -> Result<(), DispatchError> {
        let request = client.request_snapshot();
        if !request.is_interactive() {
            return Err(DispatchError::Unsupported(request.route()));
        }
        let user = client.user().cloned().ok_or(DispatchError::NotAuthenticated)?;

        let instance = self.resolve_instance(&user).await?;
        let sshd = self.has_sshd(&instance.container_id).await?;
        info!(
            "Dispatch {} ({}) to {} (sshd: {})",
            client,
            request.route(),
            instance.container_id,
            sshd
        );

        let (server, target): (Box<dyn Server>, SessionTarget) = match request.kind {
            ChannelKind::DirectTcpip => self.open_tunnel(&request, &instance, sshd).await?,
            _ if sshd => {
                self.push_authorized_keys(&instance.container_id, &user).await?;
                self.open_pooled(client, &request, &instance, &user).await?
            }
            _ => self.open_exec(&request, &instance, &user).await?,
        };

        let Some(stream) = client.take_stream().await else {
            let mut server = server;
            server.close().await;
            return Ok(());
        };

        let session = Arc::new(Session::new(client, target));
        self.ctx.sessions.insert(session.clone());
        bridge(&self.ctx.sessions, session, client, stream, server).await;
        Ok(())
    }

    async fn resolve_instance(&self, user: &AuthenticatedUser) -> Result<Instance, DispatchError> {
        let info = self
            .ctx
            .runtime
            .find_instance(&user.instance_id)
            .await?
            .ok_or_else(|| DispatchError::InstanceNotFound(user.instance_name.clone()))?;

        let address = match info.address {
            Some(address) => Some(address),
            None => self
                .ctx
                .directory
                .lookup_by_id(&user.instance_id)
                .await?
                .and_then(|record| record.address),
        };

        Ok(Instance {
            container_id: info.id,
            address,
        })
    }

    async fn has_sshd(&self, container_id: &str) -> Result<bool, DispatchError> {
        match self.ctx.runtime.get_archive(container_id, SSHD_PID_PATH).await {
            Ok(archive) => Ok(first_entry_size(&archive)? > 0),
            Err(ContainerError::PathNotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the user's keys plus the bastion host key to the remote user's
    /// `~/.ssh/authorized_keys`
    async fn push_authorized_keys(
        &self,
        container_id: &str,
        user: &AuthenticatedUser,
    ) -> Result<(), DispatchError> {
        let content = format!(
            "{}\n{}\n",
            user.auth_keys.join("\n"),
            self.ctx.host_key.public_line.trim()
        );

        let passwd = self.ctx.runtime.get_archive(container_id, PASSWD_PATH).await?;
        let passwd = String::from_utf8_lossy(&read_first_file(&passwd)?).into_owned();
        let entry = find_passwd_entry(&passwd, &user.username).ok_or_else(|| {
            DispatchError::Provision(format!("user {} not found in {}", user.username, PASSWD_PATH))
        })?;

        let archive = authorized_keys_archive(&content, entry.uid, entry.gid)?;
        self.ctx
            .runtime
            .put_archive(container_id, &entry.home, archive)
            .await?;
        info!(
            "Pushed {} authorized keys to {}:{}/.ssh",
            user.auth_keys.len() + 1,
            container_id,
            entry.home
        );
        Ok(())
    }

    async fn open_pooled(
        &self,
        client: &Client,
        request: &Request,
        instance: &Instance,
        user: &AuthenticatedUser,
    ) -> Result<(Box<dyn Server>, SessionTarget), DispatchError> {
        let asset = Asset::new(instance.address()?);
        let system_user = SystemUser::with_key(&user.username, self.ctx.host_key.private_key.clone());
        let login = format!("{}:{}", user.instance_name, user.username);

        let shell = PooledShell::open(
            self.ctx.pool.clone(),
            &login,
            &asset,
            &system_user,
            request.terminal(),
        )
        .await?;
        if !shell.reused() {
            client.send_text("\r\n").await;
        }

        let target = SessionTarget {
            asset: asset.host.clone(),
            system_user: system_user.username.clone(),
            kind: shell.kind(),
        };
        Ok((Box::new(shell), target))
    }

    async fn open_exec(
        &self,
        request: &Request,
        instance: &Instance,
        user: &AuthenticatedUser,
    ) -> Result<(Box<dyn Server>, SessionTarget), DispatchError> {
        let (_, width, height) = request.terminal();
        let exec = ExecServer::open(
            self.ctx.runtime.clone(),
            &instance.container_id,
            &user.username,
            width,
            height,
        )
        .await?;

        let target = SessionTarget {
            asset: instance
                .address
                .clone()
                .unwrap_or_else(|| instance.container_id.clone()),
            system_user: user.username.clone(),
            kind: exec.kind(),
        };
        Ok((Box::new(exec), target))
    }

    async fn open_tunnel(
        &self,
        request: &Request,
        instance: &Instance,
        sshd: bool,
    ) -> Result<(Box<dyn Server>, SessionTarget), DispatchError> {
        if !sshd {
            return Err(DispatchError::TunnelWithoutSshd);
        }
        let destination: &HostPort = request
            .destination
            .as_ref()
            .ok_or(DispatchError::MissingDestination)?;
        let address = instance.address()?;
        if destination.host != address {
            return Err(DispatchError::SelfTunnel {
                destination: destination.to_string(),
                address: address.to_string(),
            });
        }

        let timeout = Duration::from_secs(self.ctx.config.ssh_timeout_secs);
        let tunnel = DirectTunnel::open(destination, timeout).await?;
        let target = SessionTarget {
            asset: destination.to_string(),
            system_user: String::new(),
            kind: tunnel.kind(),
        };
        Ok((Box::new(tunnel), target))
    }
}
