//! Container exec session as a backend
//!
//! Used for instances without sshd. The exec runs an interactive shell as the
//! remote user with a tty attached.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{BackendError, BackendKind, Endpoint, Server, CHUNK_SIZE};
use crate::container::{ContainerError, ContainerRuntime};

/// Shells tried in order
pub const SHELLS: [&str; 2] = ["/bin/bash", "/bin/sh"];

/// Written to the exec before it is dropped
pub const EXIT_COMMAND: &str = "exit\n";

pub struct ExecServer {
    runtime: Arc<dyn ContainerRuntime>,
    exec_id: String,
    output: BoxStream<'static, Result<Bytes, ContainerError>>,
    input: Pin<Box<dyn AsyncWrite + Send>>,
    pending: BytesMut,
    closed: bool,
    input_shut: bool,
}

impl ExecServer {
    /// Start the first available shell and size it to `width`×`height`
    pub async fn open(
        runtime: Arc<dyn ContainerRuntime>,
        container_id: &str,
        user: &str,
        width: u32,
        height: u32,
    ) -> Result<Self, BackendError> {
        let mut started = None;
        for shell in SHELLS {
            match runtime.exec_shell(container_id, shell, user).await {
                Ok(session) => {
                    started = Some(session);
                    break;
                }
                Err(e) => debug!("Exec {} in {} failed: {}", shell, container_id, e),
            }
        }
        let session = started.ok_or(BackendError::NoShell)?;

        info!("Exec {} attached for {} in {}", session.exec_id, user, container_id);
        if let Err(e) = runtime.resize_exec(&session.exec_id, width, height).await {
            warn!("Initial resize of exec {} failed: {}", session.exec_id, e);
        }

        Ok(Self {
            runtime,
            exec_id: session.exec_id,
            output: session.output,
            input: session.input,
            pending: BytesMut::new(),
            closed: false,
            input_shut: false,
        })
    }

    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }
}

#[async_trait]
impl Endpoint for ExecServer {
    async fn recv(&mut self) -> Bytes {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(CHUNK_SIZE);
                return self.pending.split_to(n).freeze();
            }
            if self.closed {
                return Bytes::new();
            }
            match self.output.next().await {
                Some(Ok(data)) => self.pending.extend_from_slice(&data),
                Some(Err(e)) => {
                    warn!("Exec {} output error: {}", self.exec_id, e);
                    self.closed = true;
                }
                None => self.closed = true,
            }
        }
    }

    async fn send(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let result = async {
            self.input.write_all(data).await?;
            self.input.flush().await
        }
        .await;
        match result {
            Ok(()) => data.len(),
            Err(e) => {
                warn!("Send to exec {} failed: {}", self.exec_id, e);
                0
            }
        }
    }

    fn closed(&self) -> bool {
        self.closed && self.pending.is_empty()
    }

    async fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
        if self.input_shut {
            return;
        }
        if self.send(EXIT_COMMAND.as_bytes()).await == 0 {
            debug!("Exec {} did not take exit", self.exec_id);
        }
        let _ = self.input.shutdown().await;
        self.input_shut = true;
        debug!("Exec {} closed", self.exec_id);
    }
}

#[async_trait]
impl Server for ExecServer {
    fn kind(&self) -> BackendKind {
        BackendKind::Exec
    }

    async fn resize(&mut self, width: u32, height: u32) -> Result<(), BackendError> {
        debug!("Resize exec {} to {}x{}", self.exec_id, width, height);
        self.runtime
            .resize_exec(&self.exec_id, width, height)
            .await
            .map_err(BackendError::from)
    }
}
