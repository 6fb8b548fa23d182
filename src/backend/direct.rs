//! Raw TCP tunnel for direct-tcpip channels

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{BackendError, BackendKind, Endpoint, Server, CHUNK_SIZE};
use crate::server::HostPort;

pub struct DirectTunnel;

impl DirectTunnel {
    pub async fn open(
        destination: &HostPort,
        timeout: Duration,
    ) -> Result<TunnelServer, BackendError> {
        let port = u16::try_from(destination.port).map_err(|_| {
            BackendError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("port out of range: {}", destination.port),
            ))
        })?;

        let stream = tokio::time::timeout(
            timeout,
            TcpStream::connect((destination.host.as_str(), port)),
        )
        .await
        .map_err(|_| BackendError::Timeout(destination.to_string()))??;

        let _ = stream.set_nodelay(true);
        info!("Tunnel connected to {}", destination);
        Ok(TunnelServer {
            stream,
            target: destination.to_string(),
            buf: vec![0u8; CHUNK_SIZE],
            closed: false,
        })
    }
}

pub struct TunnelServer {
    stream: TcpStream,
    target: String,
    buf: Vec<u8>,
    closed: bool,
}

#[async_trait]
impl Endpoint for TunnelServer {
    async fn recv(&mut self) -> Bytes {
        if self.closed {
            return Bytes::new();
        }
        match self.stream.read(&mut self.buf).await {
            Ok(0) => {
                self.closed = true;
                Bytes::new()
            }
            Ok(n) => Bytes::copy_from_slice(&self.buf[..n]),
            Err(e) => {
                debug!("Tunnel {} read error: {}", self.target, e);
                self.closed = true;
                Bytes::new()
            }
        }
    }

    async fn send(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        match self.stream.write_all(data).await {
            Ok(()) => data.len(),
            Err(e) => {
                warn!("Send to tunnel {} failed: {}", self.target, e);
                0
            }
        }
    }

    fn closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) {
        self.closed = true;
        let _ = self.stream.shutdown().await;
    }
}

#[async_trait]
impl Server for TunnelServer {
    fn kind(&self) -> BackendKind {
        BackendKind::Tunnel
    }

    async fn resize(&mut self, _width: u32, _height: u32) -> Result<(), BackendError> {
        Ok(())
    }
}
