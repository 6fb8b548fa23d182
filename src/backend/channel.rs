//! russh channel as a bridge endpoint
//!
//! Used for both the user-facing server channel and the backend shell channel
//! opened on a pooled transport. Only the backend side is a `Server`.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use russh::{Channel, ChannelId, ChannelMsg};
use tracing::{debug, warn};

use super::{BackendError, BackendKind, Endpoint, Server, CHUNK_SIZE};

pub struct ChannelEndpoint<S>
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    channel: Channel<S>,
    /// Bytes received but not yet handed out
    pending: BytesMut,
    closed: bool,
}

impl<S> ChannelEndpoint<S>
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    pub fn new(channel: Channel<S>) -> Self {
        Self {
            channel,
            pending: BytesMut::new(),
            closed: false,
        }
    }

    fn take_chunk(&mut self) -> Bytes {
        let n = self.pending.len().min(CHUNK_SIZE);
        self.pending.split_to(n).freeze()
    }
}

#[async_trait]
impl<S> Endpoint for ChannelEndpoint<S>
where
    S: From<(ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
    async fn recv(&mut self) -> Bytes {
        loop {
            if !self.pending.is_empty() {
                return self.take_chunk();
            }
            if self.closed {
                return Bytes::new();
            }
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => self.pending.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    self.pending.extend_from_slice(&data)
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("Channel {:?} exit status {}", self.channel.id(), exit_status);
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    self.closed = true;
                }
                Some(_) => {}
            }
        }
    }

    async fn send(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        match self.channel.data(data).await {
            Ok(()) => data.len(),
            Err(e) => {
                warn!("Send to channel {:?} failed: {}", self.channel.id(), e);
                0
            }
        }
    }

    fn closed(&self) -> bool {
        self.closed && self.pending.is_empty()
    }

    async fn close(&mut self) {
        self.closed = true;
        let _ = self.channel.eof().await;
        if let Err(e) = self.channel.close().await {
            debug!("Close channel {:?} failed: {}", self.channel.id(), e);
        }
    }
}

#[async_trait]
impl Server for ChannelEndpoint<russh::client::Msg> {
    fn kind(&self) -> BackendKind {
        BackendKind::Pooled
    }

    async fn resize(&mut self, width: u32, height: u32) -> Result<(), BackendError> {
        debug!("Sending window_change: {}x{} on {:?}", width, height, self.channel.id());
        self.channel
            .window_change(width, height, 0, 0)
            .await
            .map_err(|e| BackendError::Ssh(e.into()))
    }
}
