//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>` of a backend transport.
//! Pool entries and shell adapters talk to it through `HandleController`,
//! which sends commands over an mpsc channel.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, "deploy@172.18.0.5:22".into(), alive);
//! let channel = controller.open_session_channel().await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How often the owner task checks whether the transport went away
const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (for PTY/shell)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Cloneable controller for the Handle Owner Task
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    alive: Arc<AtomicBool>,
}

impl HandleController {
    /// Build a controller around an existing sender and liveness flag.
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>, alive: Arc<AtomicBool>) -> Self {
        Self { cmd_tx, alive }
    }

    /// Open a session channel (for PTY/shell)
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// False as soon as the transport reports a disconnect or the owner
    /// task has stopped
    pub fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes the handle and returns a controller. The task ends when a
/// `Disconnect` arrives, when every controller is dropped, or when the
/// transport closes underneath it. `alive` is the flag the handle's
/// `ClientHandler` clears on disconnect; the task clears it too on exit.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    label: String,
    alive: Arc<AtomicBool>,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let flag = alive.clone();

    tokio::spawn(async move {
        let handle = handle;
        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);

        info!("Handle owner task started for {}", label);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(HandleCommand::ChannelOpenSession { reply_tx }) => {
                            let result = handle.channel_open_session().await;
                            if result.is_err() && handle.is_closed() {
                                flag.store(false, Ordering::SeqCst);
                            }
                            if reply_tx.send(result).is_err() {
                                warn!("Caller dropped before receiving channel_open_session result");
                            }
                        }
                        Some(HandleCommand::Disconnect) => {
                            info!("Disconnect requested for {}", label);
                            break;
                        }
                        None => {
                            info!("All controllers dropped for {}", label);
                            break;
                        }
                    }
                }
                _ = liveness.tick() => {
                    if handle.is_closed() {
                        info!("Transport closed underneath {}", label);
                        break;
                    }
                }
            }
        }

        flag.store(false, Ordering::SeqCst);
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", label);
    });

    HandleController { cmd_tx, alive }
}

/// Drain all pending commands, returning Disconnected error to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
