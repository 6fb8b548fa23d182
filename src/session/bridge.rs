//! Session Bridge
//!
//! Relays bytes between the user channel and the backend until either side
//! hangs up or the session is stopped. Resize events go to the backend.
//!
//! ```text
//! client ──recv──▶ server.send
//! server ──recv──▶ client.send      (touches last_active)
//! resize ─────────▶ server.resize   (pty sessions only)
//! stop / hangup ──▶ teardown
//! ```

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::registry::SessionRegistry;
use super::types::Session;
use crate::backend::{Endpoint, Server};
use crate::config::BRIDGE_TICK;
use crate::server::Client;

/// Run the relay loop to completion, then tear the session down.
///
/// Teardown always removes the session from `sessions` and closes both
/// endpoints, server first.
pub async fn bridge(
    sessions: &SessionRegistry,
    session: Arc<Session>,
    client: &Client,
    mut client_stream: Box<dyn Endpoint>,
    mut server: Box<dyn Server>,
) {
    let has_pty = client.request().has_pty();
    info!(
        session_id = %session.id,
        "Start bridge session: {} -> {} ({})",
        client, session.target.asset, session.target.kind
    );

    while !session.is_finished() {
        if client_stream.closed() || server.closed() {
            debug!("Session {} endpoint already closed", session.id);
            break;
        }

        tokio::select! {
            data = client_stream.recv() => {
                if data.is_empty() {
                    info!("Client close the connection: {}", client);
                    session.mark_finished();
                    break;
                }
                server.send(&data).await;
            }
            data = server.recv() => {
                if data.is_empty() {
                    info!("Server close the connection: {}", session.target.asset);
                    session.mark_finished();
                    break;
                }
                session.touch();
                client_stream.send(&data).await;
            }
            _ = session.stop_token().cancelled() => {
                session.mark_finished();
                break;
            }
            _ = client.resized(), if has_pty => {
                let (width, height) = {
                    let request = client.request();
                    (request.width, request.height)
                };
                debug!("Resize session {} to {}x{}", session.id, width, height);
                if let Err(e) = server.resize(width, height).await {
                    warn!("Resize session {} failed: {}", session.id, e);
                }
            }
            _ = tokio::time::sleep(BRIDGE_TICK) => {}
        }
    }

    info!("Session stop event set: {}", session.id);
    sessions.remove(&session.id);
    server.close().await;
    client_stream.close().await;
}
