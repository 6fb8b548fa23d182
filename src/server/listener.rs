//! TCP accept loop and per-connection tasks

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::handler::{allowed_methods, BastionHandler};
use super::registry::Connection;
use crate::bastion::Bastion;
use crate::config::{LOGIN_FROM, READY_WAIT};
use crate::dispatch::Dispatcher;
use crate::ssh::SshError;

fn server_config(ctx: &Bastion) -> Arc<russh::server::Config> {
    Arc::new(russh::server::Config {
        methods: allowed_methods(),
        keys: vec![ctx.host_key.private_key.as_ref().clone()],
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keepalive_interval: Some(Duration::from_secs(ctx.config.keepalive_secs)),
        ..Default::default()
    })
}

/// Accept SSH connections until `shutdown` fires
pub async fn serve(ctx: Arc<Bastion>, shutdown: CancellationToken) -> Result<(), SshError> {
    let addr = ctx.config.bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("Bastion listening on {}", addr);
    serve_listener(ctx, listener, shutdown).await
}

pub async fn serve_listener(
    ctx: Arc<Bastion>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<(), SshError> {
    let config = server_config(&ctx);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Accept loop stopped");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("Accepted connection from {}", peer);
                    tokio::spawn(handle_connection(ctx.clone(), config.clone(), stream, peer));
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_connection(
    ctx: Arc<Bastion>,
    config: Arc<russh::server::Config>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let _ = stream.set_nodelay(true);
    let connection = Arc::new(Connection::new(Some(peer), LOGIN_FROM));
    ctx.connections.insert(connection.clone());

    let (opened_tx, opened_rx) = mpsc::unbounded_channel();
    let handler = BastionHandler::new(ctx.clone(), connection.clone(), opened_tx);
    tokio::spawn(accept_channels(ctx.clone(), connection.clone(), opened_rx));

    match russh::server::run_stream(config, stream, handler).await {
        Ok(session) => match session.await {
            Ok(()) => info!("Connection {} from {} finished", connection.id, peer),
            Err(e) => info!("Connection {} from {} ended: {}", connection.id, peer, e),
        },
        Err(e) => info!("Handshake with {} failed: {}", peer, e),
    }

    ctx.connections.remove(&connection.id).await;
}

/// Wait for each opened channel to finish negotiating, then dispatch it
async fn accept_channels(
    ctx: Arc<Bastion>,
    connection: Arc<Connection>,
    mut opened_rx: mpsc::UnboundedReceiver<u32>,
) {
    while let Some(id) = opened_rx.recv().await {
        let Some(client) = connection.get_client(id) else {
            continue;
        };

        if !connection.ready().wait_timeout(READY_WAIT).await {
            warn!(
                conn_id = %connection.id,
                channel = id,
                "Negotiation timed out after {:?}",
                READY_WAIT
            );
            connection.remove_client(id).await;
            continue;
        }
        connection.ready().clear();

        let dispatcher = Dispatcher::new(ctx.clone());
        let connection = connection.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(&connection, client).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ChannelKind;
    use crate::testing::{eventually, test_bastion, MockEndpoint, MockRuntime};

    #[tokio::test(start_paused = true)]
    async fn test_unready_channel_is_closed_after_wait() {
        let ctx = test_bastion(Arc::new(MockRuntime::new(false)));
        let connection = Arc::new(Connection::new(None, LOGIN_FROM));
        let (endpoint, peer) = MockEndpoint::pair();
        connection.new_client(0, ChannelKind::Session, Box::new(endpoint));

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(0).unwrap();
        drop(tx);

        accept_channels(ctx, connection.clone(), rx).await;

        assert_eq!(connection.client_count(), 0);
        assert_eq!(peer.close_count(), 1);
    }

    #[tokio::test]
    async fn test_ready_before_accept_dispatches_and_clears() {
        let ctx = test_bastion(Arc::new(MockRuntime::new(false)));
        let connection = Arc::new(Connection::new(None, LOGIN_FROM));
        let (endpoint, peer) = MockEndpoint::pair();
        let client = connection.new_client(0, ChannelKind::Session, Box::new(endpoint));
        client.request().on_exec(b"uptime");
        connection.ready().set();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(0).unwrap();
        drop(tx);

        accept_channels(ctx, connection.clone(), rx).await;

        assert!(!connection.ready().is_set());
        eventually(|| peer.close_count() == 1).await;
        assert_eq!(connection.client_count(), 0);
        assert!(peer.sent_string().contains("not support now"));
    }
}
