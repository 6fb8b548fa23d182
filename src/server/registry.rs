//! Transport Registry
//!
//! Thread-safe tracking of inbound SSH transports (`Connection`) and the
//! logical channels (`Client`) multiplexed over each of them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::auth::AuthenticatedUser;
use super::request::{ChannelKind, Request};
use crate::backend::{warning, Endpoint};

/// Level-triggered flag with async waiters
#[derive(Default)]
pub struct ReadySignal {
    flag: AtomicBool,
    notify: Notify,
}

impl ReadySignal {
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Wait until set, returning false on timeout
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_set();
            }
        }
    }
}

/// One logical channel of a connection
pub struct Client {
    pub id: u32,
    pub connection_id: String,
    pub remote_addr: Option<SocketAddr>,
    pub login_from: &'static str,
    user: Option<AuthenticatedUser>,
    request: parking_lot::Mutex<Request>,
    resize: Notify,
    stream: tokio::sync::Mutex<Option<Box<dyn Endpoint>>>,
    stop: CancellationToken,
}

impl Client {
    pub fn user(&self) -> Option<&AuthenticatedUser> {
        self.user.as_ref()
    }

    /// Lock the request for a transition or a read
    pub fn request(&self) -> parking_lot::MutexGuard<'_, Request> {
        self.request.lock()
    }

    pub fn request_snapshot(&self) -> Request {
        self.request.lock().clone()
    }

    /// Raise the resize signal; one pending permit is kept if nobody waits
    pub fn notify_resize(&self) {
        self.resize.notify_one();
    }

    pub async fn resized(&self) {
        self.resize.notified().await
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Move the channel stream out for bridging; later calls get `None`
    pub async fn take_stream(&self) -> Option<Box<dyn Endpoint>> {
        self.stream.lock().await.take()
    }

    /// Write text to the channel if it has not been handed to a bridge
    pub async fn send_text(&self, text: &str) -> usize {
        match self.stream.lock().await.as_mut() {
            Some(stream) => stream.send(text.as_bytes()).await,
            None => 0,
        }
    }

    /// Write a red warning line
    pub async fn send_warning(&self, message: &str) -> usize {
        self.send_text(&warning(message)).await
    }

    /// Stop any bridge running on this client and close the channel
    pub async fn close(&self) {
        self.stop.cancel();
        if let Some(mut stream) = self.stream.lock().await.take() {
            stream.close().await;
        }
        debug!("Client {} of {} closed", self.id, self.connection_id);
    }
}

impl std::fmt::Display for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{}:{}#{}", user.instance_name, user.username, self.id),
            None => write!(f, "anonymous#{}", self.id),
        }
    }
}

/// One accepted SSH transport
pub struct Connection {
    pub id: String,
    pub remote_addr: Option<SocketAddr>,
    pub login_from: &'static str,
    user: parking_lot::RwLock<Option<AuthenticatedUser>>,
    clients: DashMap<u32, Arc<Client>>,
    ready: ReadySignal,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(remote_addr: Option<SocketAddr>, login_from: &'static str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            remote_addr,
            login_from,
            user: parking_lot::RwLock::new(None),
            clients: DashMap::new(),
            ready: ReadySignal::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_user(&self, user: AuthenticatedUser) {
        *self.user.write() = Some(user);
    }

    pub fn user(&self) -> Option<AuthenticatedUser> {
        self.user.read().clone()
    }

    pub fn ready(&self) -> &ReadySignal {
        &self.ready
    }

    /// Register a channel; the client copies the currently bound user
    pub fn new_client(&self, id: u32, kind: ChannelKind, stream: Box<dyn Endpoint>) -> Arc<Client> {
        let client = Arc::new(Client {
            id,
            connection_id: self.id.clone(),
            remote_addr: self.remote_addr,
            login_from: self.login_from,
            user: self.user(),
            request: parking_lot::Mutex::new(Request::new(kind)),
            resize: Notify::new(),
            stream: tokio::sync::Mutex::new(Some(stream)),
            stop: CancellationToken::new(),
        });
        self.clients.insert(id, client.clone());
        debug!("Client {} registered on connection {}", id, self.id);
        client
    }

    pub fn get_client(&self, id: u32) -> Option<Arc<Client>> {
        self.clients.get(&id).map(|c| c.value().clone())
    }

    pub async fn remove_client(&self, id: u32) {
        if let Some((_, client)) = self.clients.remove(&id) {
            client.close().await;
            debug!("Client {} removed from connection {}", id, self.id);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every client; the transport itself is owned by the server task
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<u32> = self.clients.iter().map(|c| *c.key()).collect();
        for id in ids {
            self.remove_client(id).await;
        }
        info!("Connection {} closed", self.id);
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection: Arc<Connection>) {
        self.connections.insert(connection.id.clone(), connection);
    }

    /// Deregister and close all of the connection's clients
    pub async fn remove(&self, id: &str) {
        if let Some((_, connection)) = self.connections.remove(id) {
            connection.close().await;
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
