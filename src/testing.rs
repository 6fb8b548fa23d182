//! In-crate test doubles for the directory, runtime, pool and stream traits

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{Algorithm, PrivateKey};
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;

use crate::backend::{BackendError, BackendKind, Endpoint, Server};
use crate::bastion::Bastion;
use crate::config::{BastionConfig, HostKey, SSHD_PID_PATH};
use crate::container::{ContainerError, ContainerInfo, ContainerRuntime, ExecSession};
use crate::instance::{DirectoryError, InstanceDirectory, InstanceRecord};
use crate::pool::{BackendConnector, BackendTransport};
use crate::server::AuthenticatedUser;
use crate::ssh::{Asset, SshError, SystemUser};

pub const WEB1_ID: &str = "c0ffee";
pub const WEB1_ADDRESS: &str = "172.18.0.5";
pub const WEB1_KEYS: [&str; 2] = [
    "ssh-rsa AAAAweb1key deploy@laptop",
    "ssh-ed25519 AAAAsecondkey ops@desk",
];
pub const PASSWD: &str = "root:x:0:0:root:/root:/bin/bash\n\
    deploy:x:1000:1000:Deploy:/home/deploy:/bin/bash\n";

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn web1_user() -> AuthenticatedUser {
    AuthenticatedUser {
        username: "deploy".to_string(),
        instance_id: WEB1_ID.to_string(),
        instance_name: "web1".to_string(),
        auth_keys: WEB1_KEYS.iter().map(|k| k.to_string()).collect(),
        auth_key: WEB1_KEYS[0].to_string(),
    }
}

pub fn test_host_key() -> HostKey {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    let public_line = key.public_key().to_openssh().unwrap();
    HostKey {
        private_key: Arc::new(key),
        public_line,
    }
}

pub fn test_bastion(runtime: Arc<MockRuntime>) -> Arc<Bastion> {
    test_bastion_with(runtime, Arc::new(MockConnector::default()))
}

pub fn test_bastion_with(
    runtime: Arc<MockRuntime>,
    connector: Arc<MockConnector>,
) -> Arc<Bastion> {
    Arc::new(Bastion::new(
        BastionConfig::default(),
        test_host_key(),
        Arc::new(MockDirectory::with_web1()),
        runtime,
        connector,
    ))
}

/// Build a single-file tar as the runtime's archive API returns it
pub fn file_archive(name: &str, content: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_path(name).unwrap();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, content).unwrap();
    builder.into_inner().unwrap()
}

// ---------------------------------------------------------------------------
// Instance directory

#[derive(Default)]
pub struct MockDirectory {
    records: HashMap<String, InstanceRecord>,
}

impl MockDirectory {
    pub fn with_web1() -> Self {
        let mut records = HashMap::new();
        records.insert(
            "web1".to_string(),
            InstanceRecord {
                id: WEB1_ID.to_string(),
                name: "web1".to_string(),
                address: Some(WEB1_ADDRESS.to_string()),
                auth_keys: WEB1_KEYS.iter().map(|k| k.to_string()).collect(),
            },
        );
        Self { records }
    }
}

#[async_trait]
impl InstanceDirectory for MockDirectory {
    async fn lookup_by_name(&self, name: &str) -> Result<Option<InstanceRecord>, DirectoryError> {
        Ok(self.records.get(name).cloned())
    }

    async fn lookup_by_id(&self, id: &str) -> Result<Option<InstanceRecord>, DirectoryError> {
        Ok(self.records.values().find(|r| r.id == id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Endpoints

#[derive(Default)]
struct Wire {
    sent: parking_lot::Mutex<Vec<u8>>,
    closes: AtomicU32,
}

/// Scripted byte stream; its `EndpointPeer` plays the far side
pub struct MockEndpoint {
    rx: mpsc::UnboundedReceiver<Bytes>,
    wire: Arc<Wire>,
    closed: bool,
}

pub struct EndpointPeer {
    tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    wire: Arc<Wire>,
}

impl MockEndpoint {
    pub fn pair() -> (MockEndpoint, EndpointPeer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let wire = Arc::new(Wire::default());
        (
            MockEndpoint {
                rx,
                wire: wire.clone(),
                closed: false,
            },
            EndpointPeer {
                tx: parking_lot::Mutex::new(Some(tx)),
                wire,
            },
        )
    }
}

impl EndpointPeer {
    /// Queue bytes for the endpoint's next `recv`
    pub fn push(&self, data: &[u8]) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(Bytes::copy_from_slice(data));
        }
    }

    /// After queued data drains, `recv` yields empty
    pub fn hangup(&self) {
        self.tx.lock().take();
    }

    pub fn sent(&self) -> Vec<u8> {
        self.wire.sent.lock().clone()
    }

    pub fn sent_string(&self) -> String {
        String::from_utf8_lossy(&self.sent()).into_owned()
    }

    pub fn close_count(&self) -> u32 {
        self.wire.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Endpoint for MockEndpoint {
    async fn recv(&mut self) -> Bytes {
        if self.closed {
            return Bytes::new();
        }
        match self.rx.recv().await {
            Some(data) => data,
            None => {
                self.closed = true;
                Bytes::new()
            }
        }
    }

    async fn send(&mut self, data: &[u8]) -> usize {
        self.wire.sent.lock().extend_from_slice(data);
        data.len()
    }

    fn closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) {
        self.closed = true;
        self.wire.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockServer {
    endpoint: MockEndpoint,
    kind: BackendKind,
    resizes: Arc<parking_lot::Mutex<Vec<(u32, u32)>>>,
}

#[derive(Clone)]
pub struct ServerPeer {
    endpoint: Arc<EndpointPeer>,
    resizes: Arc<parking_lot::Mutex<Vec<(u32, u32)>>>,
}

impl MockServer {
    pub fn new(kind: BackendKind) -> (MockServer, ServerPeer) {
        let (endpoint, peer) = MockEndpoint::pair();
        let resizes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        (
            MockServer {
                endpoint,
                kind,
                resizes: resizes.clone(),
            },
            ServerPeer {
                endpoint: Arc::new(peer),
                resizes,
            },
        )
    }
}

impl ServerPeer {
    pub fn push(&self, data: &[u8]) {
        self.endpoint.push(data)
    }

    pub fn hangup(&self) {
        self.endpoint.hangup()
    }

    pub fn sent(&self) -> Vec<u8> {
        self.endpoint.sent()
    }

    pub fn close_count(&self) -> u32 {
        self.endpoint.close_count()
    }

    pub fn resizes(&self) -> Vec<(u32, u32)> {
        self.resizes.lock().clone()
    }
}

#[async_trait]
impl Endpoint for MockServer {
    async fn recv(&mut self) -> Bytes {
        self.endpoint.recv().await
    }

    async fn send(&mut self, data: &[u8]) -> usize {
        self.endpoint.send(data).await
    }

    fn closed(&self) -> bool {
        self.endpoint.closed()
    }

    async fn close(&mut self) {
        self.endpoint.close().await
    }
}

#[async_trait]
impl Server for MockServer {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn resize(&mut self, width: u32, height: u32) -> Result<(), BackendError> {
        self.resizes.lock().push((width, height));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pool connector

struct MockTransport {
    parent: Arc<ConnectorState>,
    broken: AtomicBool,
}

#[derive(Default)]
struct ConnectorState {
    connects: AtomicU32,
    closes: AtomicU32,
    fail_shell: AtomicBool,
    fail_connect: AtomicBool,
    transports: parking_lot::Mutex<Vec<Arc<MockTransport>>>,
    shells: parking_lot::Mutex<Vec<(String, u32, u32)>>,
    next_server: parking_lot::Mutex<Option<MockServer>>,
    peers: parking_lot::Mutex<Vec<ServerPeer>>,
}

/// Connector whose transports open `MockServer` shells
#[derive(Default)]
pub struct MockConnector {
    state: Arc<ConnectorState>,
}

impl MockConnector {
    /// The first shell opened is `server`
    pub fn with_server(server: MockServer) -> Self {
        let connector = Self::default();
        *connector.state.next_server.lock() = Some(server);
        connector
    }

    pub fn fail_shell(&self, fail: bool) {
        self.state.fail_shell.store(fail, Ordering::SeqCst);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Existing transports keep reporting alive but can no longer open shells
    pub fn break_transports(&self) {
        for transport in self.state.transports.lock().iter() {
            transport.broken.store(true, Ordering::SeqCst);
        }
    }

    pub fn connects(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn shells(&self) -> Vec<(String, u32, u32)> {
        self.state.shells.lock().clone()
    }

    /// Peer of the most recent shell built by the connector itself
    pub fn last_server(&self) -> ServerPeer {
        self.state.peers.lock().last().cloned().unwrap()
    }
}

#[async_trait]
impl BackendConnector for MockConnector {
    async fn connect(
        &self,
        _asset: &Asset,
        _system_user: &SystemUser,
    ) -> Result<Arc<dyn BackendTransport>, SshError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(SshError::AuthenticationFailed("rejected".to_string()));
        }
        let transport = Arc::new(MockTransport {
            parent: self.state.clone(),
            broken: AtomicBool::new(false),
        });
        self.state.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

#[async_trait]
impl BackendTransport for MockTransport {
    fn is_alive(&self) -> bool {
        true
    }

    async fn open_shell(
        &self,
        term: &str,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn Server>, SshError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(SshError::Disconnected);
        }
        if self.parent.fail_shell.load(Ordering::SeqCst) {
            return Err(SshError::ChannelError("shell refused".to_string()));
        }
        self.parent
            .shells
            .lock()
            .push((term.to_string(), width, height));
        if let Some(server) = self.parent.next_server.lock().take() {
            return Ok(Box::new(server));
        }
        let (server, peer) = MockServer::new(BackendKind::Pooled);
        self.parent.peers.lock().push(peer);
        Ok(Box::new(server))
    }

    async fn close(&self) -> Result<(), SshError> {
        self.parent.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Container runtime

struct ExecPipes {
    output: Option<mpsc::UnboundedSender<Bytes>>,
    input: Option<DuplexStream>,
}

/// Runtime holding the single container `c0ffee`
pub struct MockRuntime {
    sshd: bool,
    address: parking_lot::Mutex<Option<String>>,
    refused: parking_lot::Mutex<HashSet<String>>,
    execs: parking_lot::Mutex<Vec<(String, String)>>,
    resizes: parking_lot::Mutex<Vec<(String, u32, u32)>>,
    puts: parking_lot::Mutex<Vec<(String, String, Vec<u8>)>>,
    pipes: parking_lot::Mutex<ExecPipes>,
}

impl MockRuntime {
    pub fn new(sshd: bool) -> Self {
        Self {
            sshd,
            address: parking_lot::Mutex::new(Some(WEB1_ADDRESS.to_string())),
            refused: parking_lot::Mutex::new(HashSet::new()),
            execs: parking_lot::Mutex::new(Vec::new()),
            resizes: parking_lot::Mutex::new(Vec::new()),
            puts: parking_lot::Mutex::new(Vec::new()),
            pipes: parking_lot::Mutex::new(ExecPipes {
                output: None,
                input: None,
            }),
        }
    }

    /// Network address reported for the container; `None` defers to the directory
    pub fn set_address(&self, address: Option<&str>) {
        *self.address.lock() = address.map(str::to_string);
    }

    pub fn refuse_shell(&self, shell: &str) {
        self.refused.lock().insert(shell.to_string());
    }

    pub fn execs(&self) -> Vec<(String, String)> {
        self.execs.lock().clone()
    }

    pub fn resizes(&self) -> Vec<(String, u32, u32)> {
        self.resizes.lock().clone()
    }

    pub fn puts(&self) -> Vec<(String, String, Vec<u8>)> {
        self.puts.lock().clone()
    }

    /// Bytes for the latest exec's output stream
    pub fn push_output(&self, data: &[u8]) {
        if let Some(tx) = self.pipes.lock().output.as_ref() {
            let _ = tx.send(Bytes::copy_from_slice(data));
        }
    }

    pub fn finish_output(&self) {
        self.pipes.lock().output.take();
    }

    /// Everything written to the latest exec's stdin, once it is shut down
    pub async fn input(&self) -> Vec<u8> {
        let reader = self.pipes.lock().input.take();
        let mut content = Vec::new();
        if let Some(mut reader) = reader {
            reader.read_to_end(&mut content).await.unwrap();
        }
        content
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn find_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<ContainerInfo>, ContainerError> {
        if instance_id != WEB1_ID {
            return Ok(None);
        }
        Ok(Some(ContainerInfo {
            id: WEB1_ID.to_string(),
            name: "web1".to_string(),
            address: self.address.lock().clone(),
        }))
    }

    async fn get_archive(&self, _container_id: &str, path: &str) -> Result<Vec<u8>, ContainerError> {
        match path {
            SSHD_PID_PATH if self.sshd => Ok(file_archive("sshd.pid", b"42\n")),
            "/etc/passwd" => Ok(file_archive("passwd", PASSWD.as_bytes())),
            _ => Err(ContainerError::PathNotFound(path.to_string())),
        }
    }

    async fn put_archive(
        &self,
        container_id: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), ContainerError> {
        self.puts
            .lock()
            .push((container_id.to_string(), path.to_string(), archive));
        Ok(())
    }

    async fn exec_shell(
        &self,
        _container_id: &str,
        shell: &str,
        user: &str,
    ) -> Result<ExecSession, ContainerError> {
        if self.refused.lock().contains(shell) {
            return Err(ContainerError::Exec(format!("{} not found", shell)));
        }
        let exec_id = {
            let mut execs = self.execs.lock();
            execs.push((shell.to_string(), user.to_string()));
            format!("exec-{}", execs.len())
        };

        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
        let (input, reader) = tokio::io::duplex(64 * 1024);
        {
            let mut pipes = self.pipes.lock();
            pipes.output = Some(tx);
            pipes.input = Some(reader);
        }

        let output = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|data| (Ok::<_, ContainerError>(data), rx))
        })
        .boxed();

        Ok(ExecSession {
            exec_id,
            output,
            input: Box::pin(input),
        })
    }

    async fn resize_exec(
        &self,
        exec_id: &str,
        width: u32,
        height: u32,
    ) -> Result<(), ContainerError> {
        self.resizes
            .lock()
            .push((exec_id.to_string(), width, height));
        Ok(())
    }
}
