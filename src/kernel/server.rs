//! Unix socket front door of the kernel
//!
//! One task per connection reads and decodes frames in arrival order and
//! answers every REQUEST with exactly one RESPONSE. Everything written to a
//! connection goes through its [`ConnectionHandle`], drained by a dedicated
//! writer task. When the reader stops, responses already queued are still
//! flushed before the socket closes.

use super::bus::{EventBus, HandlerId, KernelEvent};
use super::connection::{ConnectionHandle, ConnectionId, ConnectionIdentity};
use super::devices::{DeviceError, DeviceRegistry};
use super::metrics::SystemMonitor;
use super::process::{ProcessError, ProcessEvent, ProcessManager, ProcessOptions};
use super::protocol::{FrameBuffer, NoticePayload, Packet, PacketKind, ResponsePayload};
use super::ring_buffer::DEFAULT_CAPACITY;
use super::services::{ServiceError, ServiceManager};
use super::stream_subscription::{StreamMode, StreamSelector, StreamSubscriptionManager};
use super::topic::{TopicError, TopicSubscriptionManager};
use super::vault::Vault;
use bytes::Bytes;
use crate::clienv;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_bytes::ByteBuf;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const READ_BUF_SIZE: usize = 64 * 1024;

/// How long a closing connection may take to flush queued responses
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub const PROCESS_EXIT_TOPIC: &str = "process.exit";

/// A request that failed. Sent back as the RESPONSE `error` string; the
/// connection stays open.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("Missing params: {0}")]
    MissingParams(&'static str),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Permission denied: process {0} belongs to another identity")]
    NotOwner(String),

    #[error("Permission denied: connection has not identified itself")]
    Unidentified,

    #[error("Access denied or secret not found")]
    VaultDenied,

    #[error("{0} is not available")]
    Unavailable(&'static str),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

type DispatchResult = std::result::Result<Value, DispatchError>;

#[derive(Debug, Default, Deserialize)]
struct IdParams {
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SpawnParams {
    id: Option<String>,
    command: Option<Vec<String>>,
    #[serde(default)]
    options: Option<ProcessOptions>,
}

/// Stdin data arrives either as text or as raw bytes
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StdinData {
    Text(String),
    Bytes(ByteBuf),
}

impl StdinData {
    fn as_bytes(&self) -> &[u8] {
        match self {
            StdinData::Text(text) => text.as_bytes(),
            StdinData::Bytes(bytes) => bytes.as_slice(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StdinParams {
    id: Option<String>,
    data: Option<StdinData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamSubscribeParams {
    pid: Option<String>,
    stream: Option<StreamSelector>,
    mode: Option<StreamMode>,
    buffer_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionParams {
    subscription_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TopicParams {
    topic: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VaultParams {
    token: Option<String>,
    handle: Option<String>,
}

/// REQUEST body read field by field, so a frame that carries a usable id is
/// answered even when the rest is malformed
#[derive(Debug, Deserialize)]
struct LooseRequest {
    #[serde(default)]
    id: Option<rmpv::Value>,
    #[serde(default)]
    method: Option<rmpv::Value>,
    #[serde(default)]
    params: Option<rmpv::Value>,
}

fn value_string(value: Option<rmpv::Value>) -> Option<String> {
    match value {
        Some(rmpv::Value::String(s)) => s.into_str(),
        _ => None,
    }
}

/// Decode request params into `T`; absent params mean all defaults
fn parse_params<T: DeserializeOwned + Default>(params: Option<rmpv::Value>) -> std::result::Result<T, DispatchError> {
    match params {
        None | Some(rmpv::Value::Nil) => Ok(T::default()),
        Some(value) => {
            rmpv::ext::from_value(value).map_err(|e| DispatchError::InvalidParams(e.to_string()))
        }
    }
}

/// Per-connection state owned by the connection task
struct Session {
    handle: ConnectionHandle,
    identity: Option<ConnectionIdentity>,
}

struct Shared {
    processes: ProcessManager,
    streams: StreamSubscriptionManager,
    topics: TopicSubscriptionManager,
    connections: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
    next_connection: AtomicU64,
    monitor: SystemMonitor,
    vault: Option<Arc<dyn Vault>>,
    devices: Option<Arc<dyn DeviceRegistry>>,
    bus: Option<Arc<dyn EventBus>>,
    services: Option<ServiceManager>,
    trust_unidentified: bool,
}

pub struct KernelServerBuilder {
    processes: ProcessManager,
    socket_path: PathBuf,
    vault: Option<Arc<dyn Vault>>,
    devices: Option<Arc<dyn DeviceRegistry>>,
    bus: Option<Arc<dyn EventBus>>,
    services: Option<ServiceManager>,
    start_services: bool,
    trust_unidentified: bool,
    stream_buffer_size: usize,
}

impl KernelServerBuilder {
    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn vault(mut self, vault: Arc<dyn Vault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn devices(mut self, devices: Arc<dyn DeviceRegistry>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn services(mut self, services: ServiceManager) -> Self {
        self.services = Some(services);
        self
    }

    /// Start every registered service once the server is accepting
    pub fn start_services(mut self, start: bool) -> Self {
        self.start_services = start;
        self
    }

    /// Whether connections that never called `identify` may control processes
    pub fn trust_unidentified(mut self, trust: bool) -> Self {
        self.trust_unidentified = trust;
        self
    }

    /// Default ring capacity for stream subscriptions that don't pick one
    pub fn stream_buffer_size(mut self, bytes: usize) -> Self {
        self.stream_buffer_size = bytes;
        self
    }

    pub fn build(self) -> KernelServer {
        KernelServer {
            socket_path: self.socket_path,
            start_services: self.start_services,
            shared: Arc::new(Shared {
                processes: self.processes,
                streams: StreamSubscriptionManager::with_default_buffer_size(self.stream_buffer_size),
                topics: TopicSubscriptionManager::new(),
                connections: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(0),
                monitor: SystemMonitor::new(),
                vault: self.vault,
                devices: self.devices,
                bus: self.bus,
                services: self.services,
                trust_unidentified: self.trust_unidentified,
            }),
        }
    }
}

pub struct KernelServer {
    socket_path: PathBuf,
    start_services: bool,
    shared: Arc<Shared>,
}

impl KernelServer {
    pub fn builder(processes: ProcessManager) -> KernelServerBuilder {
        KernelServerBuilder {
            processes,
            socket_path: clienv::socket_path(),
            vault: None,
            devices: None,
            bus: None,
            services: None,
            start_services: false,
            trust_unidentified: true,
            stream_buffer_size: DEFAULT_CAPACITY,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of open client connections
    pub fn connection_count(&self) -> usize {
        self.shared.connections().len()
    }

    /// Replace any stale socket file and listen on a fresh one (mode 0600)
    pub fn bind(&self) -> Result<UnixListener> {
        let path = &self.socket_path;
        if path.exists() {
            debug!("Removing stale socket {}", path.display());
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create socket directory {}", parent.display()))?;
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind {}", path.display()))?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        info!("IPC server listening on: {}", path.display());
        Ok(listener)
    }

    /// Bind and serve until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` fires, then stop all
    /// services and remove the socket file.
    pub async fn serve(&self, listener: UnixListener, shutdown: CancellationToken) -> Result<()> {
        let pump = tokio::spawn(pump_process_events(
            Arc::downgrade(&self.shared),
            self.shared.processes.subscribe(),
        ));
        let bus_handler = self.attach_bus();
        let service_bridge = match (&self.shared.services, &self.shared.bus) {
            (Some(services), Some(bus)) => Some(services.bridge_to_bus(Arc::clone(bus))),
            _ => None,
        };

        if self.start_services {
            if let Some(services) = self.shared.services.clone() {
                tokio::spawn(async move {
                    if let Err(e) = services.start_all().await {
                        error!("Service startup aborted: {}", e);
                    }
                });
            }
        }

        info!("Kernel ready");
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let shared = Arc::clone(&self.shared);
                        let conn = shared.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
                        let shutdown = shutdown.child_token();
                        tokio::spawn(async move {
                            handle_connection(shared, stream, conn, shutdown).await;
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }
        drop(listener);

        if let Some(services) = &self.shared.services {
            info!("Stopping all services...");
            services.stop_all().await;
        }
        if let (Some(bus), Some(id)) = (&self.shared.bus, bus_handler) {
            bus.unsubscribe(id);
        }
        if let Some(bridge) = service_bridge {
            bridge.abort();
        }
        pump.abort();

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to remove socket {}", self.socket_path.display()))?;
        }
        info!("Kernel stopped");
        Ok(())
    }

    /// Forward every bus event to the topic subscribers
    fn attach_bus(&self) -> Option<HandlerId> {
        let bus = self.shared.bus.as_ref()?;
        let weak = Arc::downgrade(&self.shared);
        let handler = Arc::new(move |event: &KernelEvent| {
            if let Some(shared) = weak.upgrade() {
                shared.topics.dispatch(event);
            }
        });
        match bus.subscribe(">", handler) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Failed to attach to the event bus: {}", e);
                None
            }
        }
    }
}

async fn pump_process_events(
    shared: Weak<Shared>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<ProcessEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match event {
            ProcessEvent::Output { id, stream, data } => {
                shared.streams.push(&id, stream, &data);
            }
            ProcessEvent::Exit { id, code, .. } => {
                let removed = shared.streams.remove_by_process(&id);
                trace!(id = %id, removed, "Process exited, stream subscriptions removed");
                shared.broadcast(&NoticePayload {
                    topic: PROCESS_EXIT_TOPIC.to_string(),
                    data: json!({ "id": id, "code": code }),
                });
            }
        }
    }
}

async fn handle_connection(
    shared: Arc<Shared>,
    stream: UnixStream,
    conn: ConnectionId,
    shutdown: CancellationToken,
) {
    debug!(conn, "Client connected");
    let (mut reader, mut writer) = stream.into_split();
    let (handle, mut outgoing) = ConnectionHandle::channel(conn);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outgoing.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                debug!(conn, "Write failed: {}", e);
                break;
            }
        }
    });

    shared.connections().insert(conn, handle.clone());
    let mut session = Session {
        handle,
        identity: None,
    };
    let mut frames = FrameBuffer::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];

    'read: loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = shutdown.cancelled() => break,
        };
        match read {
            Ok(0) => break,
            Ok(n) => frames.extend(&buf[..n]),
            Err(e) => {
                debug!(conn, "Read failed: {}", e);
                break;
            }
        }

        loop {
            match frames.next_packet() {
                Ok(Some(packet)) => shared.handle_packet(&mut session, packet).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(conn, "Protocol error, closing connection: {}", e);
                    break 'read;
                }
            }
        }
    }

    shared.connections().remove(&conn);
    let streams = shared.streams.remove_by_connection(conn);
    let topics = shared.topics.remove_by_connection(conn);
    drop(session);

    // The writer ends once every handle is gone. Tasks still holding one
    // (a pending wait) are cut off after the timeout.
    let abort = writer_task.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_task).await.is_err() {
        debug!(conn, "Writer still busy, dropping unsent frames");
        abort.abort();
    }
    debug!(conn, streams, topics, "Client disconnected");
}

impl Shared {
    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionHandle>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn broadcast(&self, notice: &NoticePayload) {
        let handles: Vec<ConnectionHandle> = self.connections().values().cloned().collect();
        for handle in handles {
            handle.send(PacketKind::Event, notice);
        }
    }

    async fn handle_packet(&self, session: &mut Session, packet: Packet) {
        if packet.kind != PacketKind::Request {
            trace!(conn = session.handle.id(), "Ignoring {} frame", packet.kind.as_str());
            return;
        }
        let request: LooseRequest = match packet.into_payload() {
            Ok(request) => request,
            Err(e) => {
                warn!(conn = session.handle.id(), "Malformed request: {}", e);
                return;
            }
        };
        let Some(id) = value_string(request.id) else {
            warn!(conn = session.handle.id(), "Request without an id, dropping");
            return;
        };
        let Some(method) = value_string(request.method) else {
            debug!(conn = session.handle.id(), id = %id, "Request without a method");
            let error = DispatchError::InvalidRequest("missing method");
            session
                .handle
                .send(PacketKind::Response, &ResponsePayload::err(id, error.to_string()));
            return;
        };
        let params = request.params;
        debug!(conn = session.handle.id(), id = %id, "Handling: {}", method);

        match method.as_str() {
            "process.wait" => return self.spawn_wait(session, id, params),
            "process.stdin.write" => return self.spawn_stdin_write(session, id, params),
            _ => {}
        }

        let response = match self.dispatch(session, &method, params).await {
            Ok(result) => ResponsePayload::ok(id, result),
            Err(e) => {
                debug!(method = %method, "Request failed: {}", e);
                ResponsePayload::err(id, e.to_string())
            }
        };
        session.handle.send(PacketKind::Response, &response);
    }

    /// Check whether this connection may control process `id`
    fn authorize(&self, session: &Session, id: &str) -> std::result::Result<(), DispatchError> {
        let Some(identity) = &session.identity else {
            return if self.trust_unidentified {
                Ok(())
            } else {
                Err(DispatchError::Unidentified)
            };
        };
        if self.processes.is_owned_by(id, identity.principal()) {
            Ok(())
        } else {
            warn!(id = %id, principal = ?identity.principal(), "Ownership check failed");
            Err(DispatchError::NotOwner(id.to_string()))
        }
    }

    /// Lookup and ownership happen now; the wait itself runs in its own task
    /// so later frames on this connection are not held up.
    fn spawn_wait(&self, session: &Session, request_id: String, params: Option<rmpv::Value>) {
        let watcher = parse_params::<IdParams>(params).and_then(|p| {
            let id = p.id.ok_or(DispatchError::MissingParams("id"))?;
            self.authorize(session, &id)?;
            let watcher = self.processes.exit_watcher(&id)?;
            Ok((id, watcher))
        });

        let handle = session.handle.clone();
        match watcher {
            Ok((id, watcher)) => {
                tokio::spawn(async move {
                    let exit_code = watcher.wait().await;
                    let result = json!({ "status": "exited", "id": id, "exitCode": exit_code });
                    handle.send(PacketKind::Response, &ResponsePayload::ok(request_id, result));
                });
            }
            Err(e) => {
                handle.send(PacketKind::Response, &ResponsePayload::err(request_id, e.to_string()));
            }
        }
    }

    /// The write is queued now, keeping stdin in frame order; the reply is sent
    /// once it reaches the pipe, so a child that stops reading only delays
    /// this one response.
    fn spawn_stdin_write(&self, session: &Session, request_id: String, params: Option<rmpv::Value>) {
        let queued = parse_params::<StdinParams>(params).and_then(|p| {
            let (Some(id), Some(data)) = (p.id, p.data) else {
                return Err(DispatchError::MissingParams("id, data"));
            };
            self.authorize(session, &id)?;
            let write = self
                .processes
                .queue_stdin(&id, Bytes::copy_from_slice(data.as_bytes()))?;
            Ok((id, write))
        });

        let handle = session.handle.clone();
        match queued {
            Ok((id, write)) => {
                tokio::spawn(async move {
                    let response = match write.finish().await {
                        Ok(()) => {
                            ResponsePayload::ok(request_id, json!({ "status": "written", "id": id }))
                        }
                        Err(e) => {
                            debug!(id = %id, "Stdin write failed: {}", e);
                            ResponsePayload::err(request_id, DispatchError::from(e).to_string())
                        }
                    };
                    handle.send(PacketKind::Response, &response);
                });
            }
            Err(e) => {
                handle.send(PacketKind::Response, &ResponsePayload::err(request_id, e.to_string()));
            }
        }
    }

    async fn dispatch(&self, session: &mut Session, method: &str, params: Option<rmpv::Value>) -> DispatchResult {
        match method {
            "system.get_metrics" => Ok(serde_json::to_value(self.monitor.metrics())?),

            "identify" => {
                let identity: ConnectionIdentity = parse_params(params)?;
                info!(
                    conn = session.handle.id(),
                    pid = ?identity.pid,
                    skill = ?identity.skill_id,
                    "Connection identified"
                );
                session.identity = Some(identity);
                Ok(json!({ "status": "identified" }))
            }

            "process.spawn" => {
                let p: SpawnParams = parse_params(params)?;
                let (Some(id), Some(command)) = (p.id, p.command) else {
                    return Err(DispatchError::MissingParams("id, command"));
                };
                if session.identity.is_none() && !self.trust_unidentified {
                    return Err(DispatchError::Unidentified);
                }
                let creator = session
                    .identity
                    .as_ref()
                    .and_then(|i| i.principal())
                    .map(str::to_string);
                self.processes
                    .spawn(&id, &command, p.options.unwrap_or_default(), creator)?;
                Ok(json!({ "status": "spawned", "id": id }))
            }

            "process.kill" => {
                let id = self.controlled_id(session, params)?;
                self.processes.kill(&id)?;
                Ok(json!({ "status": "killed", "id": id }))
            }

            "process.status" => {
                let id = self.controlled_id(session, params)?;
                let status = self.processes.get_status(&id);
                let mut result = serde_json::to_value(status)?;
                if let Some(map) = result.as_object_mut() {
                    map.insert("id".to_string(), Value::String(id));
                }
                Ok(result)
            }

            "process.pause" => {
                let id = self.controlled_id(session, params)?;
                let status = if self.processes.pause(&id) { "paused" } else { "failed" };
                Ok(json!({ "status": status, "id": id }))
            }

            "process.resume" => {
                let id = self.controlled_id(session, params)?;
                let status = if self.processes.resume(&id) { "resumed" } else { "failed" };
                Ok(json!({ "status": status, "id": id }))
            }

            "process.stdout.subscribe" => {
                let p: StreamSubscribeParams = parse_params(params)?;
                let pid = p.pid.ok_or(DispatchError::MissingParams("pid"))?;
                self.authorize(session, &pid)?;
                if self.processes.get_status(&pid).state == super::process::ProcessState::Unknown {
                    return Err(ProcessError::NotFound(pid).into());
                }
                let subscription_id = self.streams.subscribe(
                    &pid,
                    p.stream.unwrap_or_default(),
                    p.mode.unwrap_or_default(),
                    session.handle.clone(),
                    p.buffer_size,
                );
                Ok(json!({ "subscriptionId": subscription_id }))
            }

            "process.stdout.unsubscribe" => {
                let p: SubscriptionParams = parse_params(params)?;
                let id = p
                    .subscription_id
                    .ok_or(DispatchError::MissingParams("subscriptionId"))?;
                Ok(json!({ "success": self.streams.unsubscribe(&id, session.handle.id()) }))
            }

            "subscribe" => {
                let p: TopicParams = parse_params(params)?;
                let topic = p.topic.ok_or(DispatchError::MissingParams("topic"))?;
                let subscription_id = self.topics.subscribe(&topic, session.handle.clone())?;
                Ok(json!({ "subscriptionId": subscription_id }))
            }

            "unsubscribe" => {
                let p: SubscriptionParams = parse_params(params)?;
                let id = p
                    .subscription_id
                    .ok_or(DispatchError::MissingParams("subscriptionId"))?;
                Ok(json!({ "success": self.topics.unsubscribe(&id, session.handle.id()) }))
            }

            "device.list" => {
                let devices = self.devices.as_ref().map(|d| d.list()).unwrap_or_default();
                Ok(serde_json::to_value(devices)?)
            }

            "device.claim" => {
                let id = required_id(params)?;
                let owner = self.device_owner(session)?;
                self.devices()?.claim(&id, &owner).await?;
                Ok(json!({ "status": "claimed", "id": id }))
            }

            "device.release" => {
                let id = required_id(params)?;
                let owner = self.device_owner(session)?;
                self.devices()?.release(&id, &owner).await?;
                Ok(json!({ "status": "released", "id": id }))
            }

            "vault.get" => {
                let p: VaultParams = parse_params(params)?;
                let (Some(token), Some(handle)) = (p.token, p.handle) else {
                    return Err(DispatchError::MissingParams("token, handle"));
                };
                let vault = self.vault.as_ref().ok_or(DispatchError::Unavailable("Vault"))?;
                let value = vault
                    .resolve_with_token(&token, &handle)
                    .ok_or(DispatchError::VaultDenied)?;
                Ok(json!({ "value": value }))
            }

            "service.list" => Ok(serde_json::to_value(self.services()?.list_services())?),

            "service.status" => {
                let id = required_id(params)?;
                let status = self
                    .services()?
                    .get_service_status(&id)
                    .ok_or(ServiceError::NotFound(id))?;
                Ok(serde_json::to_value(status)?)
            }

            "service.start" => {
                let id = required_id(params)?;
                self.services()?.start_service(&id).await?;
                Ok(json!({ "status": "started", "id": id }))
            }

            "service.stop" => {
                let id = required_id(params)?;
                self.services()?.stop_service(&id).await?;
                Ok(json!({ "status": "stopped", "id": id }))
            }

            "service.restart" => {
                let id = required_id(params)?;
                self.services()?.restart_service(&id).await?;
                Ok(json!({ "status": "restarted", "id": id }))
            }

            _ => Err(DispatchError::UnknownMethod(method.to_string())),
        }
    }

    /// `params.id` of a process this connection may control
    fn controlled_id(&self, session: &Session, params: Option<rmpv::Value>) -> std::result::Result<String, DispatchError> {
        let id = required_id(params)?;
        self.authorize(session, &id)?;
        Ok(id)
    }

    fn devices(&self) -> std::result::Result<&Arc<dyn DeviceRegistry>, DispatchError> {
        self.devices
            .as_ref()
            .ok_or(DispatchError::Unavailable("Device registry"))
    }

    /// Claims are held by the identity's principal; an anonymous trusted
    /// connection claims under its connection id.
    fn device_owner(&self, session: &Session) -> std::result::Result<String, DispatchError> {
        match session.identity.as_ref().and_then(|i| i.principal()) {
            Some(principal) => Ok(principal.to_string()),
            None if self.trust_unidentified => Ok(format!("conn-{}", session.handle.id())),
            None => Err(DispatchError::Unidentified),
        }
    }

    fn services(&self) -> std::result::Result<&ServiceManager, DispatchError> {
        self.services
            .as_ref()
            .ok_or(DispatchError::Unavailable("Service manager"))
    }
}

fn required_id(params: Option<rmpv::Value>) -> std::result::Result<String, DispatchError> {
    parse_params::<IdParams>(params)?
        .id
        .ok_or(DispatchError::MissingParams("id"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::store::MemoryProcessStore;

    fn params(value: Value) -> Option<rmpv::Value> {
        Some(rmpv::ext::to_value(value).unwrap())
    }

    #[test]
    fn test_parse_params_defaults_when_absent() {
        let p: IdParams = parse_params(None).unwrap();
        assert!(p.id.is_none());
        let p: IdParams = parse_params(Some(rmpv::Value::Nil)).unwrap();
        assert!(p.id.is_none());
    }

    #[test]
    fn test_parse_stream_params() {
        let p: StreamSubscribeParams =
            parse_params(params(json!({"pid": "p1", "stream": "both", "mode": "line", "bufferSize": 64})))
                .unwrap();
        assert_eq!(p.pid.as_deref(), Some("p1"));
        assert_eq!(p.stream, Some(StreamSelector::Both));
        assert_eq!(p.mode, Some(StreamMode::Line));
        assert_eq!(p.buffer_size, Some(64));
    }

    #[test]
    fn test_stdin_data_text_or_bytes() {
        let p: StdinParams = parse_params(params(json!({"id": "p", "data": "hi\n"}))).unwrap();
        assert_eq!(p.data.unwrap().as_bytes(), b"hi\n");

        let raw = rmpv::Value::Map(vec![
            (rmpv::Value::from("id"), rmpv::Value::from("p")),
            (rmpv::Value::from("data"), rmpv::Value::Binary(vec![0, 1, 2])),
        ]);
        let p: StdinParams = parse_params(Some(raw)).unwrap();
        assert_eq!(p.data.unwrap().as_bytes(), &[0, 1, 2]);
    }

    #[test]
    fn test_loose_request_keeps_id_without_method() {
        let raw = rmpv::ext::to_value(json!({"id": "m1", "method": 7, "params": {}})).unwrap();
        let request: LooseRequest = rmpv::ext::from_value(raw).unwrap();
        assert_eq!(value_string(request.id).as_deref(), Some("m1"));
        assert!(value_string(request.method).is_none());

        let raw = rmpv::ext::to_value(json!({"params": {}})).unwrap();
        let request: LooseRequest = rmpv::ext::from_value(raw).unwrap();
        assert!(value_string(request.id).is_none());
    }

    #[test]
    fn test_invalid_params_are_reported() {
        let err = parse_params::<SpawnParams>(params(json!({"id": "x", "command": "not-a-list"})))
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidParams(_)));
    }

    #[test]
    fn test_dispatch_error_messages() {
        assert_eq!(
            DispatchError::UnknownMethod("foo.bar".into()).to_string(),
            "Unknown method: foo.bar"
        );
        assert_eq!(
            DispatchError::MissingParams("id, command").to_string(),
            "Missing params: id, command"
        );
    }

    #[tokio::test]
    async fn test_builder_defaults() {
        let server = KernelServer::builder(ProcessManager::new(Arc::new(MemoryProcessStore::new())))
            .socket_path("/tmp/kairo-test.sock")
            .build();
        assert_eq!(server.socket_path(), Path::new("/tmp/kairo-test.sock"));
        assert!(server.shared.trust_unidentified);
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_authorize_follows_identity() {
        let processes = ProcessManager::new(Arc::new(MemoryProcessStore::new()));
        processes
            .spawn("owned", &["sleep".to_string(), "5".to_string()], ProcessOptions::default(), Some("A".into()))
            .unwrap();
        let server = KernelServer::builder(processes.clone())
            .trust_unidentified(false)
            .build();
        let (handle, _rx) = ConnectionHandle::channel(1);
        let mut session = Session {
            handle,
            identity: None,
        };

        assert!(matches!(
            server.shared.authorize(&session, "owned"),
            Err(DispatchError::Unidentified)
        ));

        session.identity = Some(ConnectionIdentity {
            skill_id: Some("B".into()),
            ..Default::default()
        });
        assert!(matches!(
            server.shared.authorize(&session, "owned"),
            Err(DispatchError::NotOwner(_))
        ));

        session.identity = Some(ConnectionIdentity {
            skill_id: Some("A".into()),
            ..Default::default()
        });
        assert!(server.shared.authorize(&session, "owned").is_ok());
        processes.kill("owned").unwrap();
    }
}
