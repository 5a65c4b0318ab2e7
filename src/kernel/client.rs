//! Client side of the kernel socket
//!
//! Requests are correlated with responses by id; EVENT and STREAM_CHUNK
//! frames go to whoever called [`KernelClient::listen`].

use super::connection::ConnectionIdentity;
use super::fanout::Fanout;
use super::process::{ProcessOptions, ProcessStatus};
use super::protocol::{
    self, FrameBuffer, Packet, PacketKind, ProtocolError, RequestPayload, ResponsePayload,
    StreamChunkPayload,
};
use super::stream_subscription::{StreamMode, StreamSelector};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Request {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("Connection closed")]
    Closed,

    #[error("{0}")]
    Remote(String),

    #[error("Unexpected response: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Unsolicited frames pushed by the kernel
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// EVENT body: a topic event or a kernel notice such as `process.exit`
    Event(Value),
    StreamChunk(StreamChunkPayload),
}

impl Inbound {
    /// Topic of an event frame
    pub fn topic(&self) -> Option<&str> {
        match self {
            Inbound::Event(body) => body.get("topic").and_then(Value::as_str),
            Inbound::StreamChunk(_) => None,
        }
    }
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<ResponsePayload>>>>;

fn lock_pending(pending: &Pending) -> MutexGuard<'_, HashMap<String, oneshot::Sender<ResponsePayload>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Serialize)]
struct StdinWrite<'a> {
    id: &'a str,
    data: &'a Bytes,
}

pub struct KernelClient {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    pending: Pending,
    inbound: Arc<Fanout<Inbound>>,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl KernelClient {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| ClientError::Connect {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Connected to kernel at {}", path.display());

        let (mut read_half, mut write_half) = stream.into_split();
        let (outgoing, mut queue) = mpsc::unbounded_channel::<Vec<u8>>();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let inbound = Arc::new(Fanout::new());
        let closed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                if let Err(e) = write_half.write_all(&frame).await {
                    debug!("Kernel socket write failed: {}", e);
                    break;
                }
            }
        });

        let reader = {
            let pending = Arc::clone(&pending);
            let inbound = Arc::clone(&inbound);
            let closed = Arc::clone(&closed);
            tokio::spawn(async move {
                let mut frames = FrameBuffer::new();
                let mut buf = vec![0u8; 64 * 1024];
                'read: loop {
                    match read_half.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => frames.extend(&buf[..n]),
                        Err(e) => {
                            debug!("Kernel socket read failed: {}", e);
                            break;
                        }
                    }
                    loop {
                        match frames.next_packet() {
                            Ok(Some(packet)) => route(packet, &pending, &inbound),
                            Ok(None) => break,
                            Err(e) => {
                                warn!("Protocol error from kernel: {}", e);
                                break 'read;
                            }
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                // Dropping the senders fails every outstanding request
                lock_pending(&pending).clear();
                debug!("Kernel connection closed");
            })
        };

        Ok(Self {
            outgoing,
            pending,
            inbound,
            closed,
            next_id: AtomicU64::new(0),
            timeout: DEFAULT_TIMEOUT,
            reader,
            writer,
        })
    }

    /// Per-request timeout (default 5 s)
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Receive EVENT and STREAM_CHUNK frames arriving from now on
    pub fn listen(&self) -> mpsc::UnboundedReceiver<Inbound> {
        self.inbound.subscribe()
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.call(method, &params).await
    }

    pub async fn request_as<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let result = self.request(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send one REQUEST and wait for its RESPONSE
    async fn call<P: Serialize + ?Sized>(&self, method: &str, params: &P) -> Result<Value> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let id = format!("req-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let frame = protocol::encode(
            PacketKind::Request,
            &RequestPayload {
                id: id.clone(),
                method: method.to_string(),
                params: Some(params),
            },
        )?;

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id.clone(), tx);
        if self.is_closed() || self.outgoing.send(frame).is_err() {
            lock_pending(&self.pending).remove(&id);
            return Err(ClientError::Closed);
        }
        trace!(id = %id, "Sent request {}", method);

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(ClientError::Closed),
            Err(_) => {
                lock_pending(&self.pending).remove(&id);
                return Err(ClientError::Timeout {
                    method: method.to_string(),
                    timeout: self.timeout,
                });
            }
        };

        match response.error {
            Some(message) => Err(ClientError::Remote(message)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    pub async fn identify(&self, identity: &ConnectionIdentity) -> Result<()> {
        self.call("identify", identity).await.map(|_| ())
    }

    pub async fn spawn(&self, id: &str, command: &[&str], options: ProcessOptions) -> Result<()> {
        self.request(
            "process.spawn",
            json!({ "id": id, "command": command, "options": options }),
        )
        .await
        .map(|_| ())
    }

    pub async fn kill(&self, id: &str) -> Result<()> {
        self.request("process.kill", json!({ "id": id }))
            .await
            .map(|_| ())
    }

    pub async fn status(&self, id: &str) -> Result<ProcessStatus> {
        self.request_as("process.status", json!({ "id": id })).await
    }

    /// Exit code once the process ends. Subject to the request timeout.
    pub async fn wait(&self, id: &str) -> Result<Option<i32>> {
        let result = self.request("process.wait", json!({ "id": id })).await?;
        Ok(result
            .get("exitCode")
            .and_then(Value::as_i64)
            .map(|code| code as i32))
    }

    /// Raw bytes go out as MessagePack binary
    pub async fn write_stdin(&self, id: &str, data: &[u8]) -> Result<()> {
        self.call(
            "process.stdin.write",
            &StdinWrite {
                id,
                data: Bytes::new(data),
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn subscribe_stream(
        &self,
        pid: &str,
        stream: StreamSelector,
        mode: StreamMode,
        buffer_size: Option<usize>,
    ) -> Result<String> {
        let mut params = json!({ "pid": pid, "stream": stream, "mode": mode });
        if let Some(size) = buffer_size {
            params["bufferSize"] = json!(size);
        }
        let result = self.request("process.stdout.subscribe", params).await?;
        subscription_id(result)
    }

    pub async fn subscribe_topic(&self, topic: &str) -> Result<String> {
        let result = self.request("subscribe", json!({ "topic": topic })).await?;
        subscription_id(result)
    }
}

impl Drop for KernelClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn subscription_id(result: Value) -> Result<String> {
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Subscribed {
        subscription_id: String,
    }
    Ok(serde_json::from_value::<Subscribed>(result)?.subscription_id)
}

fn route(packet: Packet, pending: &Pending, inbound: &Fanout<Inbound>) {
    match packet.kind {
        PacketKind::Response => match packet.into_payload::<ResponsePayload>() {
            Ok(response) => match lock_pending(pending).remove(&response.id) {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => trace!(id = %response.id, "Response for unknown or expired request"),
            },
            Err(e) => warn!("Malformed response: {}", e),
        },
        PacketKind::Event => match packet.into_payload::<Value>() {
            Ok(body) => inbound.emit(Inbound::Event(body)),
            Err(e) => warn!("Malformed event: {}", e),
        },
        PacketKind::StreamChunk => match packet.into_payload::<StreamChunkPayload>() {
            Ok(chunk) => inbound.emit(Inbound::StreamChunk(chunk)),
            Err(e) => warn!("Malformed stream chunk: {}", e),
        },
        PacketKind::Request => trace!("Ignoring request frame from kernel"),
    }
}
