//! Per-connection stdio subscriptions
//!
//! Each subscription belongs to one connection and one process. Chunk mode
//! forwards every read as-is through a bounded ring buffer; line mode
//! re-frames the bytes so each STREAM_CHUNK carries exactly one line.

use super::connection::{ConnectionHandle, ConnectionId};
use super::protocol::{NoticePayload, PacketKind, StdStream, StreamChunkPayload};
use super::ring_buffer::{RingBuffer, DEFAULT_CAPACITY};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

pub const OVERFLOW_TOPIC: &str = "stream.overflow";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSelector {
    #[default]
    Stdout,
    Stderr,
    Both,
}

impl StreamSelector {
    pub fn matches(&self, stream: StdStream) -> bool {
        match self {
            StreamSelector::Both => true,
            StreamSelector::Stdout => stream == StdStream::Stdout,
            StreamSelector::Stderr => stream == StdStream::Stderr,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    #[default]
    Chunk,
    Line,
}

struct StreamSubscription {
    id: String,
    process_id: String,
    selector: StreamSelector,
    mode: StreamMode,
    connection: ConnectionHandle,
    ring: RingBuffer,
    /// Pending partial lines, one per stream so stdout and stderr never mix
    partial: [Vec<u8>; 2],
    sequence: u64,
}

impl StreamSubscription {
    fn send_chunk(&mut self, stream: StdStream, data: Vec<u8>) {
        self.sequence += 1;
        let chunk = StreamChunkPayload {
            subscription_id: self.id.clone(),
            stream,
            data: ByteBuf::from(data),
            sequence: self.sequence,
        };
        if !self.connection.send(PacketKind::StreamChunk, &chunk) {
            trace!(subscription = %self.id, "Connection gone, chunk dropped");
        }
    }

    fn push_chunk(&mut self, stream: StdStream, data: &Bytes) {
        if self.ring.push(data.clone()) {
            debug!(subscription = %self.id, process = %self.process_id, "Stream buffer overflow");
            let notice = NoticePayload {
                topic: OVERFLOW_TOPIC.to_string(),
                data: serde_json::json!({
                    "subscriptionId": self.id,
                    "processId": self.process_id,
                }),
            };
            self.connection.send(PacketKind::Event, &notice);
        }
        self.send_chunk(stream, data.to_vec());
    }

    fn push_lines(&mut self, stream: StdStream, data: &[u8]) {
        let slot = match stream {
            StdStream::Stdout => 0,
            StdStream::Stderr => 1,
        };
        let mut pending = std::mem::take(&mut self.partial[slot]);
        pending.extend_from_slice(data);

        let mut start = 0;
        while let Some(offset) = pending[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset + 1;
            self.send_chunk(stream, pending[start..end].to_vec());
            start = end;
        }
        pending.drain(..start);

        // A line that never ends must not grow without bound
        if pending.len() > self.ring.capacity() {
            debug!(subscription = %self.id, "Flushing {} byte partial line", pending.len());
            self.send_chunk(stream, std::mem::take(&mut pending));
        }
        self.partial[slot] = pending;
    }
}

#[derive(Default)]
struct Registry {
    subscriptions: HashMap<String, StreamSubscription>,
    by_process: HashMap<String, HashSet<String>>,
    by_connection: HashMap<ConnectionId, HashSet<String>>,
}

impl Registry {
    fn remove(&mut self, id: &str) -> bool {
        let Some(sub) = self.subscriptions.remove(id) else {
            return false;
        };
        if let Some(ids) = self.by_process.get_mut(&sub.process_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_process.remove(&sub.process_id);
            }
        }
        let conn = sub.connection.id();
        if let Some(ids) = self.by_connection.get_mut(&conn) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_connection.remove(&conn);
            }
        }
        true
    }
}

/// Routes process output to the connections that asked for it
pub struct StreamSubscriptionManager {
    registry: Mutex<Registry>,
    default_buffer_size: usize,
}

impl StreamSubscriptionManager {
    pub fn new() -> Self {
        Self::with_default_buffer_size(DEFAULT_CAPACITY)
    }

    pub fn with_default_buffer_size(default_buffer_size: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            default_buffer_size,
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(
        &self,
        process_id: &str,
        selector: StreamSelector,
        mode: StreamMode,
        connection: ConnectionHandle,
        buffer_size: Option<usize>,
    ) -> String {
        let id = format!("stream_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let capacity = buffer_size
            .filter(|&size| size > 0)
            .unwrap_or(self.default_buffer_size);
        let conn = connection.id();

        let mut registry = self.registry();
        registry.subscriptions.insert(
            id.clone(),
            StreamSubscription {
                id: id.clone(),
                process_id: process_id.to_string(),
                selector,
                mode,
                connection,
                ring: RingBuffer::new(capacity),
                partial: [Vec::new(), Vec::new()],
                sequence: 0,
            },
        );
        registry
            .by_process
            .entry(process_id.to_string())
            .or_default()
            .insert(id.clone());
        registry.by_connection.entry(conn).or_default().insert(id.clone());

        debug!(subscription = %id, process = %process_id, conn, "Stream subscription added");
        id
    }

    /// Remove a subscription owned by `conn`. Other connections' ids are
    /// left untouched.
    pub fn unsubscribe(&self, id: &str, conn: ConnectionId) -> bool {
        let mut registry = self.registry();
        if !registry
            .subscriptions
            .get(id)
            .is_some_and(|sub| sub.connection.id() == conn)
        {
            return false;
        }
        registry.remove(id)
    }

    /// Deliver one read of `stream` from `process_id` to matching subscribers
    pub fn push(&self, process_id: &str, stream: StdStream, data: &Bytes) {
        let mut registry = self.registry();
        let Some(ids) = registry.by_process.get(process_id) else {
            return;
        };
        let ids: Vec<String> = ids.iter().cloned().collect();

        for id in ids {
            let Some(sub) = registry.subscriptions.get_mut(&id) else {
                continue;
            };
            if !sub.selector.matches(stream) {
                continue;
            }
            match sub.mode {
                StreamMode::Chunk => sub.push_chunk(stream, data),
                StreamMode::Line => sub.push_lines(stream, data),
            }
        }
    }

    pub fn remove_by_connection(&self, conn: ConnectionId) -> usize {
        let mut registry = self.registry();
        let ids: Vec<String> = registry
            .by_connection
            .get(&conn)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter().filter(|id| registry.remove(id)).count()
    }

    pub fn remove_by_process(&self, process_id: &str) -> usize {
        let mut registry = self.registry();
        let ids: Vec<String> = registry
            .by_process
            .get(process_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter().filter(|id| registry.remove(id)).count()
    }

    pub fn len(&self) -> usize {
        self.registry().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently held in a subscription's ring buffer
    pub fn buffered(&self, id: &str) -> Option<usize> {
        self.registry().subscriptions.get(id).map(|s| s.ring.size())
    }
}

impl Default for StreamSubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}
