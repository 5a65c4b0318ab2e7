use super::protocol::{self, PacketKind};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

pub type ConnectionId = u64;

/// Write side of one client connection.
///
/// Frames are encoded by the caller's task and queued to the connection's
/// writer task, so nothing holds a lock while the socket is written.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { id, tx }
    }

    /// Handle plus the receiver a writer task drains
    pub fn channel(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(id, tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Encode and queue one frame. Returns false once the connection is gone.
    pub fn send<T: Serialize + ?Sized>(&self, kind: PacketKind, payload: &T) -> bool {
        match protocol::encode(kind, payload) {
            Ok(frame) => self.tx.send(frame).is_ok(),
            Err(e) => {
                warn!(conn = self.id, "Failed to encode {} frame: {}", kind.as_str(), e);
                false
            }
        }
    }
}

/// Identity a client declares with `identify`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_token: Option<String>,
}

impl ConnectionIdentity {
    /// Creator id used for ownership checks: the skill id, else the runtime token
    pub fn principal(&self) -> Option<&str> {
        self.skill_id
            .as_deref()
            .or(self.runtime_token.as_deref())
    }
}
