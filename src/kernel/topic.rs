//! Dot-delimited topic patterns and per-connection topic subscriptions
//!
//! `*` matches exactly one segment and `>` matches one or more trailing
//! segments. Both are only wildcards when they make up a whole segment.

use super::bus::KernelEvent;
use super::connection::{ConnectionHandle, ConnectionId};
use super::protocol::{EventPayload, PacketKind};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("Empty topic pattern")]
    Empty,

    #[error("Empty segment in topic pattern '{0}'")]
    EmptySegment(String),

    #[error("'>' must be the last segment of topic pattern '{0}'")]
    TailNotLast(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    One,
    Tail,
}

/// Compiled topic pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    source: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn compile(pattern: &str) -> Result<Self, TopicError> {
        if pattern.is_empty() {
            return Err(TopicError::Empty);
        }

        let parts: Vec<&str> = pattern.split('.').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.into_iter().enumerate() {
            let segment = match part {
                "" => return Err(TopicError::EmptySegment(pattern.to_string())),
                "*" => Segment::One,
                ">" if i == last => Segment::Tail,
                ">" => return Err(TopicError::TailNotLast(pattern.to_string())),
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            source: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut parts = topic.split('.');
        for segment in &self.segments {
            match segment {
                Segment::Tail => return parts.next().is_some_and(|p| !p.is_empty()),
                Segment::One => match parts.next() {
                    Some(p) if !p.is_empty() => {}
                    _ => return false,
                },
                Segment::Literal(lit) => {
                    if parts.next() != Some(lit.as_str()) {
                        return false;
                    }
                }
            }
        }
        parts.next().is_none()
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

struct TopicSubscription {
    pattern: TopicPattern,
    connection: ConnectionHandle,
}

#[derive(Default)]
struct Registry {
    subscriptions: HashMap<String, TopicSubscription>,
    by_connection: HashMap<ConnectionId, HashSet<String>>,
}

/// Forwards bus events to connections whose patterns match
#[derive(Default)]
pub struct TopicSubscriptionManager {
    registry: Mutex<Registry>,
}

impl TopicSubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, topic: &str, connection: ConnectionHandle) -> Result<String, TopicError> {
        let pattern = TopicPattern::compile(topic)?;
        let id = format!("topic_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let conn = connection.id();

        let mut registry = self.registry();
        registry
            .subscriptions
            .insert(id.clone(), TopicSubscription { pattern, connection });
        registry.by_connection.entry(conn).or_default().insert(id.clone());

        debug!(subscription = %id, conn, "Subscribed to topic {}", topic);
        Ok(id)
    }

    /// Remove a subscription owned by `conn`
    pub fn unsubscribe(&self, id: &str, conn: ConnectionId) -> bool {
        let mut registry = self.registry();
        if !registry
            .subscriptions
            .get(id)
            .is_some_and(|sub| sub.connection.id() == conn)
        {
            return false;
        }
        registry.subscriptions.remove(id);
        if let Some(ids) = registry.by_connection.get_mut(&conn) {
            ids.remove(id);
            if ids.is_empty() {
                registry.by_connection.remove(&conn);
            }
        }
        true
    }

    /// Send `event` to every matching subscription. Returns frames queued.
    pub fn dispatch(&self, event: &KernelEvent) -> usize {
        let registry = self.registry();
        let mut payload: Option<EventPayload> = None;
        let mut sent = 0;

        for sub in registry.subscriptions.values() {
            if !sub.pattern.matches(&event.event_type) {
                continue;
            }
            let payload = payload.get_or_insert_with(|| event.to_payload());
            if sub.connection.send(PacketKind::Event, &*payload) {
                sent += 1;
            }
        }

        trace!(topic = %event.event_type, sent, "Dispatched bus event");
        sent
    }

    pub fn remove_by_connection(&self, conn: ConnectionId) -> usize {
        let mut registry = self.registry();
        let Some(ids) = registry.by_connection.remove(&conn) else {
            return 0;
        };
        for id in &ids {
            registry.subscriptions.remove(id);
        }
        ids.len()
    }

    pub fn len(&self) -> usize {
        self.registry().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
