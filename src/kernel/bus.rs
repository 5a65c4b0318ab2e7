//! Event bus seam
//!
//! The kernel only publishes to and subscribes on the bus; the agent loop and
//! other producers live elsewhere. [`InMemoryBus`] is the in-process default.

use super::protocol::EventPayload;
use super::topic::{TopicError, TopicPattern};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    /// RFC 3339
    pub time: String,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

impl KernelEvent {
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source: source.into(),
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            data,
            correlation_id: None,
            causation_id: None,
            trace_id: None,
            span_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>, span_id: Option<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = span_id;
        self
    }

    /// EVENT frame body for topic subscribers
    pub fn to_payload(&self) -> EventPayload {
        EventPayload {
            topic: self.event_type.clone(),
            payload: self.data.clone(),
            correlation_id: self.correlation_id.clone(),
            causation_id: self.causation_id.clone(),
            trace_id: self.trace_id.clone(),
            source: self.source.clone(),
            time: self.time.clone(),
            id: self.id.clone(),
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&KernelEvent) + Send + Sync>;

pub type HandlerId = u64;

pub trait EventBus: Send + Sync {
    /// Deliver `event` to every matching handler. Returns the event id.
    fn publish(&self, event: KernelEvent) -> String;

    fn subscribe(&self, pattern: &str, handler: EventHandler) -> Result<HandlerId, TopicError>;

    fn unsubscribe(&self, id: HandlerId) -> bool;
}

/// Synchronous in-process bus. Handlers run on the publisher's thread.
#[derive(Default)]
pub struct InMemoryBus {
    handlers: Mutex<Vec<(HandlerId, TopicPattern, EventHandler)>>,
    next_id: AtomicU64,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl EventBus for InMemoryBus {
    fn publish(&self, event: KernelEvent) -> String {
        // Handlers may publish in turn, so call them outside the lock
        let matching: Vec<EventHandler> = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, pattern, _)| pattern.matches(&event.event_type))
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();

        trace!(topic = %event.event_type, handlers = matching.len(), "Publishing event");
        for handler in matching {
            handler(&event);
        }
        event.id
    }

    fn subscribe(&self, pattern: &str, handler: EventHandler) -> Result<HandlerId, TopicError> {
        let pattern = TopicPattern::compile(pattern)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, pattern, handler));
        Ok(id)
    }

    fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(hid, _, _)| *hid != id);
        handlers.len() != before
    }
}
