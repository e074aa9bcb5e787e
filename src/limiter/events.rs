//! Typed limiter notifications for alerting and tests.

use serde::Serialize;
use tokio::sync::broadcast;

use super::queue::Priority;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LimiterEvent {
    CircuitOpened {
        source: String,
        consecutive_failures: u32,
    },
    CircuitHalfOpen {
        source: String,
    },
    CircuitClosed {
        source: String,
    },
    EmergencyStop {
        spent: f64,
        limit: f64,
    },
    RequestQueued {
        source: String,
        priority: Priority,
        queue_length: usize,
    },
    QueueTimeout {
        source: String,
    },
}

/// Fan-out of limiter events. Sending never blocks and never fails the caller.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LimiterEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, ev: LimiterEvent) {
        // No subscribers is the normal case outside alerting/tests.
        let _ = self.tx.send(ev);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LimiterEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
