//! Per-source waiting line for requests that could not be dispatched at once.
//!
//! Ordering: strict priority, FIFO inside a priority tier. A waiter is woken
//! through its oneshot once a slot has been reserved for it, or rejected when
//! its deadline passes.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::ExtractError;

/// Maximum time a request may wait unserved.
pub const QUEUE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

/// Admission signal: `Ok(())` means a slot is reserved and the caller may run.
pub type Admit = Result<(), ExtractError>;

#[derive(Debug)]
pub struct QueuedRequest {
    pub id: Uuid,
    pub source: String,
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub deadline: Instant,
    pub notify: oneshot::Sender<Admit>,
}

impl QueuedRequest {
    /// Build a request and the receiver its caller waits on.
    pub fn new(
        source: &str,
        priority: Priority,
        now: Instant,
    ) -> (Self, oneshot::Receiver<Admit>) {
        let (tx, rx) = oneshot::channel();
        let req = Self {
            id: Uuid::new_v4(),
            source: source.to_string(),
            priority,
            enqueued_at: now,
            deadline: now + QUEUE_TTL,
            notify: tx,
        };
        (req, rx)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Reject the waiter with a queue timeout. A vanished waiter is ignored.
    pub fn reject_expired(self, now: Instant) {
        let waited = now.saturating_duration_since(self.enqueued_at);
        let _ = self.notify.send(Err(ExtractError::QueueTimeout {
            provider: self.source,
            waited,
        }));
    }
}

#[derive(Debug, Default)]
pub struct RequestQueue {
    items: VecDeque<QueuedRequest>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, req: QueuedRequest) {
        let idx = match req.priority {
            // behind other highs, ahead of everything else
            Priority::High => self
                .items
                .iter()
                .position(|r| r.priority != Priority::High)
                .unwrap_or(self.items.len()),
            Priority::Normal => self
                .items
                .iter()
                .position(|r| r.priority == Priority::Low)
                .unwrap_or(self.items.len()),
            Priority::Low => self.items.len(),
        };
        self.items.insert(idx, req);
    }

    pub fn dequeue_next(&mut self) -> Option<QueuedRequest> {
        self.items.pop_front()
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<QueuedRequest> {
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for req in self.items.drain(..) {
            if req.is_expired(now) {
                expired.push(req);
            } else {
                kept.push_back(req);
            }
        }
        self.items = kept;
        expired
    }

    pub fn remove(&mut self, id: Uuid) -> Option<QueuedRequest> {
        let idx = self.items.iter().position(|r| r.id == id)?;
        self.items.remove(idx)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn priorities(&self) -> Vec<Priority> {
        self.items.iter().map(|r| r.priority).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(q: &mut RequestQueue, p: Priority) -> Uuid {
        let (req, _rx) = QueuedRequest::new("test", p, Instant::now());
        let id = req.id;
        q.enqueue(req);
        id
    }

    #[test]
    fn priority_then_fifo_ordering() {
        use Priority::*;
        let mut q = RequestQueue::new();
        let low1 = push(&mut q, Low);
        let norm1 = push(&mut q, Normal);
        let high1 = push(&mut q, High);
        let norm2 = push(&mut q, Normal);
        let high2 = push(&mut q, High);
        let low2 = push(&mut q, Low);

        assert_eq!(q.priorities(), vec![High, High, Normal, Normal, Low, Low]);
        let order: Vec<Uuid> = std::iter::from_fn(|| q.dequeue_next().map(|r| r.id)).collect();
        assert_eq!(order, vec![high1, high2, norm1, norm2, low1, low2]);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_rejected_with_queue_timeout() {
        let mut q = RequestQueue::new();
        let (old, rx_old) = QueuedRequest::new("crawl", Priority::Normal, Instant::now());
        q.enqueue(old);
        tokio::time::advance(Duration::from_secs(60)).await;
        let (young, _rx_young) = QueuedRequest::new("crawl", Priority::Low, Instant::now());
        q.enqueue(young);

        tokio::time::advance(QUEUE_TTL - Duration::from_secs(60)).await;
        let now = Instant::now();
        let expired = q.purge_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(q.len(), 1);
        for r in expired {
            r.reject_expired(now);
        }
        let got = rx_old.await.unwrap();
        assert!(matches!(got, Err(ExtractError::QueueTimeout { .. })));
    }

    #[test]
    fn remove_by_id() {
        let mut q = RequestQueue::new();
        let a = push(&mut q, Priority::Normal);
        let _b = push(&mut q, Priority::Normal);
        assert!(q.remove(a).is_some());
        assert!(q.remove(a).is_none());
        assert_eq!(q.len(), 1);
    }
}
