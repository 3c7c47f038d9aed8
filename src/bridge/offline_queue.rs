//! Buffering for transport outages.
//!
//! Notification-worthy events are queued while the remote transport is down
//! and flushed in priority-then-age order once it comes back. Buffering is
//! strictly best-effort delivery plumbing: decisions never wait on it (the
//! permission timeout covers an unreachable operator).

use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Types of events that can be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedEventType {
    PermissionRequest,
    PhaseNotification,
    StatusMessage,
    GenericMessage,
}

/// An event held back during a disconnection.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub event_type: QueuedEventType,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    /// Higher is more important.
    pub priority: u8,
}

impl QueuedEvent {
    pub fn new(event_type: QueuedEventType, body: impl Into<String>, priority: u8) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            body: body.into(),
            priority,
        }
    }
}

/// Bounded FIFO of undelivered events, oldest dropped on overflow.
pub struct OfflineQueue {
    queue: tokio::sync::Mutex<Vec<QueuedEvent>>,
    max_size: usize,
    max_age: TimeDelta,
    is_offline: AtomicBool,
    offline_since: Mutex<Option<DateTime<Utc>>>,
}

impl OfflineQueue {
    pub fn new(max_size: usize, max_age_seconds: i64) -> Self {
        Self {
            queue: tokio::sync::Mutex::new(Vec::new()),
            max_size,
            max_age: TimeDelta::seconds(max_age_seconds),
            is_offline: AtomicBool::new(false),
            offline_since: Mutex::new(None),
        }
    }

    pub async fn enqueue(&self, event: QueuedEvent) {
        let mut queue = self.queue.lock().await;
        prune_old(&mut queue, self.max_age);

        if queue.len() >= self.max_size {
            tracing::warn!("offline queue full, dropping oldest event");
            queue.remove(0);
        }
        queue.push(event);
    }

    /// Deliver every queued event through `handler`, most important and
    /// oldest first. Events the handler reports as failed stay queued for
    /// the next flush. Returns the number delivered.
    pub async fn flush<F, Fut>(&self, mut handler: F) -> usize
    where
        F: FnMut(QueuedEvent) -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut queue = self.queue.lock().await;
        prune_old(&mut queue, self.max_age);
        if queue.is_empty() {
            return 0;
        }

        let mut events = std::mem::take(&mut *queue);
        events.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.timestamp.cmp(&b.timestamp))
        });

        let mut processed = 0;
        let mut remaining = Vec::new();
        for event in events {
            if handler(event.clone()).await {
                processed += 1;
            } else {
                remaining.push(event);
            }
        }

        *queue = remaining;
        tracing::info!(processed, "flushed offline queue");
        processed
    }

    pub fn set_offline(&self) {
        if !self.is_offline.swap(true, Ordering::SeqCst) {
            *lock_since(&self.offline_since) = Some(Utc::now());
            tracing::info!("transport marked offline");
        }
    }

    pub fn set_online(&self) {
        if self.is_offline.swap(false, Ordering::SeqCst) {
            let since = lock_since(&self.offline_since).take();
            let duration = since.map(|s| Utc::now().signed_duration_since(s).num_seconds());
            tracing::info!(offline_seconds = ?duration, "transport marked online");
        }
    }

    pub fn is_offline(&self) -> bool {
        self.is_offline.load(Ordering::SeqCst)
    }

    pub async fn queue_size(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub fn offline_duration_seconds(&self) -> Option<f64> {
        if !self.is_offline() {
            return None;
        }
        lock_since(&self.offline_since)
            .map(|since| Utc::now().signed_duration_since(since).num_milliseconds() as f64 / 1000.0)
    }
}

fn prune_old(queue: &mut Vec<QueuedEvent>, max_age: TimeDelta) {
    let now = Utc::now();
    let before = queue.len();
    queue.retain(|e| now.signed_duration_since(e.timestamp) < max_age);
    let pruned = before - queue.len();
    if pruned > 0 {
        tracing::info!(pruned, "dropped expired events from offline queue");
    }
}

fn lock_since(
    since: &Mutex<Option<DateTime<Utc>>>,
) -> std::sync::MutexGuard<'_, Option<DateTime<Utc>>> {
    since.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
