//! Pending permission requests and their resolution races.
//!
//! Every `add()` suspends its caller on a oneshot channel while a timeout
//! timer races the external `respond()` path. The pending-table lock is the
//! single arbiter: whichever side removes the entry owns the resolution, so
//! a request can never resolve twice and a response arriving a tick before
//! the timer always wins.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::agent::{ActionKind, RiskLevel};

/// What to do when nobody answers in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
    Approve,
    #[default]
    Deny,
}

/// A pending permission request.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub id: String,
    pub action: ActionKind,
    pub target: String,
    pub context: String,
    pub risk: RiskLevel,
    pub created_at: DateTime<Utc>,
    /// Correlation handle for the transport message carrying this request.
    pub message_handle: Option<String>,
}

impl PermissionRequest {
    pub fn new(
        action: ActionKind,
        target: impl Into<String>,
        context: impl Into<String>,
        risk: RiskLevel,
    ) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            id,
            action,
            target: target.into(),
            context: context.into(),
            risk,
            created_at: Utc::now(),
            message_handle: None,
        }
    }
}

/// Response to a permission request. Produced exactly once per request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionResponse {
    pub request_id: String,
    pub approved: bool,
    /// Operator identity; 0 is the system itself.
    pub responded_by: u64,
    pub responded_at: DateTime<Utc>,
    pub auto_approved: bool,
    pub policy_name: Option<String>,
}

impl PermissionResponse {
    pub fn manual(request_id: impl Into<String>, approved: bool, responded_by: u64) -> Self {
        Self {
            request_id: request_id.into(),
            approved,
            responded_by,
            responded_at: Utc::now(),
            auto_approved: false,
            policy_name: None,
        }
    }

    pub fn auto(request_id: impl Into<String>, approved: bool, policy_name: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            approved,
            responded_by: 0,
            responded_at: Utc::now(),
            auto_approved: true,
            policy_name: Some(policy_name.into()),
        }
    }

    fn timed_out(request_id: &str, approved: bool) -> Self {
        Self::auto(request_id, approved, "timeout")
    }

    fn cancelled(request_id: &str) -> Self {
        Self::auto(request_id, false, "cancelled")
    }
}

struct PendingEntry {
    request: PermissionRequest,
    tx: oneshot::Sender<PermissionResponse>,
}

/// Manages pending permission requests with timeout support.
///
/// Pure coordination: no audit or transport side effects, so it is testable
/// in isolation. Many requests can be pending concurrently; each carries its
/// own timer and suspends only its own caller.
pub struct PermissionQueue {
    pending: Mutex<HashMap<String, PendingEntry>>,
    timeout: Duration,
    default_action: DefaultAction,
}

impl PermissionQueue {
    pub fn new(timeout: Duration, default_action: DefaultAction) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
            default_action,
        }
    }

    /// Register a request and wait for its resolution.
    ///
    /// Returns when an external [`respond`](Self::respond) call resolves the
    /// request or the timeout fires, whichever comes first — exactly one of
    /// the two. The timeout synthesizes the configured default action with
    /// `responded_by = 0` and `policy_name = "timeout"`.
    pub async fn add(&self, request: PermissionRequest) -> PermissionResponse {
        let id = request.id.clone();
        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.lock_pending();
            pending.insert(id.clone(), PendingEntry { request, tx });
        }

        let sleep = tokio::time::sleep(self.timeout);
        tokio::pin!(sleep);

        tokio::select! {
            res = &mut rx => match res {
                Ok(response) => response,
                // Sender dropped without a value: only possible through a
                // drained table, treat as cancellation.
                Err(_) => PermissionResponse::cancelled(&id),
            },
            () = &mut sleep => {
                let taken = self.lock_pending().remove(&id);
                if taken.is_some() {
                    let approved = self.default_action == DefaultAction::Approve;
                    PermissionResponse::timed_out(&id, approved)
                } else {
                    // respond() claimed the entry just before the timer; the
                    // real response is in flight and wins.
                    match rx.await {
                        Ok(response) => response,
                        Err(_) => PermissionResponse::cancelled(&id),
                    }
                }
            }
        }
    }

    /// Submit a response for a pending request.
    ///
    /// Returns true iff this call resolved the request. Unknown ids and
    /// double responses return false with no state changed.
    pub fn respond(&self, response: PermissionResponse) -> bool {
        let entry = self.lock_pending().remove(&response.request_id);
        match entry {
            Some(entry) => {
                let id = response.request_id.clone();
                if entry.tx.send(response).is_ok() {
                    true
                } else {
                    tracing::warn!(request_id = %id, "pending waiter vanished before delivery");
                    false
                }
            }
            None => false,
        }
    }

    /// Resolve every pending request as cancelled. Returns how many were
    /// cancelled. Used at shutdown so no `add()` caller can hang.
    pub fn cancel_all(&self) -> usize {
        let entries: Vec<PendingEntry> = {
            let mut pending = self.lock_pending();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        let count = entries.len();
        for entry in entries {
            let response = PermissionResponse::cancelled(&entry.request.id);
            let _ = entry.tx.send(response);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn get_pending(&self, request_id: &str) -> Option<PermissionRequest> {
        self.lock_pending()
            .get(request_id)
            .map(|entry| entry.request.clone())
    }

    pub fn all_pending(&self) -> Vec<PermissionRequest> {
        self.lock_pending()
            .values()
            .map(|entry| entry.request.clone())
            .collect()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
