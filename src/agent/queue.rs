//! In-memory priority queue of pending corrective actions.
//!
//! The queue lives only in the agent process and is lost on restart; actions
//! that exhaust their retries go to a dead-letter sink instead of vanishing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use flowboard_common::{ActionKind, ActionPayload, ActionRequest};

/// Workload overload: move work off a person first.
pub const PRIORITY_WORKLOAD: u8 = 1;
/// WIP and bottleneck adjustments.
pub const PRIORITY_STRUCTURAL: u8 = 2;
/// Deadline reassignment.
pub const PRIORITY_DEADLINE: u8 = 3;

/// Attempts an action gets before it is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    pub id: Uuid,
    pub board_id: Uuid,
    /// 1 is most urgent.
    pub priority: u8,
    pub payload: ActionPayload,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// What happened to an action after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Retry {
    Again(PendingAction),
    Exhausted(PendingAction),
}

impl PendingAction {
    pub fn new(board_id: Uuid, priority: u8, payload: ActionPayload, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            board_id,
            priority,
            payload,
            created_at: now,
            retry_count: 0,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }

    /// The request body sent to the board service.
    pub fn request(&self) -> serde_json::Result<ActionRequest> {
        ActionRequest::new(self.board_id, &self.payload)
    }

    /// Count a failed attempt. The action goes back on the queue while it
    /// has attempts left.
    pub fn fail(mut self, max_retries: u32) -> Retry {
        self.retry_count += 1;
        if self.retry_count < max_retries {
            Retry::Again(self)
        } else {
            Retry::Exhausted(self)
        }
    }

    pub fn view(&self) -> PendingActionView {
        PendingActionView {
            id: self.id,
            kind: self.kind(),
            board_id: self.board_id,
            priority: self.priority,
            data: self.payload.to_data().unwrap_or(Value::Null),
            created_at: self.created_at,
            retry_count: self.retry_count,
        }
    }
}

/// JSON shape of a queued action on the agent's HTTP surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingActionView {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub board_id: Uuid,
    pub priority: u8,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

#[derive(Debug, Default)]
pub struct ActionQueue {
    actions: Mutex<Vec<PendingAction>>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, action: PendingAction) {
        tracing::info!(
            action_id = %action.id,
            action_type = %action.kind(),
            board_id = %action.board_id,
            priority = action.priority,
            "action queued"
        );
        self.actions.lock().await.push(action);
    }

    pub async fn len(&self) -> usize {
        self.actions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.actions.lock().await.is_empty()
    }

    /// Queued actions in execution order, without removing them.
    pub async fn snapshot(&self) -> Vec<PendingAction> {
        let mut actions = self.actions.lock().await.clone();
        sort_for_execution(&mut actions);
        actions
    }

    /// Remove everything queued so far, most urgent first. Actions queued
    /// while the batch runs wait for the next one.
    pub async fn take_batch(&self) -> Vec<PendingAction> {
        let mut batch = std::mem::take(&mut *self.actions.lock().await);
        sort_for_execution(&mut batch);
        batch
    }
}

/// Ascending priority number, oldest first within a priority.
///
/// Priority 1 (workload overload) is the most urgent and runs first. Sorting
/// by descending number instead would put deadline reassignments (3) ahead
/// of overload relief.
fn sort_for_execution(actions: &mut [PendingAction]) {
    actions.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.created_at.cmp(&b.created_at))
    });
}
