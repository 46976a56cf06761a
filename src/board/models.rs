use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub id: Uuid,
    pub board_id: Uuid,
    pub name: String,
    pub position: i64,
    /// Soft limit; 0 means unlimited
    pub wip_limit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub board_id: Uuid,
    pub column_id: Uuid,
    pub title: String,
    pub position: i64,
    pub story_points: i64,
    pub assignee_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.is_completed() && self.due_date.is_some_and(|due| due < now)
    }
}

/// Input for task creation.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub board_id: Uuid,
    pub column_id: Uuid,
    pub title: String,
    pub story_points: i64,
    pub assignee_id: Option<Uuid>,
    pub due_date: Option<DateTime<Utc>>,
}

/// Result of a positional move: the task as placed plus where it came from.
#[derive(Debug, Clone)]
pub struct TaskMove {
    pub task: Task,
    pub old_column_id: Uuid,
    pub old_position: i64,
}

/// Per (board, ISO week) metrics row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VelocityMetric {
    pub board_id: Uuid,
    pub iso_year: i32,
    pub sprint_week: u32,
    pub week_start: DateTime<Utc>,
    pub velocity: f64,
    pub completed: i64,
    pub total_points: i64,
    pub cycle_time: f64,
    pub throughput: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Completed,
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid action status: {}", s)),
        }
    }
}

/// A corrective action executed against the board.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentActionRecord {
    pub id: Uuid,
    pub board_id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub data: Value,
    pub status: ActionStatus,
    pub result: Value,
    pub executed_at: DateTime<Utc>,
}

/// A message or action that was given up on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: Uuid,
    pub source: String,
    pub payload: Value,
    pub reason: String,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
}

/// Filters for listing a board's events.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub kind: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl EventQuery {
    pub const DEFAULT_LIMIT: i64 = 100;
    pub const MAX_LIMIT: i64 = 1000;

    /// Clamp caller-supplied paging into the allowed range.
    pub fn new(
        kind: Option<String>,
        since: Option<DateTime<Utc>>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Self {
        let limit = match limit {
            Some(l) if l > 0 => l.min(Self::MAX_LIMIT),
            _ => Self::DEFAULT_LIMIT,
        };
        Self {
            kind,
            since,
            limit,
            offset: offset.unwrap_or(0).max(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_action_status_round_trip() {
        for status in [ActionStatus::Completed, ActionStatus::Failed] {
            assert_eq!(ActionStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(ActionStatus::from_str("pending").is_err());
    }

    #[test]
    fn test_event_query_paging_bounds() {
        let q = EventQuery::new(None, None, None, None);
        assert_eq!(q.limit, 100);
        assert_eq!(q.offset, 0);

        let q = EventQuery::new(None, None, Some(5000), Some(-3));
        assert_eq!(q.limit, 1000);
        assert_eq!(q.offset, 0);

        let q = EventQuery::new(None, None, Some(0), Some(20));
        assert_eq!(q.limit, 100);
        assert_eq!(q.offset, 20);
    }

    #[test]
    fn test_task_overdue() {
        let now = Utc::now();
        let mut task = Task {
            id: Uuid::new_v4(),
            board_id: Uuid::new_v4(),
            column_id: Uuid::new_v4(),
            title: "late".into(),
            position: 0,
            story_points: 1,
            assignee_id: None,
            created_at: now - Duration::days(3),
            completed_at: None,
            due_date: Some(now - Duration::days(1)),
        };
        assert!(task.is_overdue(now));
        task.completed_at = Some(now);
        assert!(!task.is_overdue(now));
    }
}
