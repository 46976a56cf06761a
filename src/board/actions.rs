//! Board-side execution of the agent's corrective actions.

use std::collections::BTreeSet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

use flowboard_common::ActionPayload;
use flowboard_common::action::{AdjustWipLimits, EnforceWipLimits, ReassignOverdue, RedistributeTasks};

use super::db::BoardDb;
use super::models::Column;
use crate::errors::BoardError;

/// What an executed action changed.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub result: Value,
    /// Set when the action changed a column, so callers can announce it.
    pub updated_column: Option<Column>,
}

impl ActionOutcome {
    fn result(result: Value) -> Self {
        Self {
            result,
            updated_column: None,
        }
    }
}

/// Apply `payload` to `board_id` as of `now`.
pub fn execute_action(
    db: &BoardDb,
    board_id: Uuid,
    payload: &ActionPayload,
    now: DateTime<Utc>,
) -> Result<ActionOutcome> {
    if db.get_board(board_id)?.is_none() {
        return Err(BoardError::BoardNotFound { id: board_id }.into());
    }
    match payload {
        ActionPayload::RedistributeTasks(a) => redistribute(db, board_id, a),
        ActionPayload::AdjustWipLimits(a) => adjust_wip(db, board_id, a),
        ActionPayload::EnforceWipLimits(a) => enforce_wip(db, board_id, a),
        ActionPayload::ReassignOverdue(a) => reassign_overdue(db, board_id, a, now),
    }
}

fn board_column(db: &BoardDb, board_id: Uuid, column_id: Uuid) -> Result<Column> {
    db.get_column(column_id)?
        .filter(|c| c.board_id == board_id)
        .ok_or_else(|| BoardError::ColumnNotFound { id: column_id }.into())
}

fn redistribute(db: &BoardDb, board_id: Uuid, action: &RedistributeTasks) -> Result<ActionOutcome> {
    if action.task_count < 0 {
        return Err(BoardError::InvalidAction("taskCount must not be negative".into()).into());
    }
    let candidates: Vec<Uuid> = db
        .list_tasks(board_id)?
        .into_iter()
        .filter(|t| t.assignee_id == Some(action.from_user_id) && !t.is_completed())
        .take(action.task_count as usize)
        .map(|t| t.id)
        .collect();

    let mut moved = Vec::with_capacity(candidates.len());
    for task_id in candidates {
        db.assign_task(task_id, Some(action.to_user_id))?;
        moved.push(task_id);
    }
    Ok(ActionOutcome::result(json!({
        "redistributedTasks": moved,
        "fromUserId": action.from_user_id,
        "toUserId": action.to_user_id,
        "count": moved.len(),
    })))
}

fn adjust_wip(db: &BoardDb, board_id: Uuid, action: &AdjustWipLimits) -> Result<ActionOutcome> {
    if action.new_limit < 0 {
        return Err(BoardError::InvalidAction("newLimit must not be negative".into()).into());
    }
    let column = board_column(db, board_id, action.column_id)?;
    let updated = db.update_column(column.id, None, Some(action.new_limit))?;
    Ok(ActionOutcome {
        result: json!({
            "columnId": column.id,
            "oldLimit": column.wip_limit,
            "newLimit": updated.wip_limit,
        }),
        updated_column: Some(updated),
    })
}

fn enforce_wip(db: &BoardDb, board_id: Uuid, action: &EnforceWipLimits) -> Result<ActionOutcome> {
    let column = board_column(db, board_id, action.column_id)?;
    let task_count = db.list_column_tasks(column.id)?.len() as i64;
    let over_by = if column.wip_limit > 0 {
        (task_count - column.wip_limit).max(0)
    } else {
        0
    };
    Ok(ActionOutcome::result(json!({
        "columnId": column.id,
        "taskCount": task_count,
        "wipLimit": column.wip_limit,
        "overLimit": over_by > 0,
        "overflowBy": over_by,
    })))
}

/// Round-robin over the board's assignees, never handing a task back to
/// its current assignee.
fn reassign_overdue(
    db: &BoardDb,
    board_id: Uuid,
    action: &ReassignOverdue,
    now: DateTime<Utc>,
) -> Result<ActionOutcome> {
    let tasks = db.list_tasks(board_id)?;
    if let Some(id) = action.task_id {
        if !tasks.iter().any(|t| t.id == id) {
            return Err(BoardError::TaskNotFound { id }.into());
        }
    }

    let assignees: BTreeSet<Uuid> = tasks.iter().filter_map(|t| t.assignee_id).collect();
    let overdue = tasks
        .iter()
        .filter(|t| t.is_overdue(now))
        .filter(|t| action.task_id.is_none_or(|id| id == t.id));

    let mut reassigned = Vec::new();
    for task in overdue {
        let pool: Vec<Uuid> = assignees
            .iter()
            .copied()
            .filter(|a| Some(*a) != task.assignee_id)
            .collect();
        if pool.is_empty() {
            continue;
        }
        let to = pool[reassigned.len() % pool.len()];
        db.assign_task(task.id, Some(to))?;
        reassigned.push(task.id);
    }
    Ok(ActionOutcome::result(json!({
        "reassignedTasks": reassigned,
        "count": reassigned.len(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::models::NewTask;
    use chrono::Duration;

    struct Fixture {
        db: BoardDb,
        board: Uuid,
        todo: Column,
    }

    fn fixture() -> Fixture {
        let db = BoardDb::new_in_memory().unwrap();
        let board = db.create_board("Team", "", Uuid::nil(), Utc::now()).unwrap().id;
        let todo = db.create_column(board, "To Do", 2).unwrap();
        Fixture { db, board, todo }
    }

    fn task(f: &Fixture, assignee: Option<Uuid>, due: Option<DateTime<Utc>>) -> Uuid {
        f.db.create_task(
            &NewTask {
                board_id: f.board,
                column_id: f.todo.id,
                title: "t".into(),
                story_points: 1,
                assignee_id: assignee,
                due_date: due,
            },
            Utc::now(),
        )
        .unwrap()
        .id
    }

    #[test]
    fn test_redistribute_moves_open_tasks_only() {
        let f = fixture();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let done = task(&f, Some(alice), None);
        f.db.complete_task(done, Utc::now()).unwrap();
        let a = task(&f, Some(alice), None);
        let b = task(&f, Some(alice), None);
        let c = task(&f, Some(alice), None);

        let payload = ActionPayload::RedistributeTasks(RedistributeTasks {
            from_user_id: alice,
            to_user_id: bob,
            task_count: 2,
            reason: "workload_balancing".into(),
            alert_id: None,
        });
        let outcome = execute_action(&f.db, f.board, &payload, Utc::now()).unwrap();
        assert_eq!(outcome.result["count"], 2);

        let owner = |id| f.db.get_task(id).unwrap().unwrap().assignee_id;
        assert_eq!(owner(done), Some(alice));
        assert_eq!(owner(a), Some(bob));
        assert_eq!(owner(b), Some(bob));
        assert_eq!(owner(c), Some(alice));
    }

    #[test]
    fn test_adjust_wip_reports_old_and_new() {
        let f = fixture();
        let payload = ActionPayload::AdjustWipLimits(AdjustWipLimits {
            column_id: f.todo.id,
            new_limit: 4,
            reason: "bottleneck_detected".into(),
            alert_id: None,
        });
        let outcome = execute_action(&f.db, f.board, &payload, Utc::now()).unwrap();
        assert_eq!(outcome.result["oldLimit"], 2);
        assert_eq!(outcome.result["newLimit"], 4);
        assert_eq!(outcome.updated_column.unwrap().wip_limit, 4);
    }

    #[test]
    fn test_column_on_other_board_rejected() {
        let f = fixture();
        let other = f.db.create_board("Other", "", Uuid::nil(), Utc::now()).unwrap().id;
        let foreign = f.db.create_column(other, "Doing", 1).unwrap();
        let payload = ActionPayload::EnforceWipLimits(EnforceWipLimits {
            column_id: foreign.id,
            reason: "wip_violation".into(),
            alert_id: None,
        });
        let err = execute_action(&f.db, f.board, &payload, Utc::now()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BoardError>(),
            Some(BoardError::ColumnNotFound { .. })
        ));
    }

    #[test]
    fn test_enforce_wip_counts_column() {
        let f = fixture();
        for _ in 0..3 {
            task(&f, None, None);
        }
        let payload = ActionPayload::EnforceWipLimits(EnforceWipLimits {
            column_id: f.todo.id,
            reason: "wip_violation".into(),
            alert_id: None,
        });
        let outcome = execute_action(&f.db, f.board, &payload, Utc::now()).unwrap();
        assert_eq!(outcome.result["taskCount"], 3);
        assert_eq!(outcome.result["overLimit"], true);
        assert_eq!(outcome.result["overflowBy"], 1);
        assert!(outcome.updated_column.is_none());
    }

    #[test]
    fn test_reassign_overdue_round_robin() {
        let f = fixture();
        let now = Utc::now();
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let late = Some(now - Duration::days(1));
        task(&f, Some(bob), None);
        task(&f, Some(carol), None);
        let t1 = task(&f, Some(alice), late);
        let t2 = task(&f, Some(alice), late);
        let on_time = task(&f, Some(alice), Some(now + Duration::days(2)));

        let payload = ActionPayload::ReassignOverdue(ReassignOverdue {
            task_id: None,
            reason: "deadline_risk".into(),
            alert_id: None,
        });
        let outcome = execute_action(&f.db, f.board, &payload, now).unwrap();
        assert_eq!(outcome.result["count"], 2);

        let owner = |id| f.db.get_task(id).unwrap().unwrap().assignee_id.unwrap();
        let first = owner(t1);
        let second = owner(t2);
        assert_ne!(first, alice);
        assert_ne!(second, alice);
        assert_ne!(first, second);
        assert_eq!(owner(on_time), alice);
    }

    #[test]
    fn test_unknown_board_rejected() {
        let f = fixture();
        let payload = ActionPayload::ReassignOverdue(ReassignOverdue {
            task_id: None,
            reason: "deadline_risk".into(),
            alert_id: None,
        });
        let err = execute_action(&f.db, Uuid::new_v4(), &payload, Utc::now()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BoardError>(),
            Some(BoardError::BoardNotFound { .. })
        ));
    }
}
