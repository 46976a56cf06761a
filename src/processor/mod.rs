//! The single consumer of the primary event stream.
//!
//! Every event is logged, then dispatched by type. Handlers recompute their
//! projection from current persisted state instead of applying deltas, so a
//! redelivered event converges to the same result.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use flowboard_common::{Event, EventPayload, RiskAlert, RiskPrediction};

use crate::board::db::DbHandle;
use crate::bus::{Handler, MessageBus, publish_alert};
use crate::projections::{WeekWindow, bottlenecks, cycle_time_days, velocity};

#[derive(Clone)]
pub struct EventProcessor {
    db: DbHandle,
    bus: Arc<dyn MessageBus>,
}

#[async_trait]
impl Handler<Event> for EventProcessor {
    async fn handle(&self, event: Event) -> Result<()> {
        self.process(event, Utc::now()).await
    }
}

impl EventProcessor {
    pub fn new(db: DbHandle, bus: Arc<dyn MessageBus>) -> Self {
        Self { db, bus }
    }

    /// Log `event` and run its handler as of `now`.
    pub async fn process(&self, event: Event, now: DateTime<Utc>) -> Result<()> {
        let logged = event.clone();
        let fresh = self
            .db
            .call(move |db| db.append_event(&logged, now))
            .await
            .context("Failed to append event to log")?;

        let board_id = event.board_id;
        tracing::debug!(
            event_id = %event.id,
            event_type = event.kind(),
            %board_id,
            redelivered = !fresh,
            "processing event"
        );

        match &event.payload {
            EventPayload::TaskCreated(_) | EventPayload::TaskDeleted(_) => {
                self.refresh_velocity(board_id, now).await?;
            }
            EventPayload::TaskUpdated(update) if update.is_completion() => {
                self.refresh_velocity(board_id, now).await?;
            }
            EventPayload::TaskMoved(_) => {
                self.refresh_cycle_time(board_id, now).await?;
                self.detect_bottlenecks(board_id, now).await?;
            }
            EventPayload::ColumnUpdated(_) => {
                self.detect_bottlenecks(board_id, now).await?;
            }
            EventPayload::BoardCreated(_) => {
                self.create_default_columns(board_id).await?;
            }
            EventPayload::TaskUpdated(_)
            | EventPayload::BoardUpdated(_)
            | EventPayload::ColumnCreated(_)
            | EventPayload::AgentActionExecuted(_) => {
                tracing::debug!(event_id = %event.id, event_type = event.kind(), "no projection to update");
            }
            EventPayload::Unknown { kind, .. } => {
                tracing::warn!(event_id = %event.id, event_type = %kind, "unknown event type, acknowledging");
            }
        }
        Ok(())
    }

    async fn refresh_velocity(&self, board_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let snapshot = self
            .db
            .call(move |db| {
                let tasks = db.list_tasks(board_id)?;
                let snapshot = velocity(&tasks, now);
                db.upsert_velocity(board_id, &snapshot, now)?;
                Ok(snapshot)
            })
            .await
            .context("Failed to refresh velocity")?;
        tracing::debug!(
            %board_id,
            week = snapshot.window.week,
            velocity = snapshot.velocity,
            completed = snapshot.completed,
            "velocity updated"
        );
        Ok(())
    }

    async fn refresh_cycle_time(&self, board_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let cycle_time = self
            .db
            .call(move |db| {
                let tasks = db.list_tasks(board_id)?;
                let Some(days) = cycle_time_days(&tasks) else {
                    return Ok(None);
                };
                db.upsert_cycle_time(board_id, &WeekWindow::containing(now), days, now)?;
                Ok(Some(days))
            })
            .await
            .context("Failed to refresh cycle time")?;
        match cycle_time {
            Some(days) => tracing::debug!(%board_id, cycle_time_days = days, "cycle time updated"),
            None => tracing::debug!(%board_id, "no completed tasks, cycle time unchanged"),
        }
        Ok(())
    }

    /// Persist a prediction for every column over its WIP limit and alert the
    /// agent. A persisting violation alerts again on every triggering event.
    async fn detect_bottlenecks(&self, board_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let predictions: Vec<RiskPrediction> = self
            .db
            .call(move |db| {
                let columns = db.list_columns(board_id)?;
                let tasks = db.list_tasks(board_id)?;
                let mut predictions = Vec::new();
                for finding in bottlenecks(&columns, &tasks) {
                    let prediction = finding
                        .to_prediction(now)
                        .context("Failed to encode bottleneck data")?;
                    db.insert_risk(&prediction)?;
                    predictions.push(prediction);
                }
                Ok(predictions)
            })
            .await
            .context("Failed to run bottleneck detection")?;

        for prediction in &predictions {
            tracing::warn!(
                %board_id,
                alert_id = %prediction.id,
                description = %prediction.description,
                "bottleneck detected"
            );
            let alert = match RiskAlert::from_prediction(prediction) {
                Ok(alert) => alert,
                Err(e) => {
                    tracing::error!(alert_id = %prediction.id, error = %e, "could not build risk alert");
                    continue;
                }
            };
            if let Err(e) = publish_alert(self.bus.as_ref(), &alert).await {
                tracing::warn!(alert_id = %alert.id, error = %e, "failed to publish risk alert");
            }
        }
        Ok(())
    }

    async fn create_default_columns(&self, board_id: Uuid) -> Result<()> {
        let created = self
            .db
            .call(move |db| {
                if db.get_board(board_id)?.is_none() {
                    return Ok(None);
                }
                db.ensure_default_columns(board_id).map(|c| Some(c.len()))
            })
            .await
            .context("Failed to create default columns")?;
        match created {
            Some(0) => tracing::debug!(%board_id, "board already has columns"),
            Some(n) => tracing::info!(%board_id, columns = n, "created default columns"),
            None => tracing::warn!(%board_id, "board.created for unknown board, skipping default columns"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::db::BoardDb;
    use crate::board::models::{Board, Column, EventQuery, NewTask, Task};
    use crate::bus::{RISK_QUEUE, SqliteBus};
    use chrono::Duration;
    use flowboard_common::event::{BoardChanged, ColumnUpdated, TaskMoved, TaskUpdated};
    use flowboard_common::{AlertKind, Decode, RiskLevel};

    struct Fixture {
        processor: EventProcessor,
        db: DbHandle,
        bus: SqliteBus,
        board: Board,
        columns: Vec<Column>,
    }

    async fn fixture() -> Fixture {
        let bus = SqliteBus::new_in_memory().unwrap();
        bus.declare_topology().await.unwrap();
        let db = DbHandle::new(BoardDb::new_in_memory().unwrap());
        let (board, columns) = {
            let guard = db.lock_sync().unwrap();
            let board = guard.create_board("b", "", Uuid::nil(), Utc::now()).unwrap();
            let columns = guard.ensure_default_columns(board.id).unwrap();
            (board, columns)
        };
        Fixture {
            processor: EventProcessor::new(db.clone(), Arc::new(bus.clone())),
            db,
            bus,
            board,
            columns,
        }
    }

    fn add_task(f: &Fixture, column: usize, points: i64) -> Task {
        f.db.lock_sync()
            .unwrap()
            .create_task(
                &NewTask {
                    board_id: f.board.id,
                    column_id: f.columns[column].id,
                    title: "t".into(),
                    story_points: points,
                    assignee_id: None,
                    due_date: None,
                },
                Utc::now() - Duration::days(2),
            )
            .unwrap()
    }

    fn moved(f: &Fixture, task: &Task) -> Event {
        Event::new(
            f.board.id,
            Uuid::nil(),
            EventPayload::TaskMoved(TaskMoved {
                task_id: task.id,
                old_column_id: None,
                new_column_id: task.column_id,
                old_position: None,
                new_position: task.position,
            }),
        )
    }

    #[tokio::test]
    async fn test_completion_recomputes_velocity_idempotently() {
        let f = fixture().await;
        let task = add_task(&f, 4, 8);
        let now = Utc::now();
        f.db.lock_sync().unwrap().complete_task(task.id, now).unwrap();

        let event = Event::new(
            f.board.id,
            Uuid::nil(),
            EventPayload::TaskUpdated(TaskUpdated {
                task_id: task.id,
                title: None,
                story_points: None,
                assignee_id: None,
                old_status: Some("in_progress".into()),
                status: Some("completed".into()),
            }),
        );
        f.processor.process(event.clone(), now).await.unwrap();
        let first = f.db.lock_sync().unwrap().list_velocity(f.board.id, 12).unwrap();
        // Redelivery converges on the same row.
        f.processor.process(event, now).await.unwrap();
        let second = f.db.lock_sync().unwrap().list_velocity(f.board.id, 12).unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].velocity, 4.0);
        assert_eq!(first[0].completed, 1);
        assert_eq!(first[0].velocity, second[0].velocity);
        assert_eq!(second.len(), 1);

        let (_, logged) = f
            .db
            .lock_sync()
            .unwrap()
            .list_events(f.board.id, &EventQuery::new(None, None, None, None))
            .unwrap();
        assert_eq!(logged, 1);
    }

    #[tokio::test]
    async fn test_wip_overflow_emits_bottleneck_alert() {
        let f = fixture().await;
        // "In Progress" has a WIP limit of 3.
        let mut last = None;
        for _ in 0..4 {
            last = Some(add_task(&f, 2, 1));
        }
        let event = moved(&f, last.as_ref().unwrap());
        f.processor.process(event, Utc::now()).await.unwrap();

        let risks = f.db.lock_sync().unwrap().list_risks(f.board.id, None).unwrap();
        assert_eq!(risks.len(), 1);
        assert_eq!(risks[0].kind, "bottleneck");
        assert_eq!(risks[0].level, RiskLevel::High);
        assert_eq!(risks[0].score, 0.8);
        assert_eq!(risks[0].data["overflowBy"], 1);

        let d = f.bus.fetch(RISK_QUEUE).await.unwrap().unwrap();
        assert_eq!(d.routing_key, "risk.bottleneck");
        let alert = RiskAlert::decode(&d.body).unwrap();
        assert_eq!(alert.id, risks[0].id);
        match alert.kind {
            AlertKind::Bottleneck(data) => {
                assert_eq!(data.column_id, f.columns[2].id);
                assert_eq!(data.task_count, 4);
                assert_eq!(data.wip_limit, 3);
            }
            other => panic!("unexpected alert {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_repeated_violation_alerts_again() {
        let f = fixture().await;
        let mut tasks = Vec::new();
        for _ in 0..3 {
            tasks.push(add_task(&f, 3, 1));
        }
        f.processor.process(moved(&f, &tasks[0]), Utc::now()).await.unwrap();
        f.processor.process(moved(&f, &tasks[1]), Utc::now()).await.unwrap();
        assert_eq!(f.db.lock_sync().unwrap().list_risks(f.board.id, None).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_move_updates_cycle_time_only_with_completions() {
        let f = fixture().await;
        let task = add_task(&f, 1, 3);
        f.processor.process(moved(&f, &task), Utc::now()).await.unwrap();
        assert!(f.db.lock_sync().unwrap().list_velocity(f.board.id, 12).unwrap().is_empty());

        f.db.lock_sync().unwrap().complete_task(task.id, Utc::now()).unwrap();
        f.processor.process(moved(&f, &task), Utc::now()).await.unwrap();
        let metrics = f.db.lock_sync().unwrap().list_velocity(f.board.id, 12).unwrap();
        assert_eq!(metrics.len(), 1);
        assert!((metrics[0].cycle_time - 2.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_column_update_runs_wip_check() {
        let f = fixture().await;
        for _ in 0..2 {
            add_task(&f, 1, 1);
        }
        f.db.lock_sync().unwrap().update_column(f.columns[1].id, None, Some(1)).unwrap();
        let event = Event::new(
            f.board.id,
            Uuid::nil(),
            EventPayload::ColumnUpdated(ColumnUpdated {
                column_id: f.columns[1].id,
                name: None,
                wip_limit: Some(1),
            }),
        );
        f.processor.process(event, Utc::now()).await.unwrap();
        assert_eq!(f.db.lock_sync().unwrap().list_risks(f.board.id, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_board_created_adds_default_columns() {
        let f = fixture().await;
        let fresh = f
            .db
            .lock_sync()
            .unwrap()
            .create_board("new", "", Uuid::nil(), Utc::now())
            .unwrap();
        let payload = EventPayload::BoardCreated(BoardChanged {
            name: "new".into(),
            description: String::new(),
        });
        f.processor
            .process(Event::new(fresh.id, Uuid::nil(), payload.clone()), Utc::now())
            .await
            .unwrap();
        assert_eq!(f.db.lock_sync().unwrap().list_columns(fresh.id).unwrap().len(), 5);

        // Unknown board: logged and skipped, not an error.
        f.processor
            .process(Event::new(Uuid::new_v4(), Uuid::nil(), payload), Utc::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_type_is_acknowledged() {
        let f = fixture().await;
        let event = Event::new(
            f.board.id,
            Uuid::nil(),
            EventPayload::from_parts("sprint.started", serde_json::json!({"n": 1})).unwrap(),
        );
        f.processor.handle(event).await.unwrap();
    }
}
