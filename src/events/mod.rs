//! The append-only event log and the producer that feeds the bus.
//!
//! Producers always write to the log before publishing. A publish failure
//! only delays propagation: the record is already durable and `replay` can
//! push it again.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use flowboard_common::{Event, RawEvent};

use crate::board::db::DbHandle;
use crate::board::models::EventQuery;
use crate::bus::{EVENT_ROUTING_KEY, EVENTS_EXCHANGE, MessageBus, publish_event};

/// Outcome of republishing logged events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub published: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct EventLog {
    db: DbHandle,
    bus: Arc<dyn MessageBus>,
}

impl EventLog {
    pub fn new(db: DbHandle, bus: Arc<dyn MessageBus>) -> Self {
        Self { db, bus }
    }

    /// Append without publishing. Returns false when the id was already logged.
    pub async fn append(&self, event: Event) -> Result<bool> {
        self.db
            .call(move |db| db.append_event(&event, Utc::now()))
            .await
    }

    /// Append to the log, then publish to the event exchange.
    pub async fn record_and_publish(&self, event: Event) -> Result<()> {
        let logged = event.clone();
        let fresh = self.append(logged).await?;
        if !fresh {
            tracing::debug!(event_id = %event.id, "event already logged, publishing again");
        }
        if let Err(e) = publish_event(self.bus.as_ref(), &event).await {
            tracing::warn!(
                event_id = %event.id,
                event_type = event.kind(),
                board_id = %event.board_id,
                error = %e,
                "publish failed, event remains in the log"
            );
        }
        Ok(())
    }

    pub async fn list(&self, board_id: Uuid, query: EventQuery) -> Result<(Vec<RawEvent>, i64)> {
        self.db
            .call(move |db| db.list_events(board_id, &query))
            .await
    }

    /// Republish logged events in timestamp order. Events are sent in their
    /// logged wire form, so types this build does not know are carried too.
    pub async fn replay(
        &self,
        board_id: Option<Uuid>,
        since: Option<DateTime<Utc>>,
    ) -> Result<ReplaySummary> {
        let events = self
            .db
            .call(move |db| db.replay_events(board_id, since))
            .await
            .context("Failed to read event log for replay")?;

        let mut summary = ReplaySummary::default();
        for raw in &events {
            let body = serde_json::to_vec(raw).context("Failed to encode logged event")?;
            match self.bus.publish(EVENTS_EXCHANGE, EVENT_ROUTING_KEY, body).await {
                Ok(()) => summary.published += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(event_id = %raw.id, error = %e, "replay publish failed");
                }
            }
        }
        tracing::info!(
            published = summary.published,
            failed = summary.failed,
            "event replay finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::db::BoardDb;
    use crate::bus::{EVENTS_QUEUE, SqliteBus};
    use crate::errors::{BusError, PublishError};
    use async_trait::async_trait;
    use chrono::Duration;
    use flowboard_common::event::TaskDeleted;
    use flowboard_common::{Decode, EventPayload};

    fn event(board_id: Uuid) -> Event {
        Event::new(
            board_id,
            Uuid::nil(),
            EventPayload::TaskDeleted(TaskDeleted {
                task_id: Uuid::new_v4(),
                column_id: None,
                title: Some("gone".into()),
            }),
        )
    }

    /// A bus whose transport is always down.
    struct DownBus;

    #[async_trait]
    impl MessageBus for DownBus {
        async fn publish(&self, _: &str, _: &str, _: Vec<u8>) -> Result<(), PublishError> {
            Err(PublishError::Storage(anyhow::anyhow!("connection refused")))
        }
        async fn fetch(&self, _: &str) -> Result<Option<crate::bus::Delivery>, BusError> {
            Ok(None)
        }
        async fn ack(&self, tag: i64) -> Result<(), BusError> {
            Err(BusError::UnknownDelivery { tag })
        }
        async fn nack(&self, tag: i64, _: bool) -> Result<(), BusError> {
            Err(BusError::UnknownDelivery { tag })
        }
    }

    async fn sqlite_log() -> (EventLog, SqliteBus) {
        let bus = SqliteBus::new_in_memory().unwrap();
        bus.declare_topology().await.unwrap();
        let db = DbHandle::new(BoardDb::new_in_memory().unwrap());
        (EventLog::new(db, Arc::new(bus.clone())), bus)
    }

    #[tokio::test]
    async fn test_record_and_publish_logs_then_publishes() {
        let (log, bus) = sqlite_log().await;
        let board = Uuid::new_v4();
        let e = event(board);
        log.record_and_publish(e.clone()).await.unwrap();

        let (logged, total) = log.list(board, EventQuery::new(None, None, None, None)).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(logged[0].id, e.id);

        let d = bus.fetch(EVENTS_QUEUE).await.unwrap().unwrap();
        assert_eq!(Event::decode(&d.body).unwrap(), e);
    }

    #[tokio::test]
    async fn test_publish_failure_is_not_fatal() {
        let db = DbHandle::new(BoardDb::new_in_memory().unwrap());
        let log = EventLog::new(db, Arc::new(DownBus));
        let board = Uuid::new_v4();
        log.record_and_publish(event(board)).await.unwrap();

        let (_, total) = log.list(board, EventQuery::new(None, None, None, None)).await.unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_replay_republishes_in_order() {
        let (log, bus) = sqlite_log().await;
        let board = Uuid::new_v4();
        let mut first = event(board);
        first.timestamp = Utc::now() - Duration::hours(2);
        let second = event(board);
        log.append(second.clone()).await.unwrap();
        log.append(first.clone()).await.unwrap();
        log.append(event(Uuid::new_v4())).await.unwrap();

        let summary = log.replay(Some(board), None).await.unwrap();
        assert_eq!(summary, ReplaySummary { published: 2, failed: 0 });

        let a = bus.fetch(EVENTS_QUEUE).await.unwrap().unwrap();
        let b = bus.fetch(EVENTS_QUEUE).await.unwrap().unwrap();
        assert_eq!(Event::decode(&a.body).unwrap().id, first.id);
        assert_eq!(Event::decode(&b.body).unwrap().id, second.id);
    }
}
