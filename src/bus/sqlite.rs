//! SQLite-backed broker implementing [`MessageBus`].
//!
//! Exchanges, queues, bindings and messages all live in one database file,
//! so a published message is durable as soon as `publish` returns.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use super::{
    Delivery, EVENT_ROUTING_KEY, EVENTS_EXCHANGE, EVENTS_QUEUE, JSON_CONTENT_TYPE, MessageBus,
    RISK_BINDING, RISK_EXCHANGE, RISK_QUEUE, topic_matches,
};
use crate::board::db::{format_ts, parse_ts};
use crate::config::BusConfig;
use crate::errors::{BusError, PublishError};

const STATE_READY: &str = "ready";
const STATE_UNACKED: &str = "unacked";

/// A message the broker gave up on after too many deliveries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusDeadLetter {
    pub message_id: Uuid,
    pub queue: String,
    pub routing_key: String,
    pub body: String,
    pub delivery_count: u32,
    pub reason: String,
    pub dead_at: chrono::DateTime<Utc>,
}

#[derive(Clone)]
pub struct SqliteBus {
    conn: Arc<std::sync::Mutex<Connection>>,
    published: Arc<Notify>,
    max_deliveries: Option<u32>,
}

impl SqliteBus {
    /// Open (or create) the broker database at `path`.
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("Failed to open bus database")?;
        Self::from_connection(conn)
    }

    pub fn new_in_memory() -> anyhow::Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory bus database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS bus_exchanges (
                name TEXT PRIMARY KEY,
                kind TEXT NOT NULL DEFAULT 'topic',
                durable INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS bus_queues (
                name TEXT PRIMARY KEY,
                durable INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS bus_bindings (
                queue TEXT NOT NULL REFERENCES bus_queues(name) ON DELETE CASCADE,
                exchange TEXT NOT NULL REFERENCES bus_exchanges(name) ON DELETE CASCADE,
                pattern TEXT NOT NULL,
                PRIMARY KEY (queue, exchange, pattern)
            );

            CREATE TABLE IF NOT EXISTS bus_messages (
                tag INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                queue TEXT NOT NULL REFERENCES bus_queues(name) ON DELETE CASCADE,
                exchange TEXT NOT NULL,
                routing_key TEXT NOT NULL,
                body BLOB NOT NULL,
                content_type TEXT NOT NULL,
                persistent INTEGER NOT NULL DEFAULT 1,
                published_at TEXT NOT NULL,
                delivery_count INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'ready'
            );

            CREATE INDEX IF NOT EXISTS idx_bus_messages_ready ON bus_messages(queue, state, tag);

            CREATE TABLE IF NOT EXISTS bus_dead_letters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                queue TEXT NOT NULL,
                routing_key TEXT NOT NULL,
                body BLOB NOT NULL,
                delivery_count INTEGER NOT NULL,
                reason TEXT NOT NULL,
                dead_at TEXT NOT NULL
            );
            ",
        )
        .context("Failed to create bus tables")?;
        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
            published: Arc::new(Notify::new()),
            max_deliveries: None,
        })
    }

    /// Dead-letter messages requeued after this many deliveries.
    pub fn with_max_deliveries(mut self, max_deliveries: Option<u32>) -> Self {
        self.max_deliveries = max_deliveries;
        self
    }

    /// Open the configured broker file, creating its directory and the
    /// standard topology.
    pub async fn open(config: &BusConfig) -> anyhow::Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create bus directory")?;
        }
        let bus = Self::new(&config.path)?.with_max_deliveries(config.max_deliveries);
        bus.declare_topology()
            .await
            .context("Failed to declare bus topology")?;
        Ok(bus)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn call<F, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut Connection) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<anyhow::Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| anyhow::anyhow!("Bus lock poisoned: {}", e))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| E::from(anyhow::Error::new(e).context("Bus task panicked")))?
    }

    // ── Topology ──────────────────────────────────────────────────────

    /// Declare a durable topic exchange. Redeclaring is a no-op.
    pub async fn declare_exchange(&self, name: &str) -> Result<(), BusError> {
        let name = name.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO bus_exchanges (name) VALUES (?1)",
                params![name],
            )
            .context("Failed to declare exchange")?;
            Ok(())
        })
        .await
    }

    /// Declare a durable queue. Redeclaring is a no-op.
    pub async fn declare_queue(&self, name: &str) -> Result<(), BusError> {
        let name = name.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO bus_queues (name) VALUES (?1)",
                params![name],
            )
            .context("Failed to declare queue")?;
            Ok(())
        })
        .await
    }

    pub async fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BusError> {
        let (queue, exchange, pattern) =
            (queue.to_string(), exchange.to_string(), pattern.to_string());
        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO bus_bindings (queue, exchange, pattern) VALUES (?1, ?2, ?3)",
                params![queue, exchange, pattern],
            )
            .context("Failed to bind queue")?;
            Ok(())
        })
        .await
    }

    /// Declare both exchanges, both queues and their bindings.
    pub async fn declare_topology(&self) -> Result<(), BusError> {
        self.declare_exchange(EVENTS_EXCHANGE).await?;
        self.declare_queue(EVENTS_QUEUE).await?;
        self.bind(EVENTS_QUEUE, EVENTS_EXCHANGE, EVENT_ROUTING_KEY)
            .await?;
        self.declare_exchange(RISK_EXCHANGE).await?;
        self.declare_queue(RISK_QUEUE).await?;
        self.bind(RISK_QUEUE, RISK_EXCHANGE, RISK_BINDING).await?;
        tracing::debug!("bus topology declared");
        Ok(())
    }

    // ── Bookkeeping ───────────────────────────────────────────────────

    /// Return the unacknowledged deliveries of `queue` to the ready state.
    /// Run by a consumer process at startup: deliveries outstanding then
    /// belonged to its dead predecessor.
    pub async fn recover(&self, queue: &str) -> Result<usize, BusError> {
        let queue = queue.to_string();
        let recovered = self
            .call(move |conn| {
                conn.execute(
                    "UPDATE bus_messages SET state = ?1 WHERE state = ?2 AND queue = ?3",
                    params![STATE_READY, STATE_UNACKED, queue],
                )
                .context("Failed to recover unacked deliveries")
                .map_err(BusError::from)
            })
            .await?;
        if recovered > 0 {
            tracing::info!(recovered, "returned unacknowledged deliveries to the queue");
            self.published.notify_waiters();
        }
        Ok(recovered)
    }

    /// Messages in `queue`, ready or outstanding.
    pub async fn queue_depth(&self, queue: &str) -> Result<i64, BusError> {
        let queue = queue.to_string();
        self.call(move |conn| {
            let depth = conn
                .query_row(
                    "SELECT COUNT(*) FROM bus_messages WHERE queue = ?1",
                    params![queue],
                    |row| row.get(0),
                )
                .context("Failed to count queue messages")?;
            Ok(depth)
        })
        .await
    }

    pub async fn dead_letters(&self) -> Result<Vec<BusDeadLetter>, BusError> {
        self.call(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT message_id, queue, routing_key, body, delivery_count, reason, dead_at
                     FROM bus_dead_letters ORDER BY id",
                )
                .context("Failed to prepare dead letter query")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, u32>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                })
                .context("Failed to query dead letters")?;
            let mut letters = Vec::new();
            for row in rows {
                let (message_id, queue, routing_key, body, delivery_count, reason, dead_at) =
                    row.context("Failed to read dead letter row")?;
                letters.push(BusDeadLetter {
                    message_id: Uuid::parse_str(&message_id)
                        .context("Invalid stored message id")?,
                    queue,
                    routing_key,
                    body: String::from_utf8_lossy(&body).into_owned(),
                    delivery_count,
                    reason,
                    dead_at: parse_ts(&dead_at)?,
                });
            }
            Ok(letters)
        })
        .await
    }
}

#[async_trait]
impl MessageBus for SqliteBus {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<(), PublishError> {
        let (exchange, routing_key) = (exchange.to_string(), routing_key.to_string());
        let routed = self
            .call(move |conn| -> Result<usize, PublishError> {
                let tx = conn.transaction().context("Failed to begin publish")?;
                let declared = tx
                    .query_row(
                        "SELECT 1 FROM bus_exchanges WHERE name = ?1",
                        params![exchange],
                        |_| Ok(()),
                    )
                    .optional()
                    .context("Failed to look up exchange")?;
                if declared.is_none() {
                    return Err(PublishError::UnknownExchange { exchange });
                }

                let queues: BTreeSet<String> = {
                    let mut stmt = tx
                        .prepare("SELECT queue, pattern FROM bus_bindings WHERE exchange = ?1")
                        .context("Failed to prepare binding lookup")?;
                    let rows = stmt
                        .query_map(params![exchange], |row| {
                            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                        })
                        .context("Failed to query bindings")?;
                    let mut queues = BTreeSet::new();
                    for row in rows {
                        let (queue, pattern) = row.context("Failed to read binding row")?;
                        if topic_matches(&pattern, &routing_key) {
                            queues.insert(queue);
                        }
                    }
                    queues
                };

                let message_id = Uuid::new_v4().to_string();
                let published_at = format_ts(&Utc::now());
                for queue in &queues {
                    tx.execute(
                        "INSERT INTO bus_messages
                            (message_id, queue, exchange, routing_key, body, content_type, persistent, published_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
                        params![
                            message_id,
                            queue,
                            exchange,
                            routing_key,
                            body,
                            JSON_CONTENT_TYPE,
                            published_at
                        ],
                    )
                    .context("Failed to store message")?;
                }
                tx.commit().context("Failed to commit publish")?;

                if queues.is_empty() {
                    tracing::debug!(%exchange, %routing_key, "message matched no binding, dropped");
                }
                Ok(queues.len())
            })
            .await?;

        if routed > 0 {
            self.published.notify_waiters();
        }
        Ok(())
    }

    async fn fetch(&self, queue: &str) -> Result<Option<Delivery>, BusError> {
        let queue = queue.to_string();
        self.call(move |conn| {
            let tx = conn.transaction().context("Failed to begin fetch")?;
            let declared = tx
                .query_row(
                    "SELECT 1 FROM bus_queues WHERE name = ?1",
                    params![queue],
                    |_| Ok(()),
                )
                .optional()
                .context("Failed to look up queue")?;
            if declared.is_none() {
                return Err(BusError::UnknownQueue { queue });
            }

            let row = tx
                .query_row(
                    "SELECT tag, message_id, routing_key, content_type, body, delivery_count
                     FROM bus_messages WHERE queue = ?1 AND state = ?2
                     ORDER BY tag LIMIT 1",
                    params![queue, STATE_READY],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Vec<u8>>(4)?,
                            row.get::<_, u32>(5)?,
                        ))
                    },
                )
                .optional()
                .context("Failed to read next message")?;
            let Some((tag, message_id, routing_key, content_type, body, delivered)) = row else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE bus_messages SET state = ?1, delivery_count = delivery_count + 1 WHERE tag = ?2",
                params![STATE_UNACKED, tag],
            )
            .context("Failed to mark delivery outstanding")?;
            tx.commit().context("Failed to commit fetch")?;

            Ok(Some(Delivery {
                tag,
                message_id: Uuid::parse_str(&message_id).context("Invalid stored message id")?,
                queue,
                routing_key,
                content_type,
                body,
                delivery_count: delivered + 1,
            }))
        })
        .await
    }

    async fn ack(&self, tag: i64) -> Result<(), BusError> {
        self.call(move |conn| {
            let removed = conn
                .execute(
                    "DELETE FROM bus_messages WHERE tag = ?1 AND state = ?2",
                    params![tag, STATE_UNACKED],
                )
                .context("Failed to ack delivery")?;
            if removed == 0 {
                return Err(BusError::UnknownDelivery { tag });
            }
            Ok(())
        })
        .await
    }

    async fn nack(&self, tag: i64, requeue: bool) -> Result<(), BusError> {
        let max_deliveries = self.max_deliveries;
        let requeued = self
            .call(move |conn| -> Result<bool, BusError> {
                let tx = conn.transaction().context("Failed to begin nack")?;
                let row = tx
                    .query_row(
                        "SELECT message_id, queue, exchange, routing_key, body, content_type, published_at, delivery_count
                         FROM bus_messages WHERE tag = ?1 AND state = ?2",
                        params![tag, STATE_UNACKED],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, String>(3)?,
                                row.get::<_, Vec<u8>>(4)?,
                                row.get::<_, String>(5)?,
                                row.get::<_, String>(6)?,
                                row.get::<_, u32>(7)?,
                            ))
                        },
                    )
                    .optional()
                    .context("Failed to read delivery")?;
                let Some((message_id, queue, exchange, routing_key, body, content_type, published_at, delivered)) =
                    row
                else {
                    return Err(BusError::UnknownDelivery { tag });
                };

                tx.execute("DELETE FROM bus_messages WHERE tag = ?1", params![tag])
                    .context("Failed to remove delivery")?;

                let exhausted = max_deliveries.is_some_and(|max| delivered >= max);
                let requeued = if !requeue {
                    false
                } else if exhausted {
                    tx.execute(
                        "INSERT INTO bus_dead_letters
                            (message_id, queue, routing_key, body, delivery_count, reason, dead_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            message_id,
                            queue,
                            routing_key,
                            body,
                            delivered,
                            format!("exceeded {} deliveries", delivered),
                            format_ts(&Utc::now()),
                        ],
                    )
                    .context("Failed to dead-letter message")?;
                    tracing::warn!(
                        delivery_tag = tag,
                        %message_id,
                        %queue,
                        deliveries = delivered,
                        "message exceeded delivery limit, moved to dead letters"
                    );
                    false
                } else {
                    // A fresh tag puts the message at the back of the queue.
                    tx.execute(
                        "INSERT INTO bus_messages
                            (message_id, queue, exchange, routing_key, body, content_type, persistent, published_at, delivery_count, state)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?9)",
                        params![
                            message_id,
                            queue,
                            exchange,
                            routing_key,
                            body,
                            content_type,
                            published_at,
                            delivered,
                            STATE_READY
                        ],
                    )
                    .context("Failed to requeue message")?;
                    true
                };
                tx.commit().context("Failed to commit nack")?;
                Ok(requeued)
            })
            .await?;

        if requeued {
            self.published.notify_waiters();
        }
        Ok(())
    }

    async fn published(&self) {
        self.published.notified().await
    }
}
