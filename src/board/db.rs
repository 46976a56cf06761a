use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::Value;
use uuid::Uuid;

use flowboard_common::{Event, RawEvent, RiskLevel, RiskPrediction};

use super::models::*;
use crate::errors::BoardError;
use crate::projections::velocity::{VelocitySnapshot, WeekWindow};

/// Default columns for a new board: (name, WIP limit).
pub const DEFAULT_COLUMNS: [(&str, i64); 5] = [
    ("Backlog", 0),
    ("To Do", 5),
    ("In Progress", 3),
    ("Review", 2),
    ("Done", 0),
];

/// Async-safe handle to the board database.
///
/// Wraps `BoardDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<BoardDb>>,
}

impl DbHandle {
    pub fn new(db: BoardDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&BoardDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup and tests only,
    /// never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, BoardDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Timestamps are stored as fixed-width RFC3339 so they order lexically.
pub fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid stored timestamp '{}'", s))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("Invalid stored id '{}'", s))
}

fn parse_opt_id(s: Option<String>) -> Result<Option<Uuid>> {
    s.as_deref().map(parse_id).transpose()
}

fn parse_json(s: &str) -> Result<Value> {
    serde_json::from_str(s).context("Invalid stored JSON")
}

pub struct BoardDb {
    conn: Connection,
}

impl BoardDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS boards (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    created_by TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS columns (
                    id TEXT PRIMARY KEY,
                    board_id TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    position INTEGER NOT NULL,
                    wip_limit INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    board_id TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
                    column_id TEXT NOT NULL REFERENCES columns(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    position INTEGER NOT NULL,
                    story_points INTEGER NOT NULL DEFAULT 0,
                    assignee_id TEXT,
                    created_at TEXT NOT NULL,
                    completed_at TEXT,
                    due_date TEXT
                );

                CREATE TABLE IF NOT EXISTS events (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    board_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    type TEXT NOT NULL,
                    data TEXT NOT NULL,
                    timestamp TEXT NOT NULL,
                    recorded_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS velocity_metrics (
                    board_id TEXT NOT NULL,
                    iso_year INTEGER NOT NULL,
                    sprint_week INTEGER NOT NULL,
                    week_start TEXT NOT NULL,
                    velocity REAL NOT NULL DEFAULT 0,
                    completed INTEGER NOT NULL DEFAULT 0,
                    total_points INTEGER NOT NULL DEFAULT 0,
                    cycle_time REAL NOT NULL DEFAULT 0,
                    throughput INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (board_id, iso_year, sprint_week)
                );

                CREATE TABLE IF NOT EXISTS risk_predictions (
                    id TEXT PRIMARY KEY,
                    board_id TEXT NOT NULL,
                    task_id TEXT,
                    type TEXT NOT NULL,
                    level TEXT NOT NULL,
                    score REAL NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    data TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS agent_actions (
                    id TEXT PRIMARY KEY,
                    board_id TEXT NOT NULL,
                    type TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    data TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL,
                    result TEXT NOT NULL DEFAULT '{}',
                    executed_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS dead_letters (
                    id TEXT PRIMARY KEY,
                    source TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    attempts INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_columns_board ON columns(board_id, position);
                CREATE INDEX IF NOT EXISTS idx_tasks_column ON tasks(column_id, position);
                CREATE INDEX IF NOT EXISTS idx_tasks_board ON tasks(board_id);
                CREATE INDEX IF NOT EXISTS idx_events_board ON events(board_id, timestamp);
                CREATE INDEX IF NOT EXISTS idx_risk_board ON risk_predictions(board_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_actions_board ON agent_actions(board_id, executed_at);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Boards ────────────────────────────────────────────────────────

    pub fn create_board(
        &self,
        name: &str,
        description: &str,
        created_by: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Board> {
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO boards (id, name, description, created_by, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_string(), name, description, created_by.to_string(), format_ts(&now)],
            )
            .context("Failed to insert board")?;
        self.get_board(id)?.context("Board not found after insert")
    }

    pub fn get_board(&self, id: Uuid) -> Result<Option<Board>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, description, created_by, created_at FROM boards WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query board")?;
        match row {
            Some((id, name, description, created_by, created_at)) => Ok(Some(Board {
                id: parse_id(&id)?,
                name,
                description,
                created_by: parse_id(&created_by)?,
                created_at: parse_ts(&created_at)?,
            })),
            None => Ok(None),
        }
    }

    pub fn list_board_ids(&self) -> Result<Vec<Uuid>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM boards ORDER BY created_at")
            .context("Failed to prepare list_board_ids")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query boards")?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(parse_id(&row.context("Failed to read board row")?)?);
        }
        Ok(ids)
    }

    // ── Columns ───────────────────────────────────────────────────────

    pub fn create_column(&self, board_id: Uuid, name: &str, wip_limit: i64) -> Result<Column> {
        if self.get_board(board_id)?.is_none() {
            return Err(BoardError::BoardNotFound { id: board_id }.into());
        }
        let max_pos: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) FROM columns WHERE board_id = ?1",
                params![board_id.to_string()],
                |row| row.get(0),
            )
            .context("Failed to get max column position")?;
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO columns (id, board_id, name, position, wip_limit) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_string(), board_id.to_string(), name, max_pos + 1, wip_limit.max(0)],
            )
            .context("Failed to insert column")?;
        self.get_column(id)?.context("Column not found after insert")
    }

    /// Create the default column set when the board has no columns yet.
    /// Returns the columns created (empty when the board already had some).
    pub fn ensure_default_columns(&self, board_id: Uuid) -> Result<Vec<Column>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let existing: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM columns WHERE board_id = ?1",
                params![board_id.to_string()],
                |row| row.get(0),
            )
            .context("Failed to count columns")?;
        if existing > 0 {
            return Ok(Vec::new());
        }
        for (position, (name, wip_limit)) in DEFAULT_COLUMNS.iter().enumerate() {
            let id = Uuid::new_v4();
            tx.execute(
                "INSERT INTO columns (id, board_id, name, position, wip_limit) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.to_string(), board_id.to_string(), name, position as i64, wip_limit],
            )
            .context("Failed to insert default column")?;
        }
        tx.commit().context("Failed to commit default columns")?;
        self.list_columns(board_id)
    }

    pub fn get_column(&self, id: Uuid) -> Result<Option<Column>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, board_id, name, position, wip_limit FROM columns WHERE id = ?1",
                params![id.to_string()],
                ColumnRow::from_row,
            )
            .optional()
            .context("Failed to query column")?;
        row.map(ColumnRow::into_column).transpose()
    }

    pub fn list_columns(&self, board_id: Uuid) -> Result<Vec<Column>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, board_id, name, position, wip_limit FROM columns
                 WHERE board_id = ?1 ORDER BY position",
            )
            .context("Failed to prepare list_columns")?;
        let rows = stmt
            .query_map(params![board_id.to_string()], ColumnRow::from_row)
            .context("Failed to query columns")?;
        let mut columns = Vec::new();
        for row in rows {
            columns.push(row.context("Failed to read column row")?.into_column()?);
        }
        Ok(columns)
    }

    pub fn update_column(
        &self,
        id: Uuid,
        name: Option<&str>,
        wip_limit: Option<i64>,
    ) -> Result<Column> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if let Some(n) = name {
            tx.execute(
                "UPDATE columns SET name = ?1 WHERE id = ?2",
                params![n, id.to_string()],
            )
            .context("Failed to update column name")?;
        }
        if let Some(limit) = wip_limit {
            tx.execute(
                "UPDATE columns SET wip_limit = ?1 WHERE id = ?2",
                params![limit.max(0), id.to_string()],
            )
            .context("Failed to update column WIP limit")?;
        }
        tx.commit().context("Failed to commit column update")?;
        self.get_column(id)?
            .ok_or_else(|| BoardError::ColumnNotFound { id }.into())
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    /// Insert a task at the end of its column.
    pub fn create_task(&self, new: &NewTask, now: DateTime<Utc>) -> Result<Task> {
        let column = self
            .get_column(new.column_id)?
            .filter(|c| c.board_id == new.board_id)
            .ok_or(BoardError::ColumnNotFound { id: new.column_id })?;
        let max_pos: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) FROM tasks WHERE column_id = ?1",
                params![column.id.to_string()],
                |row| row.get(0),
            )
            .context("Failed to get max task position")?;
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO tasks (id, board_id, column_id, title, position, story_points, assignee_id, created_at, due_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id.to_string(),
                    new.board_id.to_string(),
                    column.id.to_string(),
                    new.title,
                    max_pos + 1,
                    new.story_points.max(0),
                    new.assignee_id.map(|a| a.to_string()),
                    format_ts(&now),
                    new.due_date.as_ref().map(format_ts),
                ],
            )
            .context("Failed to insert task")?;
        self.get_task(id)?.context("Task not found after insert")
    }

    pub fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id.to_string()],
                TaskRow::from_row,
            )
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    /// All tasks of a board, ordered by column then position.
    pub fn list_tasks(&self, board_id: Uuid) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE board_id = ?1 ORDER BY column_id, position",
                TASK_COLUMNS
            ),
            &board_id.to_string(),
        )
    }

    pub fn list_column_tasks(&self, column_id: Uuid) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {} FROM tasks WHERE column_id = ?1 ORDER BY position",
                TASK_COLUMNS
            ),
            &column_id.to_string(),
        )
    }

    fn query_tasks(&self, sql: &str, key: &str) -> Result<Vec<Task>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare task query")?;
        let rows = stmt
            .query_map(params![key], TaskRow::from_row)
            .context("Failed to query tasks")?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    /// Move a task to `position` in `column_id`, keeping positions in both
    /// columns dense. The target position is clamped to the column's bounds.
    pub fn move_task(&self, id: Uuid, column_id: Uuid, position: i64) -> Result<TaskMove> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let task = self.get_task(id)?.ok_or(BoardError::TaskNotFound { id })?;
        let column = self
            .get_column(column_id)?
            .ok_or(BoardError::ColumnNotFound { id: column_id })?;
        if column.board_id != task.board_id {
            return Err(BoardError::CrossBoardMove {
                task_id: id,
                column_id,
            }
            .into());
        }

        let old_column_id = task.column_id;
        let old_column = old_column_id.to_string();
        let new_column = column_id.to_string();
        let old_pos = task.position;

        let count_in = |col: &str| -> Result<i64> {
            tx.query_row(
                "SELECT COUNT(*) FROM tasks WHERE column_id = ?1",
                params![col],
                |row| row.get(0),
            )
            .context("Failed to count column tasks")
        };

        if task.column_id == column_id {
            let len = count_in(&new_column)?;
            let target = position.clamp(0, (len - 1).max(0));
            if target < old_pos {
                tx.execute(
                    "UPDATE tasks SET position = position + 1
                     WHERE column_id = ?1 AND position >= ?2 AND position < ?3",
                    params![new_column, target, old_pos],
                )
                .context("Failed to shift tasks down")?;
            } else if target > old_pos {
                tx.execute(
                    "UPDATE tasks SET position = position - 1
                     WHERE column_id = ?1 AND position > ?2 AND position <= ?3",
                    params![new_column, old_pos, target],
                )
                .context("Failed to shift tasks up")?;
            }
            tx.execute(
                "UPDATE tasks SET position = ?1 WHERE id = ?2",
                params![target, id.to_string()],
            )
            .context("Failed to place task")?;
        } else {
            tx.execute(
                "UPDATE tasks SET position = position - 1 WHERE column_id = ?1 AND position > ?2",
                params![old_column, old_pos],
            )
            .context("Failed to close gap in source column")?;
            let len = count_in(&new_column)?;
            let target = position.clamp(0, len);
            tx.execute(
                "UPDATE tasks SET position = position + 1 WHERE column_id = ?1 AND position >= ?2",
                params![new_column, target],
            )
            .context("Failed to open gap in target column")?;
            tx.execute(
                "UPDATE tasks SET column_id = ?1, position = ?2 WHERE id = ?3",
                params![new_column, target, id.to_string()],
            )
            .context("Failed to place task")?;
        }

        tx.commit().context("Failed to commit task move")?;
        let task = self.get_task(id)?.context("Task not found after move")?;
        Ok(TaskMove {
            task,
            old_column_id,
            old_position: old_pos,
        })
    }

    /// Mark a task completed. Completing an already completed task keeps the
    /// original completion time.
    pub fn complete_task(&self, id: Uuid, now: DateTime<Utc>) -> Result<Task> {
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET completed_at = COALESCE(completed_at, ?1) WHERE id = ?2",
                params![format_ts(&now), id.to_string()],
            )
            .context("Failed to complete task")?;
        if changed == 0 {
            return Err(BoardError::TaskNotFound { id }.into());
        }
        self.get_task(id)?.context("Task not found after completion")
    }

    pub fn assign_task(&self, id: Uuid, assignee_id: Option<Uuid>) -> Result<Task> {
        let changed = self
            .conn
            .execute(
                "UPDATE tasks SET assignee_id = ?1 WHERE id = ?2",
                params![assignee_id.map(|a| a.to_string()), id.to_string()],
            )
            .context("Failed to assign task")?;
        if changed == 0 {
            return Err(BoardError::TaskNotFound { id }.into());
        }
        self.get_task(id)?.context("Task not found after assignment")
    }

    /// Delete a task and close the gap it leaves. Returns the deleted task.
    pub fn delete_task(&self, id: Uuid) -> Result<Option<Task>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let Some(task) = self.get_task(id)? else {
            return Ok(None);
        };
        tx.execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
            .context("Failed to delete task")?;
        tx.execute(
            "UPDATE tasks SET position = position - 1 WHERE column_id = ?1 AND position > ?2",
            params![task.column_id.to_string(), task.position],
        )
        .context("Failed to close gap after delete")?;
        tx.commit().context("Failed to commit task delete")?;
        Ok(Some(task))
    }

    // ── Event log ─────────────────────────────────────────────────────

    /// Append an event. Appending an id that is already logged is a no-op;
    /// returns whether a row was written.
    pub fn append_event(&self, event: &Event, now: DateTime<Utc>) -> Result<bool> {
        let raw = event.to_raw().context("Failed to encode event payload")?;
        let data = serde_json::to_string(&raw.data).context("Failed to serialize event data")?;
        let inserted = self
            .conn
            .execute(
                "INSERT INTO events (id, board_id, user_id, type, data, timestamp, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO NOTHING",
                params![
                    raw.id.to_string(),
                    raw.board_id.to_string(),
                    raw.user_id.to_string(),
                    raw.kind,
                    data,
                    format_ts(&raw.timestamp),
                    format_ts(&now),
                ],
            )
            .context("Failed to append event")?;
        Ok(inserted > 0)
    }

    /// Newest-first page of a board's events plus the total matching count.
    pub fn list_events(&self, board_id: Uuid, query: &EventQuery) -> Result<(Vec<RawEvent>, i64)> {
        let mut args = vec![board_id.to_string()];
        let mut clauses = vec!["board_id = ?1".to_string()];
        if let Some(kind) = &query.kind {
            args.push(kind.clone());
            clauses.push(format!("type = ?{}", args.len()));
        }
        if let Some(since) = &query.since {
            args.push(format_ts(since));
            clauses.push(format!("timestamp >= ?{}", args.len()));
        }
        let filter = clauses.join(" AND ");

        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM events WHERE {}", filter),
                params_from_iter(args.iter()),
                |row| row.get(0),
            )
            .context("Failed to count events")?;

        let sql = format!(
            "SELECT {} FROM events WHERE {} ORDER BY timestamp DESC, seq DESC LIMIT {} OFFSET {}",
            EVENT_COLUMNS, filter, query.limit, query.offset
        );
        let events = self.query_events(&sql, &args)?;
        Ok((events, total))
    }

    /// Logged events in timestamp order, optionally for one board and from
    /// a starting time.
    pub fn replay_events(
        &self,
        board_id: Option<Uuid>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawEvent>> {
        let mut args = Vec::new();
        let mut clauses = vec!["1 = 1".to_string()];
        if let Some(board) = board_id {
            args.push(board.to_string());
            clauses.push(format!("board_id = ?{}", args.len()));
        }
        if let Some(since) = &since {
            args.push(format_ts(since));
            clauses.push(format!("timestamp >= ?{}", args.len()));
        }
        let sql = format!(
            "SELECT {} FROM events WHERE {} ORDER BY timestamp ASC, seq ASC",
            EVENT_COLUMNS,
            clauses.join(" AND ")
        );
        self.query_events(&sql, &args)
    }

    fn query_events(&self, sql: &str, args: &[String]) -> Result<Vec<RawEvent>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare event query")?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), EventRow::from_row)
            .context("Failed to query events")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("Failed to read event row")?.into_raw()?);
        }
        Ok(events)
    }

    // ── Velocity metrics ──────────────────────────────────────────────

    /// Write the velocity columns of the (board, week) row, leaving cycle
    /// time untouched.
    pub fn upsert_velocity(
        &self,
        board_id: Uuid,
        snapshot: &VelocitySnapshot,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO velocity_metrics
                    (board_id, iso_year, sprint_week, week_start, velocity, completed, total_points, throughput, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(board_id, iso_year, sprint_week) DO UPDATE SET
                    velocity = excluded.velocity,
                    completed = excluded.completed,
                    total_points = excluded.total_points,
                    throughput = excluded.throughput,
                    updated_at = excluded.updated_at",
                params![
                    board_id.to_string(),
                    snapshot.window.iso_year,
                    snapshot.window.week,
                    format_ts(&snapshot.window.start),
                    snapshot.velocity,
                    snapshot.completed,
                    snapshot.total_points,
                    snapshot.throughput,
                    format_ts(&now),
                ],
            )
            .context("Failed to upsert velocity")?;
        Ok(())
    }

    /// Write the cycle-time column of the (board, week) row, leaving the
    /// velocity columns untouched.
    pub fn upsert_cycle_time(
        &self,
        board_id: Uuid,
        window: &WeekWindow,
        cycle_time: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO velocity_metrics (board_id, iso_year, sprint_week, week_start, cycle_time, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(board_id, iso_year, sprint_week) DO UPDATE SET
                    cycle_time = excluded.cycle_time,
                    updated_at = excluded.updated_at",
                params![
                    board_id.to_string(),
                    window.iso_year,
                    window.week,
                    format_ts(&window.start),
                    cycle_time,
                    format_ts(&now),
                ],
            )
            .context("Failed to upsert cycle time")?;
        Ok(())
    }

    /// Most recent weeks first.
    pub fn list_velocity(&self, board_id: Uuid, limit: i64) -> Result<Vec<VelocityMetric>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT board_id, iso_year, sprint_week, week_start, velocity, completed, total_points, cycle_time, throughput, updated_at
                 FROM velocity_metrics WHERE board_id = ?1
                 ORDER BY iso_year DESC, sprint_week DESC LIMIT ?2",
            )
            .context("Failed to prepare list_velocity")?;
        let rows = stmt
            .query_map(params![board_id.to_string(), limit], |row| {
                Ok(VelocityRow {
                    board_id: row.get(0)?,
                    iso_year: row.get(1)?,
                    sprint_week: row.get(2)?,
                    week_start: row.get(3)?,
                    velocity: row.get(4)?,
                    completed: row.get(5)?,
                    total_points: row.get(6)?,
                    cycle_time: row.get(7)?,
                    throughput: row.get(8)?,
                    updated_at: row.get(9)?,
                })
            })
            .context("Failed to query velocity")?;
        let mut metrics = Vec::new();
        for row in rows {
            metrics.push(row.context("Failed to read velocity row")?.into_metric()?);
        }
        Ok(metrics)
    }

    // ── Risk predictions ──────────────────────────────────────────────

    pub fn insert_risk(&self, risk: &RiskPrediction) -> Result<()> {
        let data = serde_json::to_string(&risk.data).context("Failed to serialize risk data")?;
        self.conn
            .execute(
                "INSERT INTO risk_predictions (id, board_id, task_id, type, level, score, description, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    risk.id.to_string(),
                    risk.board_id.to_string(),
                    risk.task_id.map(|t| t.to_string()),
                    risk.kind,
                    risk.level.as_str(),
                    risk.score,
                    risk.description,
                    data,
                    format_ts(&risk.created_at),
                ],
            )
            .context("Failed to insert risk prediction")?;
        Ok(())
    }

    /// Newest first, optionally from a starting time.
    pub fn list_risks(
        &self,
        board_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RiskPrediction>> {
        let since = since.map(|s| format_ts(&s)).unwrap_or_default();
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, board_id, task_id, type, level, score, description, data, created_at
                 FROM risk_predictions WHERE board_id = ?1 AND created_at >= ?2
                 ORDER BY created_at DESC",
            )
            .context("Failed to prepare list_risks")?;
        let rows = stmt
            .query_map(params![board_id.to_string(), since], |row| {
                Ok(RiskRow {
                    id: row.get(0)?,
                    board_id: row.get(1)?,
                    task_id: row.get(2)?,
                    kind: row.get(3)?,
                    level: row.get(4)?,
                    score: row.get(5)?,
                    description: row.get(6)?,
                    data: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })
            .context("Failed to query risk predictions")?;
        let mut risks = Vec::new();
        for row in rows {
            risks.push(row.context("Failed to read risk row")?.into_prediction()?);
        }
        Ok(risks)
    }

    // ── Agent actions & dead letters ──────────────────────────────────

    pub fn insert_action(&self, action: &AgentActionRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO agent_actions (id, board_id, type, description, data, status, result, executed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    action.id.to_string(),
                    action.board_id.to_string(),
                    action.kind,
                    action.description,
                    serde_json::to_string(&action.data).context("Failed to serialize action data")?,
                    action.status.as_str(),
                    serde_json::to_string(&action.result)
                        .context("Failed to serialize action result")?,
                    format_ts(&action.executed_at),
                ],
            )
            .context("Failed to insert agent action")?;
        Ok(())
    }

    /// Newest first, optionally for one board.
    pub fn list_actions(&self, board_id: Option<Uuid>) -> Result<Vec<AgentActionRecord>> {
        let (sql, args) = match board_id {
            Some(id) => (
                "SELECT id, board_id, type, description, data, status, result, executed_at
                 FROM agent_actions WHERE board_id = ?1 ORDER BY executed_at DESC",
                vec![id.to_string()],
            ),
            None => (
                "SELECT id, board_id, type, description, data, status, result, executed_at
                 FROM agent_actions ORDER BY executed_at DESC",
                Vec::new(),
            ),
        };
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare list_actions")?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .context("Failed to query agent actions")?;
        let mut actions = Vec::new();
        for row in rows {
            let (id, board_id, kind, description, data, status, result, executed_at) =
                row.context("Failed to read agent action row")?;
            actions.push(AgentActionRecord {
                id: parse_id(&id)?,
                board_id: parse_id(&board_id)?,
                kind,
                description,
                data: parse_json(&data)?,
                status: ActionStatus::from_str(&status)
                    .map_err(|e| anyhow::anyhow!(e))
                    .context("Failed to parse action status")?,
                result: parse_json(&result)?,
                executed_at: parse_ts(&executed_at)?,
            });
        }
        Ok(actions)
    }

    pub fn insert_dead_letter(&self, letter: &DeadLetter) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO dead_letters (id, source, payload, reason, attempts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    letter.id.to_string(),
                    letter.source,
                    serde_json::to_string(&letter.payload)
                        .context("Failed to serialize dead letter payload")?,
                    letter.reason,
                    letter.attempts,
                    format_ts(&letter.created_at),
                ],
            )
            .context("Failed to insert dead letter")?;
        Ok(())
    }

    pub fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, source, payload, reason, attempts, created_at
                 FROM dead_letters ORDER BY created_at",
            )
            .context("Failed to prepare list_dead_letters")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("Failed to query dead letters")?;
        let mut letters = Vec::new();
        for row in rows {
            let (id, source, payload, reason, attempts, created_at) =
                row.context("Failed to read dead letter row")?;
            letters.push(DeadLetter {
                id: parse_id(&id)?,
                source,
                payload: parse_json(&payload)?,
                reason,
                attempts,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(letters)
    }
}

// ── Row helpers ───────────────────────────────────────────────────────

const TASK_COLUMNS: &str =
    "id, board_id, column_id, title, position, story_points, assignee_id, created_at, completed_at, due_date";

const EVENT_COLUMNS: &str = "id, type, board_id, user_id, data, timestamp";

/// Intermediate row struct for columns.
struct ColumnRow {
    id: String,
    board_id: String,
    name: String,
    position: i64,
    wip_limit: i64,
}

impl ColumnRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            board_id: row.get(1)?,
            name: row.get(2)?,
            position: row.get(3)?,
            wip_limit: row.get(4)?,
        })
    }

    fn into_column(self) -> Result<Column> {
        Ok(Column {
            id: parse_id(&self.id)?,
            board_id: parse_id(&self.board_id)?,
            name: self.name,
            position: self.position,
            wip_limit: self.wip_limit,
        })
    }
}

/// Intermediate row struct for tasks.
struct TaskRow {
    id: String,
    board_id: String,
    column_id: String,
    title: String,
    position: i64,
    story_points: i64,
    assignee_id: Option<String>,
    created_at: String,
    completed_at: Option<String>,
    due_date: Option<String>,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            board_id: row.get(1)?,
            column_id: row.get(2)?,
            title: row.get(3)?,
            position: row.get(4)?,
            story_points: row.get(5)?,
            assignee_id: row.get(6)?,
            created_at: row.get(7)?,
            completed_at: row.get(8)?,
            due_date: row.get(9)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        Ok(Task {
            id: parse_id(&self.id)?,
            board_id: parse_id(&self.board_id)?,
            column_id: parse_id(&self.column_id)?,
            title: self.title,
            position: self.position,
            story_points: self.story_points,
            assignee_id: parse_opt_id(self.assignee_id)?,
            created_at: parse_ts(&self.created_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            due_date: parse_opt_ts(self.due_date)?,
        })
    }
}

/// Intermediate row struct for the event log.
struct EventRow {
    id: String,
    kind: String,
    board_id: String,
    user_id: String,
    data: String,
    timestamp: String,
}

impl EventRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            board_id: row.get(2)?,
            user_id: row.get(3)?,
            data: row.get(4)?,
            timestamp: row.get(5)?,
        })
    }

    fn into_raw(self) -> Result<RawEvent> {
        Ok(RawEvent {
            id: parse_id(&self.id)?,
            kind: self.kind,
            board_id: parse_id(&self.board_id)?,
            user_id: parse_id(&self.user_id)?,
            data: parse_json(&self.data)?,
            timestamp: parse_ts(&self.timestamp)?,
        })
    }
}

/// Intermediate row struct for velocity_metrics.
struct VelocityRow {
    board_id: String,
    iso_year: i32,
    sprint_week: u32,
    week_start: String,
    velocity: f64,
    completed: i64,
    total_points: i64,
    cycle_time: f64,
    throughput: i64,
    updated_at: String,
}

impl VelocityRow {
    fn into_metric(self) -> Result<VelocityMetric> {
        Ok(VelocityMetric {
            board_id: parse_id(&self.board_id)?,
            iso_year: self.iso_year,
            sprint_week: self.sprint_week,
            week_start: parse_ts(&self.week_start)?,
            velocity: self.velocity,
            completed: self.completed,
            total_points: self.total_points,
            cycle_time: self.cycle_time,
            throughput: self.throughput,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

/// Intermediate row struct for risk_predictions.
struct RiskRow {
    id: String,
    board_id: String,
    task_id: Option<String>,
    kind: String,
    level: String,
    score: f64,
    description: String,
    data: String,
    created_at: String,
}

impl RiskRow {
    fn into_prediction(self) -> Result<RiskPrediction> {
        Ok(RiskPrediction {
            id: parse_id(&self.id)?,
            board_id: parse_id(&self.board_id)?,
            task_id: parse_opt_id(self.task_id)?,
            kind: self.kind,
            level: RiskLevel::from_str(&self.level)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse risk level")?,
            score: self.score,
            description: self.description,
            data: parse_json(&self.data)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}
