use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use flowboard_common::event::{
    BoardChanged, ColumnCreated, ColumnUpdated, STATUS_COMPLETED, TaskCreated, TaskDeleted,
    TaskMoved, TaskUpdated,
};
use flowboard_common::{Event, EventPayload, RawEvent, RiskAlert, RiskLevel, RiskPrediction};
use flowboard_common::{ActionRequest, event::AgentActionExecuted};

use super::actions::execute_action;
use super::db::DbHandle;
#[cfg(test)]
use super::db::BoardDb;
use super::models::{ActionStatus, AgentActionRecord, EventQuery, NewTask};
use crate::bus::{MessageBus, publish_alert};
use crate::config::ProjectionsConfig;
use crate::errors::BoardError;
use crate::events::EventLog;
use crate::projections::{self, velocity::SUMMARY_WEEKS};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub events: EventLog,
    pub bus: Arc<dyn MessageBus>,
    pub projections: ProjectionsConfig,
}

impl AppState {
    pub fn new(db: DbHandle, bus: Arc<dyn MessageBus>, projections: ProjectionsConfig) -> Self {
        Self {
            events: EventLog::new(db.clone(), bus.clone()),
            db,
            bus,
            projections,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBoardRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_by: Option<Uuid>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateColumnRequest {
    pub name: String,
    #[serde(default)]
    pub wip_limit: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateColumnRequest {
    pub name: Option<String>,
    pub wip_limit: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub board_id: Uuid,
    pub column_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub story_points: i64,
    pub assignee_id: Option<Uuid>,
    pub due_date: Option<DateTime<Utc>>,
    pub user_id: Option<Uuid>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveTaskRequest {
    pub column_id: Uuid,
    pub position: i64,
    pub user_id: Option<Uuid>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEventRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub board_id: Uuid,
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAlertRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub board_id: Uuid,
    pub task_id: Option<Uuid>,
    pub level: RiskLevel,
    pub score: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Deserialize)]
pub struct EventListParams {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize)]
pub struct SinceParams {
    pub since: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct DaysParams {
    pub days: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionListParams {
    pub board_id: Option<Uuid>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<BoardError>() {
            Some(
                BoardError::BoardNotFound { .. }
                | BoardError::ColumnNotFound { .. }
                | BoardError::TaskNotFound { .. },
            ) => ApiError::NotFound(err.to_string()),
            Some(
                BoardError::CrossBoardMove { .. }
                | BoardError::InvalidAction(_)
                | BoardError::Decode(_),
            ) => ApiError::BadRequest(err.to_string()),
            _ => {
                tracing::error!(error = %format!("{:#}", err), "request failed");
                ApiError::Internal(format!("{:#}", err))
            }
        }
    }
}

impl From<flowboard_common::DecodeError> for ApiError {
    fn from(err: flowboard_common::DecodeError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/events", post(create_event))
        .route("/api/boards", post(create_board))
        .route("/api/boards/{id}", get(get_board))
        .route("/api/boards/{id}/events", get(list_board_events))
        .route("/api/boards/{id}/columns", post(create_column))
        .route("/api/boards/{id}/risks", get(list_risks))
        .route("/api/columns/{id}", patch(update_column))
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/{id}", axum::routing::delete(delete_task))
        .route("/api/tasks/{id}/move", patch(move_task))
        .route("/api/tasks/{id}/complete", post(complete_task))
        .route("/api/risk-alerts", post(create_risk_alert))
        .route("/api/agent/actions", get(list_actions).post(execute_agent_action))
        .route("/api/analytics/board/{id}/velocity", get(velocity_analytics))
        .route("/api/analytics/board/{id}/burndown", get(burndown_analytics))
        .route("/api/analytics/board/{id}/risk-trends", get(risk_trend_analytics))
        .route(
            "/api/analytics/board/{id}/team-performance",
            get(team_performance_analytics),
        )
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Append to the log and publish. Failing to log fails the request; failing
/// to publish does not.
async fn emit(state: &SharedState, board_id: Uuid, user_id: Uuid, payload: EventPayload) -> Result<(), ApiError> {
    state
        .events
        .record_and_publish(Event::new(board_id, user_id, payload))
        .await
        .map_err(ApiError::from)
}

async fn require_board(state: &SharedState, board_id: Uuid) -> Result<(), ApiError> {
    state
        .db
        .call(move |db| {
            db.get_board(board_id)?
                .ok_or(BoardError::BoardNotFound { id: board_id })?;
            Ok(())
        })
        .await
        .map_err(ApiError::from)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> Json<Value> {
    Json(json!({"status": "ok", "timestamp": Utc::now()}))
}

async fn create_event(
    State(state): State<SharedState>,
    Json(req): Json<CreateEventRequest>,
) -> Result<(StatusCode, Json<RawEvent>), ApiError> {
    if req.kind.trim().is_empty() {
        return Err(ApiError::BadRequest("Event type must not be empty".into()));
    }
    let raw = RawEvent {
        id: Uuid::new_v4(),
        kind: req.kind,
        board_id: req.board_id,
        user_id: req.user_id.unwrap_or(Uuid::nil()),
        data: req.data,
        timestamp: Utc::now(),
    };
    let event = Event::from_raw(raw)?;
    state.events.record_and_publish(event.clone()).await?;
    let raw = event
        .to_raw()
        .map_err(|e| ApiError::Internal(format!("Failed to encode event: {}", e)))?;
    Ok((StatusCode::CREATED, Json(raw)))
}

async fn list_board_events(
    State(state): State<SharedState>,
    Path(board_id): Path<Uuid>,
    Query(params): Query<EventListParams>,
) -> Result<Json<Value>, ApiError> {
    let query = EventQuery::new(params.kind, params.since, params.limit, params.offset);
    let (limit, offset) = (query.limit, query.offset);
    let (events, total) = state.events.list(board_id, query).await?;
    Ok(Json(json!({
        "events": events,
        "pagination": {"total": total, "limit": limit, "offset": offset},
    })))
}

async fn create_board(
    State(state): State<SharedState>,
    Json(req): Json<CreateBoardRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::BadRequest("Board name must not be empty".into()));
    }
    let created_by = req.created_by.unwrap_or(Uuid::nil());
    let description = req.description;
    let board = state
        .db
        .call(move |db| db.create_board(&name, &description, created_by, Utc::now()))
        .await?;
    emit(
        &state,
        board.id,
        created_by,
        EventPayload::BoardCreated(BoardChanged {
            name: board.name.clone(),
            description: board.description.clone(),
        }),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(json!(board))))
}

async fn get_board(
    State(state): State<SharedState>,
    Path(board_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let (board, columns, tasks) = state
        .db
        .call(move |db| {
            let board = db
                .get_board(board_id)?
                .ok_or(BoardError::BoardNotFound { id: board_id })?;
            Ok((board, db.list_columns(board_id)?, db.list_tasks(board_id)?))
        })
        .await?;
    Ok(Json(json!({"board": board, "columns": columns, "tasks": tasks})))
}

async fn create_column(
    State(state): State<SharedState>,
    Path(board_id): Path<Uuid>,
    Json(req): Json<CreateColumnRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Column name must not be empty".into()));
    }
    if req.wip_limit < 0 {
        return Err(ApiError::BadRequest("WIP limit must not be negative".into()));
    }
    let column = state
        .db
        .call(move |db| db.create_column(board_id, req.name.trim(), req.wip_limit))
        .await?;
    emit(
        &state,
        board_id,
        Uuid::nil(),
        EventPayload::ColumnCreated(ColumnCreated {
            column_id: column.id,
            name: column.name.clone(),
            position: column.position,
            wip_limit: column.wip_limit,
        }),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(json!(column))))
}

async fn update_column(
    State(state): State<SharedState>,
    Path(column_id): Path<Uuid>,
    Json(req): Json<UpdateColumnRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.name.is_none() && req.wip_limit.is_none() {
        return Err(ApiError::BadRequest("Nothing to update".into()));
    }
    if req.wip_limit.is_some_and(|l| l < 0) {
        return Err(ApiError::BadRequest("WIP limit must not be negative".into()));
    }
    let name = req.name.clone();
    let wip_limit = req.wip_limit;
    let column = state
        .db
        .call(move |db| db.update_column(column_id, name.as_deref(), wip_limit))
        .await?;
    emit(
        &state,
        column.board_id,
        Uuid::nil(),
        EventPayload::ColumnUpdated(ColumnUpdated {
            column_id,
            name: req.name,
            wip_limit: req.wip_limit,
        }),
    )
    .await?;
    Ok(Json(json!(column)))
}

async fn create_task(
    State(state): State<SharedState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let title = req.title.trim().to_string();
    if title.is_empty() {
        return Err(ApiError::BadRequest("Task title must not be empty".into()));
    }
    if req.story_points < 0 {
        return Err(ApiError::BadRequest("Story points must not be negative".into()));
    }
    let new = NewTask {
        board_id: req.board_id,
        column_id: req.column_id,
        title,
        story_points: req.story_points,
        assignee_id: req.assignee_id,
        due_date: req.due_date,
    };
    let task = state
        .db
        .call(move |db| db.create_task(&new, Utc::now()))
        .await?;
    emit(
        &state,
        task.board_id,
        req.user_id.unwrap_or(Uuid::nil()),
        EventPayload::TaskCreated(TaskCreated {
            task_id: task.id,
            column_id: task.column_id,
            title: task.title.clone(),
            assignee_id: task.assignee_id,
            story_points: task.story_points,
            position: task.position,
        }),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(json!(task))))
}

async fn move_task(
    State(state): State<SharedState>,
    Path(task_id): Path<Uuid>,
    Json(req): Json<MoveTaskRequest>,
) -> Result<Json<Value>, ApiError> {
    let column_id = req.column_id;
    let position = req.position;
    let moved = state
        .db
        .call(move |db| db.move_task(task_id, column_id, position))
        .await?;
    emit(
        &state,
        moved.task.board_id,
        req.user_id.unwrap_or(Uuid::nil()),
        EventPayload::TaskMoved(TaskMoved {
            task_id,
            old_column_id: Some(moved.old_column_id),
            new_column_id: moved.task.column_id,
            old_position: Some(moved.old_position),
            new_position: moved.task.position,
        }),
    )
    .await?;
    Ok(Json(json!(moved.task)))
}

/// Completing an already completed task is accepted but emits nothing.
async fn complete_task(
    State(state): State<SharedState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let (was_completed, task) = state
        .db
        .call(move |db| {
            let before = db
                .get_task(task_id)?
                .ok_or(BoardError::TaskNotFound { id: task_id })?;
            let after = db.complete_task(task_id, Utc::now())?;
            Ok((before.is_completed(), after))
        })
        .await?;
    if !was_completed {
        emit(
            &state,
            task.board_id,
            task.assignee_id.unwrap_or(Uuid::nil()),
            EventPayload::TaskUpdated(TaskUpdated {
                task_id,
                title: None,
                story_points: None,
                assignee_id: None,
                old_status: None,
                status: Some(STATUS_COMPLETED.to_string()),
            }),
        )
        .await?;
    }
    Ok(Json(json!(task)))
}

async fn delete_task(
    State(state): State<SharedState>,
    Path(task_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let task = state
        .db
        .call(move |db| db.delete_task(task_id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", task_id)))?;
    emit(
        &state,
        task.board_id,
        Uuid::nil(),
        EventPayload::TaskDeleted(TaskDeleted {
            task_id,
            column_id: Some(task.column_id),
            title: Some(task.title),
        }),
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_risks(
    State(state): State<SharedState>,
    Path(board_id): Path<Uuid>,
    Query(params): Query<SinceParams>,
) -> Result<Json<Vec<RiskPrediction>>, ApiError> {
    let risks = state
        .db
        .call(move |db| db.list_risks(board_id, params.since))
        .await?;
    Ok(Json(risks))
}

/// Entry point for externally computed risks: persist, then alert the agent.
async fn create_risk_alert(
    State(state): State<SharedState>,
    Json(req): Json<RiskAlertRequest>,
) -> Result<(StatusCode, Json<RiskPrediction>), ApiError> {
    if !(0.0..=1.0).contains(&req.score) {
        return Err(ApiError::BadRequest("Score must be between 0 and 1".into()));
    }
    require_board(&state, req.board_id).await?;
    let prediction = RiskPrediction {
        id: Uuid::new_v4(),
        board_id: req.board_id,
        task_id: req.task_id,
        kind: req.kind,
        level: req.level,
        score: req.score,
        description: req.description,
        data: req.data,
        created_at: Utc::now(),
    };
    let alert = RiskAlert::from_prediction(&prediction)?;

    let stored = prediction.clone();
    state.db.call(move |db| db.insert_risk(&stored)).await?;

    if let Err(e) = publish_alert(state.bus.as_ref(), &alert).await {
        tracing::warn!(alert_id = %alert.id, board_id = %alert.board_id, error = %e, "failed to publish risk alert");
    }
    Ok((StatusCode::CREATED, Json(prediction)))
}

async fn list_actions(
    State(state): State<SharedState>,
    Query(params): Query<ActionListParams>,
) -> Result<Json<Vec<AgentActionRecord>>, ApiError> {
    let actions = state
        .db
        .call(move |db| db.list_actions(params.board_id))
        .await?;
    Ok(Json(actions))
}

/// Execute an action now and record the outcome. Responds 201 only when the
/// action succeeded; a failed execution is still recorded and announced.
async fn execute_agent_action(
    State(state): State<SharedState>,
    Json(req): Json<ActionRequest>,
) -> Result<(StatusCode, Json<AgentActionRecord>), ApiError> {
    let payload = req.payload()?;
    require_board(&state, req.board_id).await?;

    let board_id = req.board_id;
    let (record, updated_column, failure) = state
        .db
        .call(move |db| {
            let now = Utc::now();
            let (status, result, column, failure) = match execute_action(db, board_id, &payload, now) {
                Ok(outcome) => (ActionStatus::Completed, outcome.result, outcome.updated_column, None),
                Err(e) => (
                    ActionStatus::Failed,
                    json!({"error": e.to_string()}),
                    None,
                    Some(e),
                ),
            };
            let record = AgentActionRecord {
                id: Uuid::new_v4(),
                board_id,
                kind: req.kind,
                description: req.description,
                data: req.data,
                status,
                result,
                executed_at: now,
            };
            db.insert_action(&record)?;
            Ok((record, column, failure))
        })
        .await?;

    tracing::info!(
        action_id = %record.id,
        action_type = %record.kind,
        %board_id,
        status = record.status.as_str(),
        "agent action executed"
    );

    if let Some(column) = updated_column {
        emit(
            &state,
            board_id,
            Uuid::nil(),
            EventPayload::ColumnUpdated(ColumnUpdated {
                column_id: column.id,
                name: None,
                wip_limit: Some(column.wip_limit),
            }),
        )
        .await?;
    }
    emit(
        &state,
        board_id,
        Uuid::nil(),
        EventPayload::AgentActionExecuted(AgentActionExecuted {
            action_id: record.id,
            action_type: record.kind.clone(),
            status: record.status.as_str().to_string(),
            result: record.result.clone(),
        }),
    )
    .await?;

    match failure {
        Some(e) => Err(ApiError::from(e)),
        None => Ok((StatusCode::CREATED, Json(record))),
    }
}

// ── Analytics ─────────────────────────────────────────────────────────

async fn velocity_analytics(
    State(state): State<SharedState>,
    Path(board_id): Path<Uuid>,
) -> Result<Json<projections::VelocitySummary>, ApiError> {
    require_board(&state, board_id).await?;
    let weeks = state
        .db
        .call(move |db| db.list_velocity(board_id, SUMMARY_WEEKS))
        .await?;
    Ok(Json(projections::velocity_summary(weeks)))
}

/// The requested `?days=` window, or the configured default.
fn window_days(requested: Option<u32>, default: u32) -> Result<u32, ApiError> {
    let days = requested.unwrap_or(default);
    if (1..=projections::MAX_WINDOW_DAYS).contains(&days) {
        Ok(days)
    } else {
        Err(ApiError::BadRequest(format!(
            "days must be between 1 and {}",
            projections::MAX_WINDOW_DAYS
        )))
    }
}

async fn burndown_analytics(
    State(state): State<SharedState>,
    Path(board_id): Path<Uuid>,
    Query(params): Query<DaysParams>,
) -> Result<Json<Vec<projections::BurndownPoint>>, ApiError> {
    let days = window_days(params.days, state.projections.sprint_days)?;
    require_board(&state, board_id).await?;
    let tasks = state.db.call(move |db| db.list_tasks(board_id)).await?;
    Ok(Json(projections::burndown(&tasks, days, Utc::now())))
}

async fn risk_trend_analytics(
    State(state): State<SharedState>,
    Path(board_id): Path<Uuid>,
    Query(params): Query<DaysParams>,
) -> Result<Json<Vec<projections::RiskTrendPoint>>, ApiError> {
    let days = window_days(params.days, state.projections.risk_trend_days)?;
    require_board(&state, board_id).await?;
    let now = Utc::now();
    let since = now - chrono::Duration::days(i64::from(days));
    let (risks, tasks) = state
        .db
        .call(move |db| Ok((db.list_risks(board_id, Some(since))?, db.list_tasks(board_id)?)))
        .await?;
    Ok(Json(projections::risk_trend(&risks, &tasks, days, now)))
}

async fn team_performance_analytics(
    State(state): State<SharedState>,
    Path(board_id): Path<Uuid>,
) -> Result<Json<Vec<projections::MemberPerformance>>, ApiError> {
    require_board(&state, board_id).await?;
    let tasks = state.db.call(move |db| db.list_tasks(board_id)).await?;
    Ok(Json(projections::team_performance(&tasks, Utc::now())))
}
