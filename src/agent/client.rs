//! The agent's collaborators: where workloads come from, where actions go,
//! which boards exist and where exhausted actions end up.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use uuid::Uuid;

use flowboard_common::ActionRequest;

use super::queue::PendingAction;
use crate::board::db::DbHandle;
use crate::board::models::DeadLetter;
use crate::errors::AgentError;
use crate::projections::MemberPerformance;

/// Source tag on dead letters written by the agent.
pub const DEAD_LETTER_SOURCE: &str = "agent.action";

#[async_trait]
pub trait WorkloadSource: Send + Sync {
    async fn team_performance(&self, board_id: Uuid) -> Result<Vec<MemberPerformance>, AgentError>;
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Succeeds only when the board service reports the action as created.
    async fn execute(&self, request: &ActionRequest) -> Result<(), AgentError>;
}

#[async_trait]
pub trait BoardDirectory: Send + Sync {
    async fn board_ids(&self) -> anyhow::Result<Vec<Uuid>>;
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, action: &PendingAction, reason: &str) -> anyhow::Result<()>;
}

/// HTTP client for the board service's analytics and action endpoints.
#[derive(Clone)]
pub struct BoardApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl BoardApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("flowboard-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl WorkloadSource for BoardApiClient {
    async fn team_performance(&self, board_id: Uuid) -> Result<Vec<MemberPerformance>, AgentError> {
        let url = format!(
            "{}/api/analytics/board/{}/team-performance",
            self.base_url, board_id
        );
        let members = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<MemberPerformance>>()
            .await?;
        Ok(members)
    }
}

#[async_trait]
impl ActionExecutor for BoardApiClient {
    async fn execute(&self, request: &ActionRequest) -> Result<(), AgentError> {
        let url = format!("{}/api/agent/actions", self.base_url);
        let resp = self.client.post(&url).json(request).send().await?;
        let status = resp.status();
        if status != StatusCode::CREATED {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::UnexpectedStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Board ids read straight from the board database.
#[derive(Clone)]
pub struct DbBoardDirectory {
    db: DbHandle,
}

impl DbBoardDirectory {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BoardDirectory for DbBoardDirectory {
    async fn board_ids(&self) -> anyhow::Result<Vec<Uuid>> {
        self.db.call(|db| db.list_board_ids()).await
    }
}

/// Persists exhausted actions to the `dead_letters` table.
#[derive(Clone)]
pub struct DbDeadLetterSink {
    db: DbHandle,
}

impl DbDeadLetterSink {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DeadLetterSink for DbDeadLetterSink {
    async fn dead_letter(&self, action: &PendingAction, reason: &str) -> anyhow::Result<()> {
        let payload = serde_json::to_value(action.view())
            .context("Failed to serialize dead-lettered action")?;
        let letter = DeadLetter {
            id: Uuid::new_v4(),
            source: DEAD_LETTER_SOURCE.to_string(),
            payload,
            reason: reason.to_string(),
            attempts: i64::from(action.retry_count),
            created_at: Utc::now(),
        };
        self.db.call(move |db| db.insert_dead_letter(&letter)).await
    }
}
