//! Allocator agent: consumes risk alerts, queues corrective actions and
//! executes them against the board service on a timer.
//!
//! Three loops share one [`AllocatorAgent`]: the alert consumer, the
//! periodic workload analysis and the action executor. A fourth task serves
//! the agent's small HTTP surface (see [`routes`]).

pub mod client;
pub mod queue;
pub mod routes;
pub mod triage;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use flowboard_common::{AlertKind, RiskAlert};

use crate::bus::{ConsumerConfig, Handler, MessageBus, RISK_QUEUE, run_consumer};
use crate::config::FlowConfig;
pub use client::{
    ActionExecutor, BoardApiClient, BoardDirectory, DbBoardDirectory, DbDeadLetterSink,
    DeadLetterSink, WorkloadSource,
};
pub use queue::{ActionQueue, PendingAction, Retry};

/// Outcome of one execution batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub executed: usize,
    pub retried: usize,
    pub dropped: usize,
}

pub struct AllocatorAgent {
    queue: ActionQueue,
    workloads: Arc<dyn WorkloadSource>,
    executor: Arc<dyn ActionExecutor>,
    boards: Arc<dyn BoardDirectory>,
    dead_letters: Arc<dyn DeadLetterSink>,
    max_retries: u32,
    active: AtomicBool,
    last_analysis: RwLock<Option<DateTime<Utc>>>,
}

impl AllocatorAgent {
    pub fn new(
        workloads: Arc<dyn WorkloadSource>,
        executor: Arc<dyn ActionExecutor>,
        boards: Arc<dyn BoardDirectory>,
        dead_letters: Arc<dyn DeadLetterSink>,
        max_retries: u32,
    ) -> Self {
        Self {
            queue: ActionQueue::new(),
            workloads,
            executor,
            boards,
            dead_letters,
            max_retries,
            active: AtomicBool::new(true),
            last_analysis: RwLock::new(None),
        }
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
        tracing::info!(active, "agent activation changed");
    }

    pub async fn last_analysis(&self) -> Option<DateTime<Utc>> {
        *self.last_analysis.read().await
    }

    /// Derive at most one action from `alert` and queue it.
    ///
    /// Fails only when the workload snapshot for an overload alert cannot be
    /// fetched, so the alert is redelivered later.
    pub async fn triage(&self, alert: RiskAlert) -> Result<()> {
        let now = Utc::now();
        tracing::info!(
            alert_id = %alert.id,
            alert_type = alert.kind.as_str(),
            board_id = %alert.board_id,
            level = %alert.level,
            "risk alert received"
        );

        let action = match &alert.kind {
            AlertKind::Overload(data) => {
                let members = self
                    .workloads
                    .team_performance(alert.board_id)
                    .await
                    .context("Failed to fetch workload for overload alert")?;
                triage::overload_action(&alert, data.user_id, &members, now)
            }
            _ => triage::alert_action(&alert, now),
        };

        if let Some(action) = action {
            self.queue.push(action).await;
        }
        Ok(())
    }

    /// Look for imbalances on every board and queue rebalancing actions.
    /// A board whose workload cannot be fetched is skipped this round.
    pub async fn run_analysis(&self) -> Result<usize> {
        let now = Utc::now();
        let board_ids = self.boards.board_ids().await?;
        let mut queued = 0;

        for board_id in board_ids {
            let members = match self.workloads.team_performance(board_id).await {
                Ok(members) => members,
                Err(e) => {
                    tracing::warn!(%board_id, error = %e, "workload fetch failed, skipping board");
                    continue;
                }
            };
            let analysis = triage::analyze_workload(&members);
            for action in triage::rebalancing_actions(board_id, &analysis, now) {
                self.queue.push(action).await;
                queued += 1;
            }
        }

        *self.last_analysis.write().await = Some(now);
        tracing::info!(queued, "workload analysis finished");
        Ok(queued)
    }

    /// Attempt every queued action once, most urgent first.
    pub async fn execute_pending(&self) -> ExecutionSummary {
        let mut summary = ExecutionSummary::default();
        let batch = self.queue.take_batch().await;
        if batch.is_empty() {
            return summary;
        }
        tracing::debug!(count = batch.len(), "executing pending actions");

        for action in batch {
            let outcome = match action.request() {
                Ok(request) => self.executor.execute(&request).await.map_err(|e| e.to_string()),
                Err(e) => Err(format!("failed to encode action: {}", e)),
            };

            let error = match outcome {
                Ok(()) => {
                    tracing::info!(
                        action_id = %action.id,
                        action_type = %action.kind(),
                        board_id = %action.board_id,
                        "action executed"
                    );
                    summary.executed += 1;
                    continue;
                }
                Err(error) => error,
            };

            match action.fail(self.max_retries) {
                Retry::Again(action) => {
                    tracing::warn!(
                        action_id = %action.id,
                        action_type = %action.kind(),
                        retry_count = action.retry_count,
                        error = %error,
                        "action failed, will retry"
                    );
                    self.queue.push(action).await;
                    summary.retried += 1;
                }
                Retry::Exhausted(action) => {
                    tracing::warn!(
                        action_id = %action.id,
                        action_type = %action.kind(),
                        board_id = %action.board_id,
                        retry_count = action.retry_count,
                        error = %error,
                        "action failed too many times, dropping"
                    );
                    let reason = format!("retries exhausted: {}", error);
                    if let Err(e) = self.dead_letters.dead_letter(&action, &reason).await {
                        tracing::error!(action_id = %action.id, error = %e, "failed to dead-letter action");
                    }
                    summary.dropped += 1;
                }
            }
        }
        summary
    }

    /// Run workload analysis every `period` until cancelled. The first run
    /// happens one period after start.
    pub async fn run_analysis_loop(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.is_active() {
                continue;
            }
            if let Err(e) = self.run_analysis().await {
                tracing::warn!(error = %e, "workload analysis failed");
            }
        }
        tracing::info!("analysis loop stopped");
    }

    /// Execute the pending queue every `period` until cancelled.
    pub async fn run_execution_loop(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.is_active() {
                continue;
            }
            let summary = self.execute_pending().await;
            if summary != ExecutionSummary::default() {
                tracing::info!(
                    executed = summary.executed,
                    retried = summary.retried,
                    dropped = summary.dropped,
                    "execution batch finished"
                );
            }
        }
        tracing::info!("execution loop stopped");
    }
}

#[async_trait]
impl Handler<RiskAlert> for AllocatorAgent {
    async fn handle(&self, alert: RiskAlert) -> Result<()> {
        self.triage(alert).await
    }
}

/// Run the agent until `shutdown` fires: alert consumer, both timers and
/// the HTTP surface.
pub async fn run_agent(
    agent: Arc<AllocatorAgent>,
    bus: Arc<dyn MessageBus>,
    config: &FlowConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let consumer = tokio::spawn(run_consumer::<RiskAlert, _>(
        bus,
        RISK_QUEUE,
        agent.clone(),
        ConsumerConfig::from_bus_config(&config.bus),
        shutdown.clone(),
    ));
    let analysis = tokio::spawn(
        agent
            .clone()
            .run_analysis_loop(config.agent.analysis_interval(), shutdown.clone()),
    );
    let execution = tokio::spawn(
        agent
            .clone()
            .run_execution_loop(config.agent.execute_interval(), shutdown.clone()),
    );

    let addr = format!("{}:{}", config.agent.host, config.agent.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    tracing::info!(addr = %listener.local_addr()?, "agent listening");

    let token = shutdown.clone();
    let served = axum::serve(listener, routes::router(agent))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("Agent server error");

    // The server can also stop on error; make sure the loops follow.
    shutdown.cancel();
    let (consumer, analysis, execution) = tokio::join!(consumer, analysis, execution);
    consumer.context("Alert consumer panicked")?;
    analysis.context("Analysis loop panicked")?;
    execution.context("Execution loop panicked")?;
    served
}
