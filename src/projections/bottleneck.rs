use chrono::{DateTime, Utc};
use uuid::Uuid;

use flowboard_common::risk::{BOTTLENECK, BottleneckData};
use flowboard_common::{RiskLevel, RiskPrediction};

use crate::board::models::{Column, Task};

/// Score attached to every WIP-limit bottleneck finding.
pub const BOTTLENECK_SCORE: f64 = 0.8;

/// A column holding more tasks than its WIP limit allows.
#[derive(Debug, Clone, PartialEq)]
pub struct Bottleneck {
    pub board_id: Uuid,
    pub column_id: Uuid,
    pub column_name: String,
    pub task_count: i64,
    pub wip_limit: i64,
}

impl Bottleneck {
    pub fn overflow_by(&self) -> i64 {
        self.task_count - self.wip_limit
    }

    pub fn description(&self) -> String {
        format!(
            "Column '{}' exceeds WIP limit: {}/{} tasks",
            self.column_name, self.task_count, self.wip_limit
        )
    }

    /// The append-only prediction row recording this finding.
    pub fn to_prediction(&self, now: DateTime<Utc>) -> serde_json::Result<RiskPrediction> {
        let data = serde_json::to_value(BottleneckData {
            column_id: self.column_id,
            column_name: self.column_name.clone(),
            task_count: self.task_count,
            wip_limit: self.wip_limit,
            overflow_by: self.overflow_by(),
        })?;
        Ok(RiskPrediction {
            id: Uuid::new_v4(),
            board_id: self.board_id,
            task_id: None,
            kind: BOTTLENECK.to_string(),
            level: RiskLevel::High,
            score: BOTTLENECK_SCORE,
            description: self.description(),
            data,
            created_at: now,
        })
    }
}

/// Every column with a positive WIP limit whose task count exceeds it.
/// Every task sitting in the column counts, completed or not.
pub fn bottlenecks(columns: &[Column], tasks: &[Task]) -> Vec<Bottleneck> {
    columns
        .iter()
        .filter(|c| c.wip_limit > 0)
        .filter_map(|c| {
            let task_count = tasks.iter().filter(|t| t.column_id == c.id).count() as i64;
            (task_count > c.wip_limit).then(|| Bottleneck {
                board_id: c.board_id,
                column_id: c.id,
                column_name: c.name.clone(),
                task_count,
                wip_limit: c.wip_limit,
            })
        })
        .collect()
}
