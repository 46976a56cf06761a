use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::days_between;
use crate::board::models::Task;

const DAYS_PER_WEEK: f64 = 7.0;
const MAX_EFFICIENCY: f64 = 100.0;

/// One row of the team-performance report, also the workload snapshot the
/// allocator agent consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberPerformance {
    pub user_id: Uuid,
    pub name: String,
    pub completed_tasks: i64,
    pub total_story_points: i64,
    pub average_cycle_time: f64,
    pub velocity: f64,
    #[serde(default)]
    pub efficiency_score: f64,
}

/// Per-assignee performance over a board's tasks, ordered by user id.
///
/// Everyone with at least one task on the board gets a row, even with no
/// completions yet. Velocity is points per week since the earliest-created
/// completed task.
pub fn team_performance(tasks: &[Task], now: DateTime<Utc>) -> Vec<MemberPerformance> {
    let mut by_user: BTreeMap<Uuid, Vec<&Task>> = BTreeMap::new();
    for task in tasks {
        if let Some(user) = task.assignee_id {
            by_user.entry(user).or_default().push(task);
        }
    }

    by_user
        .into_iter()
        .map(|(user_id, assigned)| {
            let done: Vec<&Task> = assigned
                .into_iter()
                .filter(|t| t.is_completed())
                .collect();
            let completed_tasks = done.len() as i64;
            let total_story_points: i64 = done.iter().map(|t| t.story_points).sum();

            let average_cycle_time = if done.is_empty() {
                0.0
            } else {
                done.iter()
                    .filter_map(|t| t.completed_at.map(|at| days_between(t.created_at, at)))
                    .sum::<f64>()
                    / done.len() as f64
            };

            let velocity = done
                .iter()
                .map(|t| t.created_at)
                .min()
                .map(|first| days_between(first, now) / DAYS_PER_WEEK)
                .filter(|weeks| *weeks > 0.0)
                .map(|weeks| total_story_points as f64 / weeks)
                .unwrap_or(0.0);

            let efficiency_score = if average_cycle_time > 0.0 {
                (velocity / average_cycle_time * 10.0).min(MAX_EFFICIENCY)
            } else {
                0.0
            };

            MemberPerformance {
                user_id,
                name: user_id.to_string(),
                completed_tasks,
                total_story_points,
                average_cycle_time,
                velocity,
                efficiency_score,
            }
        })
        .collect()
}
