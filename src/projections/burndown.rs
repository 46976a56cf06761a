use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::{day_label, days_before, window_days};
use crate::board::models::Task;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BurndownPoint {
    pub date: String,
    pub remaining: i64,
    pub ideal: i64,
    pub actual: i64,
    pub total_story_points: i64,
}

/// Daily burndown over the sprint ending at `now`.
///
/// Scope is fixed at sprint start: tasks created after it do not raise the
/// total. The series has `sprint_days + 1` points, day 0 through the last day,
/// with `sprint_days` clamped to [`MAX_WINDOW_DAYS`](super::MAX_WINDOW_DAYS).
pub fn burndown(tasks: &[Task], sprint_days: u32, now: DateTime<Utc>) -> Vec<BurndownPoint> {
    let days = window_days(sprint_days);
    let sprint_start = days_before(now, days);

    let total: i64 = tasks
        .iter()
        .filter(|t| t.created_at <= sprint_start)
        .map(|t| t.story_points)
        .sum();

    (0..=days)
        .map(|i| {
            let day = sprint_start + Duration::days(i);
            let completed: i64 = tasks
                .iter()
                .filter(|t| t.completed_at.is_some_and(|at| at <= day))
                .map(|t| t.story_points)
                .sum();
            let remaining = total - completed;
            BurndownPoint {
                date: day_label(day),
                remaining,
                ideal: total - total * i / days,
                actual: remaining,
                total_story_points: total,
            }
        })
        .collect()
}
