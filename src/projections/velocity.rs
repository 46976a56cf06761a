use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use serde::Serialize;

use super::days_between;
use crate::board::models::{Task, VelocityMetric};

/// Number of stored weeks the summary looks back over.
pub const SUMMARY_WEEKS: i64 = 12;

/// An ISO calendar week, Monday 00:00 UTC inclusive to the next Monday exclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct WeekWindow {
    pub iso_year: i32,
    pub week: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl WeekWindow {
    pub fn containing(now: DateTime<Utc>) -> Self {
        let iso = now.iso_week();
        let monday =
            now.date_naive() - Duration::days(i64::from(now.weekday().num_days_from_monday()));
        let start = monday.and_time(NaiveTime::MIN).and_utc();
        Self {
            iso_year: iso.year(),
            week: iso.week(),
            start,
            end: start + Duration::days(7),
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }
}

/// Velocity columns of one (board, week) metrics row.
#[derive(Debug, Clone, PartialEq)]
pub struct VelocitySnapshot {
    pub window: WeekWindow,
    pub velocity: f64,
    pub completed: i64,
    pub total_points: i64,
    pub throughput: i64,
}

/// Points completed this ISO week divided by (completions + 1).
///
/// The `+ 1` keeps an empty week at zero and matches historical rows, so it
/// stays even though it understates small weeks.
pub fn velocity(tasks: &[Task], now: DateTime<Utc>) -> VelocitySnapshot {
    let window = WeekWindow::containing(now);
    let (completed, total_points) = tasks
        .iter()
        .filter(|t| t.completed_at.is_some_and(|at| window.contains(at)))
        .fold((0i64, 0i64), |(n, points), t| (n + 1, points + t.story_points));
    VelocitySnapshot {
        window,
        velocity: total_points as f64 / (completed + 1) as f64,
        completed,
        total_points,
        throughput: completed,
    }
}

/// Mean days from creation to completion over every completed task of the
/// board. `None` when nothing has been completed yet.
pub fn cycle_time_days(tasks: &[Task]) -> Option<f64> {
    let durations: Vec<f64> = tasks
        .iter()
        .filter_map(|t| t.completed_at.map(|done| days_between(t.created_at, done)))
        .collect();
    if durations.is_empty() {
        return None;
    }
    Some(durations.iter().sum::<f64>() / durations.len() as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VelocityTrend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VelocitySummary {
    pub current_velocity: f64,
    pub average_velocity: f64,
    pub velocity_trend: VelocityTrend,
    pub weekly_metrics: Vec<VelocityMetric>,
    pub predicted_velocity: f64,
}

/// Summarize stored weekly rows, newest first.
pub fn velocity_summary(weekly_metrics: Vec<VelocityMetric>) -> VelocitySummary {
    let values: Vec<f64> = weekly_metrics.iter().map(|m| m.velocity).collect();
    let current = values.first().copied().unwrap_or(0.0);
    let average = if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    };

    let trend = match values.get(1) {
        Some(&previous) if current > previous * 1.1 => VelocityTrend::Increasing,
        Some(&previous) if current < previous * 0.9 => VelocityTrend::Decreasing,
        _ => VelocityTrend::Stable,
    };

    // Slope over the last three weeks.
    let predicted = match values.get(2) {
        Some(&oldest) => current + (current - oldest) / 2.0,
        None => current,
    };

    VelocitySummary {
        current_velocity: current,
        average_velocity: average,
        velocity_trend: trend,
        weekly_metrics,
        predicted_velocity: predicted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn task(points: i64, created: DateTime<Utc>, completed: Option<DateTime<Utc>>) -> Task {
        Task {
            id: Uuid::new_v4(),
            board_id: Uuid::nil(),
            column_id: Uuid::nil(),
            title: "t".into(),
            position: 0,
            story_points: points,
            assignee_id: None,
            created_at: created,
            completed_at: completed,
            due_date: None,
        }
    }

    fn metric(velocity: f64, week: u32) -> VelocityMetric {
        let now = Utc::now();
        VelocityMetric {
            board_id: Uuid::nil(),
            iso_year: 2026,
            sprint_week: week,
            week_start: now,
            velocity,
            completed: 0,
            total_points: 0,
            cycle_time: 0.0,
            throughput: 0,
            updated_at: now,
        }
    }

    #[test]
    fn test_week_window_starts_monday() {
        // Thursday 2026-10-15
        let now = Utc.with_ymd_and_hms(2026, 10, 15, 17, 30, 0).unwrap();
        let w = WeekWindow::containing(now);
        assert_eq!(w.start, Utc.with_ymd_and_hms(2026, 10, 12, 0, 0, 0).unwrap());
        assert_eq!(w.end, Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap());
        assert_eq!(w.week, 42);
        assert_eq!(w.iso_year, 2026);
        assert!(w.contains(now));
        assert!(!w.contains(w.end));
    }

    #[test]
    fn test_week_window_iso_year_boundary() {
        // 2027-01-01 is a Friday in ISO week 53 of 2026.
        let now = Utc.with_ymd_and_hms(2027, 1, 1, 9, 0, 0).unwrap();
        let w = WeekWindow::containing(now);
        assert_eq!(w.iso_year, 2026);
        assert_eq!(w.week, 53);
    }

    #[test]
    fn test_velocity_empty_week_is_zero() {
        let snap = velocity(&[], Utc::now());
        assert_eq!(snap.velocity, 0.0);
        assert_eq!(snap.completed, 0);
        assert_eq!(snap.throughput, 0);
    }

    #[test]
    fn test_velocity_counts_only_this_week() {
        let now = Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap();
        let last_week = now - Duration::days(7);
        let tasks = vec![
            task(5, now - Duration::days(10), Some(now - Duration::hours(3))),
            task(8, now - Duration::days(10), Some(now - Duration::days(1))),
            task(13, now - Duration::days(10), Some(last_week)),
            task(3, now - Duration::days(1), None),
        ];
        let snap = velocity(&tasks, now);
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.total_points, 13);
        assert!((snap.velocity - 13.0 / 3.0).abs() < 1e-9);

        // Recomputing from the same state gives the same answer.
        assert_eq!(velocity(&tasks, now), snap);
    }

    #[test]
    fn test_cycle_time_mean_days() {
        let now = Utc::now();
        let tasks = vec![
            task(1, now - Duration::days(4), Some(now - Duration::days(2))),
            task(1, now - Duration::days(4), Some(now)),
            task(1, now - Duration::days(9), None),
        ];
        let mean = cycle_time_days(&tasks).unwrap();
        assert!((mean - 3.0).abs() < 1e-9);
        assert_eq!(cycle_time_days(&tasks[2..]), None);
    }

    #[test]
    fn test_summary_trend_and_prediction() {
        let s = velocity_summary(vec![metric(12.0, 3), metric(10.0, 2), metric(8.0, 1)]);
        assert_eq!(s.current_velocity, 12.0);
        assert_eq!(s.average_velocity, 10.0);
        assert_eq!(s.velocity_trend, VelocityTrend::Increasing);
        assert_eq!(s.predicted_velocity, 14.0);

        let s = velocity_summary(vec![metric(10.0, 2), metric(10.5, 1)]);
        assert_eq!(s.velocity_trend, VelocityTrend::Stable);
        assert_eq!(s.predicted_velocity, 10.0);

        let s = velocity_summary(vec![metric(5.0, 2), metric(10.0, 1)]);
        assert_eq!(s.velocity_trend, VelocityTrend::Decreasing);
    }

    #[test]
    fn test_summary_empty() {
        let s = velocity_summary(Vec::new());
        assert_eq!(s.current_velocity, 0.0);
        assert_eq!(s.average_velocity, 0.0);
        assert_eq!(s.velocity_trend, VelocityTrend::Stable);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["velocityTrend"], "stable");
    }
}
