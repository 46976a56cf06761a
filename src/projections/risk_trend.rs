use chrono::{DateTime, Utc};
use serde::Serialize;

use flowboard_common::{RiskLevel, RiskPrediction};

use super::{day_label, days_before, window_days};
use crate::board::models::Task;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskTrendPoint {
    pub date: String,
    pub high_risk: i64,
    pub medium_risk: i64,
    pub low_risk: i64,
    pub total_tasks: i64,
}

/// Daily prediction counts by level over the `days` ending today, oldest first.
/// `total_tasks` is how many of the given tasks existed by the end of each day.
pub fn risk_trend(
    risks: &[RiskPrediction],
    tasks: &[Task],
    days: u32,
    now: DateTime<Utc>,
) -> Vec<RiskTrendPoint> {
    let days = window_days(days);
    (0..days)
        .rev()
        .map(|back| {
            let day = days_before(now, back);
            let date = day.date_naive();
            let count_level = |level: RiskLevel| {
                risks
                    .iter()
                    .filter(|r| r.level == level && r.created_at.date_naive() == date)
                    .count() as i64
            };
            RiskTrendPoint {
                date: day_label(day),
                high_risk: count_level(RiskLevel::High),
                medium_risk: count_level(RiskLevel::Medium),
                low_risk: count_level(RiskLevel::Low),
                total_tasks: tasks
                    .iter()
                    .filter(|t| t.created_at.date_naive() <= date)
                    .count() as i64,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn prediction(level: RiskLevel, at: DateTime<Utc>) -> RiskPrediction {
        RiskPrediction {
            id: Uuid::new_v4(),
            board_id: Uuid::nil(),
            task_id: None,
            kind: "bottleneck".into(),
            level,
            score: 0.8,
            description: String::new(),
            data: serde_json::Value::Null,
            created_at: at,
        }
    }

    fn task(created: DateTime<Utc>) -> Task {
        Task {
            id: Uuid::new_v4(),
            board_id: Uuid::nil(),
            column_id: Uuid::nil(),
            title: "t".into(),
            position: 0,
            story_points: 1,
            assignee_id: None,
            created_at: created,
            completed_at: None,
            due_date: None,
        }
    }

    #[test]
    fn test_risk_trend_buckets_by_day_and_level() {
        let now = Utc.with_ymd_and_hms(2026, 10, 15, 18, 0, 0).unwrap();
        let risks = vec![
            prediction(RiskLevel::High, now - Duration::hours(1)),
            prediction(RiskLevel::High, now - Duration::hours(2)),
            prediction(RiskLevel::Low, now - Duration::days(1)),
            prediction(RiskLevel::Medium, now - Duration::days(40)),
        ];
        let tasks = vec![task(now - Duration::days(5)), task(now - Duration::hours(3))];

        let trend = risk_trend(&risks, &tasks, 30, now);
        assert_eq!(trend.len(), 30);
        let today = &trend[29];
        assert_eq!(today.date, "2026-10-15");
        assert_eq!(today.high_risk, 2);
        assert_eq!(today.total_tasks, 2);

        let yesterday = &trend[28];
        assert_eq!(yesterday.low_risk, 1);
        assert_eq!(yesterday.high_risk, 0);
        assert_eq!(yesterday.total_tasks, 1);

        assert_eq!(trend[0].date, "2026-09-16");
        assert_eq!(trend.iter().map(|p| p.medium_risk).sum::<i64>(), 0);
    }

    #[test]
    fn test_risk_trend_window_is_capped() {
        let now = Utc::now();
        assert_eq!(risk_trend(&[], &[], u32::MAX, now).len(), 365);
        assert_eq!(risk_trend(&[], &[], 0, now).len(), 1);
    }
}
