//! Derived views over board state.
//!
//! Every function here is pure over a snapshot of tasks (and, where needed,
//! columns, predictions or stored weekly metrics) plus an explicit `now`.
//! Recomputing from the same state always yields the same result, which is
//! what makes the event processor safe under redelivery.

pub mod bottleneck;
pub mod burndown;
pub mod risk_trend;
pub mod team;
pub mod velocity;

use chrono::{DateTime, Duration, Utc};

pub use bottleneck::{Bottleneck, bottlenecks};
pub use burndown::{BurndownPoint, burndown};
pub use risk_trend::{RiskTrendPoint, risk_trend};
pub use team::{MemberPerformance, team_performance};
pub use velocity::{
    VelocitySnapshot, VelocitySummary, VelocityTrend, WeekWindow, cycle_time_days, velocity,
    velocity_summary,
};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Longest daily series the burndown and risk-trend views will build.
pub const MAX_WINDOW_DAYS: u32 = 365;

/// Clamp a requested window into `1..=MAX_WINDOW_DAYS`.
pub(crate) fn window_days(days: u32) -> i64 {
    i64::from(days.clamp(1, MAX_WINDOW_DAYS))
}

/// `days` before `t`, saturating at the earliest representable instant.
pub(crate) fn days_before(t: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    t.checked_sub_signed(Duration::days(days))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Calendar date label used by the daily series.
pub(crate) fn day_label(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d").to_string()
}

/// Fractional days between two instants.
pub(crate) fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0 / SECONDS_PER_DAY
}
