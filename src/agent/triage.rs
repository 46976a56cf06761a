//! Turning risk alerts and workload snapshots into corrective actions.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use flowboard_common::action::{AdjustWipLimits, EnforceWipLimits, ReassignOverdue, RedistributeTasks};
use flowboard_common::{ActionPayload, AlertKind, RiskAlert};

use super::queue::{PRIORITY_DEADLINE, PRIORITY_STRUCTURAL, PRIORITY_WORKLOAD, PendingAction};
use crate::projections::MemberPerformance;

const OVERLOAD_TASKS: i64 = 6;
const OVERLOAD_POINTS: i64 = 20;
const TASKS_AT_FULL_CAPACITY: f64 = 10.0;
const UNDERUTILIZED_TASKS: i64 = 2;
const UNDERUTILIZED_CAPACITY: f64 = 0.3;
/// Tasks moved per redistribution.
pub const REDISTRIBUTE_COUNT: i64 = 2;
/// Headroom added to a bottlenecked column's limit.
pub const WIP_HEADROOM: i64 = 2;

/// Load estimate for one board member.
///
/// The analytics endpoint reports completions, not open work, so completed
/// tasks stand in for active ones.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadAnalysis {
    pub user_id: Uuid,
    pub name: String,
    pub active_tasks: i64,
    pub total_story_points: i64,
    pub avg_cycle_time: f64,
    pub capacity: f64,
    pub is_overloaded: bool,
}

impl WorkloadAnalysis {
    pub fn from_performance(member: &MemberPerformance) -> Self {
        let active_tasks = member.completed_tasks;
        Self {
            user_id: member.user_id,
            name: member.name.clone(),
            active_tasks,
            total_story_points: member.total_story_points,
            avg_cycle_time: member.average_cycle_time,
            capacity: 1.0 - active_tasks as f64 / TASKS_AT_FULL_CAPACITY,
            is_overloaded: active_tasks > OVERLOAD_TASKS
                || member.total_story_points > OVERLOAD_POINTS,
        }
    }

    /// Overloaded members never count as underutilized, even with few tasks.
    pub fn is_underutilized(&self) -> bool {
        !self.is_overloaded
            && self.active_tasks < UNDERUTILIZED_TASKS
            && self.capacity > UNDERUTILIZED_CAPACITY
    }
}

pub fn analyze_workload(members: &[MemberPerformance]) -> Vec<WorkloadAnalysis> {
    members.iter().map(WorkloadAnalysis::from_performance).collect()
}

/// The non-overloaded member with the fewest active tasks, other than
/// `exclude`. The first one wins a tie.
pub fn least_loaded_target(analysis: &[WorkloadAnalysis], exclude: Uuid) -> Option<&WorkloadAnalysis> {
    let mut best: Option<&WorkloadAnalysis> = None;
    for member in analysis {
        if member.user_id == exclude || member.is_overloaded {
            continue;
        }
        if best.is_none_or(|b| member.active_tasks < b.active_tasks) {
            best = Some(member);
        }
    }
    best
}

/// Action for an alert that needs no workload data. Overload alerts go
/// through [`overload_action`] instead.
pub fn alert_action(alert: &RiskAlert, now: DateTime<Utc>) -> Option<PendingAction> {
    let alert_id = Some(alert.id);
    let (priority, payload) = match &alert.kind {
        AlertKind::Bottleneck(data) => (
            PRIORITY_STRUCTURAL,
            ActionPayload::AdjustWipLimits(AdjustWipLimits {
                column_id: data.column_id,
                new_limit: data.wip_limit + WIP_HEADROOM,
                reason: "bottleneck_detected".into(),
                alert_id,
            }),
        ),
        AlertKind::DeadlineRisk(data) => (
            PRIORITY_DEADLINE,
            ActionPayload::ReassignOverdue(ReassignOverdue {
                task_id: Some(data.task_id),
                reason: "deadline_risk".into(),
                alert_id,
            }),
        ),
        AlertKind::WipViolation(data) => (
            PRIORITY_STRUCTURAL,
            ActionPayload::EnforceWipLimits(EnforceWipLimits {
                column_id: data.column_id,
                reason: "wip_violation".into(),
                alert_id,
            }),
        ),
        AlertKind::Overload(_) => return None,
        AlertKind::Unknown { kind, .. } => {
            tracing::warn!(alert_id = %alert.id, alert_type = %kind, "unknown alert type, ignoring");
            return None;
        }
    };
    Some(PendingAction::new(alert.board_id, priority, payload, now))
}

/// Move work from `overloaded` to the least-loaded eligible member, if any.
pub fn overload_action(
    alert: &RiskAlert,
    overloaded: Uuid,
    members: &[MemberPerformance],
    now: DateTime<Utc>,
) -> Option<PendingAction> {
    let analysis = analyze_workload(members);
    let Some(target) = least_loaded_target(&analysis, overloaded) else {
        tracing::warn!(
            alert_id = %alert.id,
            board_id = %alert.board_id,
            user_id = %overloaded,
            "no eligible member to take work, dropping overload alert"
        );
        return None;
    };
    Some(PendingAction::new(
        alert.board_id,
        PRIORITY_WORKLOAD,
        ActionPayload::RedistributeTasks(RedistributeTasks {
            from_user_id: overloaded,
            to_user_id: target.user_id,
            task_count: REDISTRIBUTE_COUNT,
            reason: "workload_balancing".into(),
            alert_id: Some(alert.id),
        }),
        now,
    ))
}

/// Pair the i-th overloaded member with the i-th underutilized one.
/// Overloaded members without a partner wait for the next cycle.
pub fn rebalancing_actions(
    board_id: Uuid,
    analysis: &[WorkloadAnalysis],
    now: DateTime<Utc>,
) -> Vec<PendingAction> {
    let overloaded = analysis.iter().filter(|m| m.is_overloaded);
    let underutilized = analysis.iter().filter(|m| m.is_underutilized());
    overloaded
        .zip(underutilized)
        .map(|(from, to)| {
            PendingAction::new(
                board_id,
                PRIORITY_STRUCTURAL,
                ActionPayload::RedistributeTasks(RedistributeTasks {
                    from_user_id: from.user_id,
                    to_user_id: to.user_id,
                    task_count: REDISTRIBUTE_COUNT,
                    reason: "proactive_balancing".into(),
                    alert_id: None,
                }),
                now,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowboard_common::RiskLevel;
    use flowboard_common::risk::{BottleneckData, DeadlineRiskData, OverloadData};
    use serde_json::json;

    fn member(completed: i64, points: i64) -> MemberPerformance {
        MemberPerformance {
            user_id: Uuid::new_v4(),
            name: format!("member-{}", completed),
            completed_tasks: completed,
            total_story_points: points,
            average_cycle_time: 1.5,
            velocity: 0.0,
            efficiency_score: 0.0,
        }
    }

    fn alert(kind: AlertKind) -> RiskAlert {
        RiskAlert {
            id: Uuid::new_v4(),
            board_id: Uuid::new_v4(),
            level: RiskLevel::High,
            score: 0.8,
            timestamp: Utc::now(),
            kind,
        }
    }

    #[test]
    fn test_workload_thresholds() {
        let busy = WorkloadAnalysis::from_performance(&member(7, 3));
        assert!(busy.is_overloaded);
        assert!((busy.capacity - 0.3).abs() < 1e-9);

        let heavy_points = WorkloadAnalysis::from_performance(&member(2, 21));
        assert!(heavy_points.is_overloaded);

        let idle = WorkloadAnalysis::from_performance(&member(1, 2));
        assert!(!idle.is_overloaded);
        assert!(idle.is_underutilized());

        let steady = WorkloadAnalysis::from_performance(&member(6, 20));
        assert!(!steady.is_overloaded);
        assert!(!steady.is_underutilized());
    }

    #[test]
    fn test_least_loaded_target_first_wins_ties() {
        let overloaded = member(9, 30);
        let a = member(3, 5);
        let b = member(1, 2);
        let c = member(1, 4);
        let analysis = analyze_workload(&[overloaded.clone(), a, b.clone(), c]);
        let target = least_loaded_target(&analysis, overloaded.user_id).unwrap();
        assert_eq!(target.user_id, b.user_id);
    }

    #[test]
    fn test_least_loaded_target_skips_self_and_overloaded() {
        let me = member(0, 0);
        let other = member(8, 0);
        let analysis = analyze_workload(&[me.clone(), other]);
        assert!(least_loaded_target(&analysis, me.user_id).is_none());
    }

    #[test]
    fn test_alert_actions_by_type() {
        let column_id = Uuid::new_v4();
        let bottleneck = alert(AlertKind::Bottleneck(BottleneckData {
            column_id,
            column_name: "Doing".into(),
            task_count: 6,
            wip_limit: 4,
            overflow_by: 2,
        }));
        let action = alert_action(&bottleneck, Utc::now()).unwrap();
        assert_eq!(action.priority, PRIORITY_STRUCTURAL);
        assert_eq!(action.board_id, bottleneck.board_id);
        match action.payload {
            ActionPayload::AdjustWipLimits(d) => {
                assert_eq!(d.column_id, column_id);
                assert_eq!(d.new_limit, 6);
                assert_eq!(d.alert_id, Some(bottleneck.id));
            }
            other => panic!("unexpected payload {:?}", other),
        }

        let task_id = Uuid::new_v4();
        let deadline = alert(AlertKind::DeadlineRisk(DeadlineRiskData { task_id }));
        let action = alert_action(&deadline, Utc::now()).unwrap();
        assert_eq!(action.priority, PRIORITY_DEADLINE);
        assert!(matches!(
            action.payload,
            ActionPayload::ReassignOverdue(ReassignOverdue { task_id: Some(t), .. }) if t == task_id
        ));

        let unknown = alert(AlertKind::Unknown {
            kind: "sentiment".into(),
            data: json!({}),
        });
        assert!(alert_action(&unknown, Utc::now()).is_none());
    }

    #[test]
    fn test_overload_action_targets_least_loaded() {
        let overloaded = member(9, 30);
        let target = member(0, 0);
        let a = alert(AlertKind::Overload(OverloadData {
            user_id: overloaded.user_id,
        }));
        let members = vec![overloaded.clone(), member(4, 8), target.clone()];
        let action = overload_action(&a, overloaded.user_id, &members, Utc::now()).unwrap();
        assert_eq!(action.priority, PRIORITY_WORKLOAD);
        match action.payload {
            ActionPayload::RedistributeTasks(d) => {
                assert_eq!(d.from_user_id, overloaded.user_id);
                assert_eq!(d.to_user_id, target.user_id);
                assert_eq!(d.task_count, 2);
                assert_eq!(d.reason, "workload_balancing");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_overload_without_target_yields_nothing() {
        let overloaded = member(9, 30);
        let a = alert(AlertKind::Overload(OverloadData {
            user_id: overloaded.user_id,
        }));
        let members = vec![overloaded.clone(), member(8, 1)];
        assert!(overload_action(&a, overloaded.user_id, &members, Utc::now()).is_none());
    }

    #[test]
    fn test_rebalancing_pairs_positionally() {
        let board = Uuid::new_v4();
        let o1 = member(7, 0);
        let o2 = member(8, 0);
        let o3 = member(9, 0);
        let u1 = member(0, 0);
        let u2 = member(1, 0);
        let analysis = analyze_workload(&[o1.clone(), u1.clone(), o2.clone(), o3, u2.clone()]);
        let actions = rebalancing_actions(board, &analysis, Utc::now());
        assert_eq!(actions.len(), 2);

        let pairs: Vec<_> = actions
            .iter()
            .map(|a| match &a.payload {
                ActionPayload::RedistributeTasks(d) => {
                    assert_eq!(d.reason, "proactive_balancing");
                    assert_eq!(a.priority, PRIORITY_STRUCTURAL);
                    (d.from_user_id, d.to_user_id)
                }
                other => panic!("unexpected payload {:?}", other),
            })
            .collect();
        assert_eq!(pairs, vec![(o1.user_id, u1.user_id), (o2.user_id, u2.user_id)]);
    }

    #[test]
    fn test_point_heavy_member_is_not_paired_with_itself() {
        let board = Uuid::new_v4();
        // One task but 25 points: overloaded on points, idle on task count.
        let heavy = member(1, 25);
        let idle = member(0, 0);
        let analysis = analyze_workload(&[heavy.clone(), idle.clone()]);
        assert!(analysis[0].is_overloaded);
        assert!(!analysis[0].is_underutilized());

        let actions = rebalancing_actions(board, &analysis, Utc::now());
        assert_eq!(actions.len(), 1);
        match &actions[0].payload {
            ActionPayload::RedistributeTasks(d) => {
                assert_eq!(d.from_user_id, heavy.user_id);
                assert_eq!(d.to_user_id, idle.user_id);
            }
            other => panic!("unexpected payload {:?}", other),
        }

        let alone = analyze_workload(&[heavy]);
        assert!(rebalancing_actions(board, &alone, Utc::now()).is_empty());
    }
}
