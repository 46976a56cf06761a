//! Corrective actions proposed by the allocator agent and executed by the
//! board service.

use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RedistributeTasks,
    AdjustWipLimits,
    ReassignOverdue,
    EnforceWipLimits,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RedistributeTasks => "redistribute_tasks",
            Self::AdjustWipLimits => "adjust_wip_limits",
            Self::ReassignOverdue => "reassign_overdue",
            Self::EnforceWipLimits => "enforce_wip_limits",
        }
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "redistribute_tasks" => Ok(Self::RedistributeTasks),
            "adjust_wip_limits" => Ok(Self::AdjustWipLimits),
            "reassign_overdue" => Ok(Self::ReassignOverdue),
            "enforce_wip_limits" => Ok(Self::EnforceWipLimits),
            _ => Err(format!("Invalid action type: {}", s)),
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedistributeTasks {
    pub from_user_id: Uuid,
    pub to_user_id: Uuid,
    pub task_count: i64,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustWipLimits {
    pub column_id: Uuid,
    pub new_limit: i64,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_id: Option<Uuid>,
}

/// Reassign overdue work. With a `task_id` only that task is considered,
/// otherwise every overdue incomplete task on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReassignOverdue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforceWipLimits {
    pub column_id: Uuid,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionPayload {
    RedistributeTasks(RedistributeTasks),
    AdjustWipLimits(AdjustWipLimits),
    ReassignOverdue(ReassignOverdue),
    EnforceWipLimits(EnforceWipLimits),
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::RedistributeTasks(_) => ActionKind::RedistributeTasks,
            Self::AdjustWipLimits(_) => ActionKind::AdjustWipLimits,
            Self::ReassignOverdue(_) => ActionKind::ReassignOverdue,
            Self::EnforceWipLimits(_) => ActionKind::EnforceWipLimits,
        }
    }

    pub fn from_parts(kind: &str, data: Value) -> Result<Self, DecodeError> {
        let parsed = ActionKind::from_str(kind).map_err(|_| DecodeError::UnknownKind {
            what: "action",
            kind: kind.to_string(),
        })?;
        Ok(match parsed {
            ActionKind::RedistributeTasks => Self::RedistributeTasks(action_data(kind, data)?),
            ActionKind::AdjustWipLimits => Self::AdjustWipLimits(action_data(kind, data)?),
            ActionKind::ReassignOverdue => Self::ReassignOverdue(action_data(kind, data)?),
            ActionKind::EnforceWipLimits => Self::EnforceWipLimits(action_data(kind, data)?),
        })
    }

    pub fn to_data(&self) -> serde_json::Result<Value> {
        match self {
            Self::RedistributeTasks(d) => serde_json::to_value(d),
            Self::AdjustWipLimits(d) => serde_json::to_value(d),
            Self::ReassignOverdue(d) => serde_json::to_value(d),
            Self::EnforceWipLimits(d) => serde_json::to_value(d),
        }
    }
}

fn action_data<T: DeserializeOwned>(kind: &str, data: Value) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|source| DecodeError::Payload {
        kind: kind.to_string(),
        source,
    })
}

/// Body of `POST /api/agent/actions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub board_id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub data: Value,
}

impl ActionRequest {
    pub fn new(board_id: Uuid, payload: &ActionPayload) -> serde_json::Result<Self> {
        let kind = payload.kind();
        Ok(Self {
            board_id,
            kind: kind.as_str().to_string(),
            description: format!("Autonomous action: {}", kind),
            data: payload.to_data()?,
        })
    }

    pub fn payload(&self) -> Result<ActionPayload, DecodeError> {
        ActionPayload::from_parts(&self.kind, self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let column_id = Uuid::new_v4();
        let payload = ActionPayload::AdjustWipLimits(AdjustWipLimits {
            column_id,
            new_limit: 5,
            reason: "bottleneck_detected".into(),
            alert_id: None,
        });
        let request = ActionRequest::new(Uuid::nil(), &payload).unwrap();
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["type"], "adjust_wip_limits");
        assert_eq!(wire["description"], "Autonomous action: adjust_wip_limits");
        assert_eq!(wire["data"]["newLimit"], 5);
        assert_eq!(wire["data"]["columnId"], column_id.to_string());
        assert_eq!(request.payload().unwrap(), payload);
    }

    #[test]
    fn test_unknown_action_type_is_rejected() {
        let err = ActionPayload::from_parts("create_subtasks", json!({})).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownKind { what: "action", .. }));
    }

    #[test]
    fn test_malformed_action_data_is_rejected() {
        let err = ActionPayload::from_parts("redistribute_tasks", json!({"taskCount": 2}))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Payload { .. }));
    }
}
