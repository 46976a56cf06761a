//! Risk predictions and the alerts derived from them.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Decode, DecodeError, Encode};

pub const BOTTLENECK: &str = "bottleneck";
pub const OVERLOAD: &str = "overload";
pub const DEADLINE_RISK: &str = "deadline_risk";
pub const WIP_VIOLATION: &str = "wip_violation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid risk level: {}", s)),
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted risk finding. Append-only: predictions are never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskPrediction {
    pub id: Uuid,
    pub board_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub kind: String,
    pub level: RiskLevel,
    pub score: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

/// `data` of a bottleneck alert, as written by WIP analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BottleneckData {
    pub column_id: Uuid,
    #[serde(default)]
    pub column_name: String,
    #[serde(default)]
    pub task_count: i64,
    pub wip_limit: i64,
    #[serde(default)]
    pub overflow_by: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverloadData {
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadlineRiskData {
    pub task_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WipViolationData {
    pub column_id: Uuid,
}

/// Alert payload, keyed by the alert `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertKind {
    Bottleneck(BottleneckData),
    Overload(OverloadData),
    DeadlineRisk(DeadlineRiskData),
    WipViolation(WipViolationData),
    Unknown { kind: String, data: Value },
}

impl AlertKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Bottleneck(_) => BOTTLENECK,
            Self::Overload(_) => OVERLOAD,
            Self::DeadlineRisk(_) => DEADLINE_RISK,
            Self::WipViolation(_) => WIP_VIOLATION,
            Self::Unknown { kind, .. } => kind,
        }
    }

    pub fn from_parts(kind: &str, data: Value) -> Result<Self, DecodeError> {
        Ok(match kind {
            BOTTLENECK => Self::Bottleneck(alert_data(kind, data)?),
            OVERLOAD => Self::Overload(alert_data(kind, data)?),
            DEADLINE_RISK => Self::DeadlineRisk(alert_data(kind, data)?),
            WIP_VIOLATION => Self::WipViolation(alert_data(kind, data)?),
            _ => Self::Unknown {
                kind: kind.to_string(),
                data,
            },
        })
    }

    pub fn to_data(&self) -> serde_json::Result<Value> {
        match self {
            Self::Bottleneck(d) => serde_json::to_value(d),
            Self::Overload(d) => serde_json::to_value(d),
            Self::DeadlineRisk(d) => serde_json::to_value(d),
            Self::WipViolation(d) => serde_json::to_value(d),
            Self::Unknown { data, .. } => Ok(data.clone()),
        }
    }
}

fn alert_data<T: DeserializeOwned>(kind: &str, data: Value) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|source| DecodeError::Payload {
        kind: kind.to_string(),
        source,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRiskAlert {
    id: Uuid,
    #[serde(rename = "type")]
    kind: String,
    board_id: Uuid,
    level: RiskLevel,
    score: f64,
    #[serde(default)]
    data: Value,
    timestamp: DateTime<Utc>,
}

/// A risk alert as consumed by the allocator agent.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskAlert {
    pub id: Uuid,
    pub board_id: Uuid,
    pub level: RiskLevel,
    pub score: f64,
    pub timestamp: DateTime<Utc>,
    pub kind: AlertKind,
}

impl RiskAlert {
    /// Routing key the alert is published under on the risk exchange.
    pub fn routing_key(&self) -> String {
        format!("risk.{}", self.kind.as_str())
    }

    /// Build the alert announcing a freshly persisted prediction.
    pub fn from_prediction(prediction: &RiskPrediction) -> Result<Self, DecodeError> {
        Ok(Self {
            id: prediction.id,
            board_id: prediction.board_id,
            level: prediction.level,
            score: prediction.score,
            timestamp: prediction.created_at,
            kind: AlertKind::from_parts(&prediction.kind, prediction.data.clone())?,
        })
    }
}

impl Decode for RiskAlert {
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawRiskAlert = serde_json::from_slice(bytes).map_err(DecodeError::Envelope)?;
        Ok(Self {
            id: raw.id,
            board_id: raw.board_id,
            level: raw.level,
            score: raw.score,
            timestamp: raw.timestamp,
            kind: AlertKind::from_parts(&raw.kind, raw.data)?,
        })
    }
}

impl Encode for RiskAlert {
    fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&RawRiskAlert {
            id: self.id,
            kind: self.kind.as_str().to_string(),
            board_id: self.board_id,
            level: self.level,
            score: self.score,
            data: self.kind.to_data()?,
            timestamp: self.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_risk_level_round_trip_strings() {
        for level in [RiskLevel::Low, RiskLevel::Medium, RiskLevel::High, RiskLevel::Critical] {
            assert_eq!(RiskLevel::from_str(level.as_str()).unwrap(), level);
        }
        assert!(RiskLevel::from_str("severe").is_err());
    }

    #[test]
    fn test_decode_bottleneck_alert() {
        let body = json!({
            "id": "7f2c1a8e-4a4b-4f59-9a53-2d6d3c8f0a11",
            "type": "bottleneck",
            "boardId": "0b7e6f1c-2f0e-4d55-8a0a-0c1f6a3b9e22",
            "level": "high",
            "score": 0.8,
            "data": {
                "columnId": "33333333-3333-4333-8333-333333333333",
                "columnName": "In Progress",
                "taskCount": 4,
                "wipLimit": 3,
                "overflowBy": 1
            },
            "timestamp": "2024-03-04T10:15:00Z"
        });
        let alert = RiskAlert::decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(alert.routing_key(), "risk.bottleneck");
        assert_eq!(alert.level, RiskLevel::High);
        match alert.kind {
            AlertKind::Bottleneck(data) => {
                assert_eq!(data.wip_limit, 3);
                assert_eq!(data.overflow_by, 1);
            }
            other => panic!("Expected Bottleneck, got {:?}", other),
        }
    }

    #[test]
    fn test_overload_alert_requires_user() {
        let body = json!({
            "id": "7f2c1a8e-4a4b-4f59-9a53-2d6d3c8f0a11",
            "type": "overload",
            "boardId": "0b7e6f1c-2f0e-4d55-8a0a-0c1f6a3b9e22",
            "level": "medium",
            "score": 0.5,
            "data": {},
            "timestamp": "2024-03-04T10:15:00Z"
        });
        let err = RiskAlert::decode(body.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, DecodeError::Payload { ref kind, .. } if kind == "overload"));
    }

    #[test]
    fn test_alert_from_prediction() {
        let prediction = RiskPrediction {
            id: Uuid::new_v4(),
            board_id: Uuid::new_v4(),
            task_id: None,
            kind: WIP_VIOLATION.into(),
            level: RiskLevel::Medium,
            score: 0.6,
            description: "too many tasks".into(),
            data: json!({"columnId": "33333333-3333-4333-8333-333333333333"}),
            created_at: Utc::now(),
        };
        let alert = RiskAlert::from_prediction(&prediction).unwrap();
        assert_eq!(alert.id, prediction.id);
        assert_eq!(alert.routing_key(), "risk.wip_violation");

        let decoded = RiskAlert::decode(&alert.encode().unwrap()).unwrap();
        assert_eq!(decoded, alert);
    }
}
