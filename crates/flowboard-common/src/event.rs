//! The event envelope and its typed payloads.
//!
//! On the wire an event is `{id, type, boardId, userId, data, timestamp}` with
//! a free-form `data` object. [`Event`] is the decoded form: `data` has been
//! checked against the payload shape for its `type`, so handlers never look
//! fields up by name.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Decode, DecodeError, Encode};

pub const TASK_CREATED: &str = "task.created";
pub const TASK_UPDATED: &str = "task.updated";
pub const TASK_MOVED: &str = "task.moved";
pub const TASK_DELETED: &str = "task.deleted";
pub const BOARD_CREATED: &str = "board.created";
pub const BOARD_UPDATED: &str = "board.updated";
pub const COLUMN_CREATED: &str = "column.created";
pub const COLUMN_UPDATED: &str = "column.updated";
pub const AGENT_ACTION_EXECUTED: &str = "agent.action.executed";

/// Task status value that marks a `task.updated` event as a completion.
pub const STATUS_COMPLETED: &str = "completed";

/// The JSON envelope exactly as it travels over the bus and the HTTP API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub board_id: Uuid,
    #[serde(default)]
    pub user_id: Uuid,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreated {
    pub task_id: Uuid,
    pub column_id: Uuid,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<Uuid>,
    #[serde(default)]
    pub story_points: i64,
    #[serde(default)]
    pub position: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdated {
    pub task_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_points: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl TaskUpdated {
    pub fn is_completion(&self) -> bool {
        self.status.as_deref() == Some(STATUS_COMPLETED)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMoved {
    pub task_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_column_id: Option<Uuid>,
    pub new_column_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_position: Option<i64>,
    pub new_position: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDeleted {
    pub task_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Payload of both `board.created` and `board.updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardChanged {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnCreated {
    pub column_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub position: i64,
    #[serde(default)]
    pub wip_limit: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnUpdated {
    pub column_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wip_limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentActionExecuted {
    pub action_id: Uuid,
    pub action_type: String,
    pub status: String,
    #[serde(default)]
    pub result: Value,
}

/// Typed event payload, one variant per known event type.
///
/// Types this build does not know are kept verbatim in `Unknown` so they can
/// be logged, stored and acknowledged rather than rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    TaskCreated(TaskCreated),
    TaskUpdated(TaskUpdated),
    TaskMoved(TaskMoved),
    TaskDeleted(TaskDeleted),
    BoardCreated(BoardChanged),
    BoardUpdated(BoardChanged),
    ColumnCreated(ColumnCreated),
    ColumnUpdated(ColumnUpdated),
    AgentActionExecuted(AgentActionExecuted),
    Unknown { kind: String, data: Value },
}

impl EventPayload {
    /// The wire `type` string for this payload.
    pub fn kind(&self) -> &str {
        match self {
            Self::TaskCreated(_) => TASK_CREATED,
            Self::TaskUpdated(_) => TASK_UPDATED,
            Self::TaskMoved(_) => TASK_MOVED,
            Self::TaskDeleted(_) => TASK_DELETED,
            Self::BoardCreated(_) => BOARD_CREATED,
            Self::BoardUpdated(_) => BOARD_UPDATED,
            Self::ColumnCreated(_) => COLUMN_CREATED,
            Self::ColumnUpdated(_) => COLUMN_UPDATED,
            Self::AgentActionExecuted(_) => AGENT_ACTION_EXECUTED,
            Self::Unknown { kind, .. } => kind,
        }
    }

    /// Decode a `data` object according to its event `type`.
    pub fn from_parts(kind: &str, data: Value) -> Result<Self, DecodeError> {
        let data = match data {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        Ok(match kind {
            TASK_CREATED => Self::TaskCreated(payload(kind, data)?),
            TASK_UPDATED => Self::TaskUpdated(payload(kind, data)?),
            TASK_MOVED => Self::TaskMoved(payload(kind, data)?),
            TASK_DELETED => Self::TaskDeleted(payload(kind, data)?),
            BOARD_CREATED => Self::BoardCreated(payload(kind, data)?),
            BOARD_UPDATED => Self::BoardUpdated(payload(kind, data)?),
            COLUMN_CREATED => Self::ColumnCreated(payload(kind, data)?),
            COLUMN_UPDATED => Self::ColumnUpdated(payload(kind, data)?),
            AGENT_ACTION_EXECUTED => Self::AgentActionExecuted(payload(kind, data)?),
            _ => Self::Unknown {
                kind: kind.to_string(),
                data,
            },
        })
    }

    /// Encode back into the free-form `data` object.
    pub fn to_data(&self) -> serde_json::Result<Value> {
        match self {
            Self::TaskCreated(p) => serde_json::to_value(p),
            Self::TaskUpdated(p) => serde_json::to_value(p),
            Self::TaskMoved(p) => serde_json::to_value(p),
            Self::TaskDeleted(p) => serde_json::to_value(p),
            Self::BoardCreated(p) | Self::BoardUpdated(p) => serde_json::to_value(p),
            Self::ColumnCreated(p) => serde_json::to_value(p),
            Self::ColumnUpdated(p) => serde_json::to_value(p),
            Self::AgentActionExecuted(p) => serde_json::to_value(p),
            Self::Unknown { data, .. } => Ok(data.clone()),
        }
    }
}

fn payload<T: DeserializeOwned>(kind: &str, data: Value) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|source| DecodeError::Payload {
        kind: kind.to_string(),
        source,
    })
}

/// An immutable, decoded event.
///
/// An event decoded from the wire keeps the `data` object it arrived with, so
/// logging and republishing it never drops fields the typed payload ignores.
/// Equality compares the decoded form only.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: Uuid,
    pub board_id: Uuid,
    pub user_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
    received_data: Option<Value>,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.board_id == other.board_id
            && self.user_id == other.user_id
            && self.timestamp == other.timestamp
            && self.payload == other.payload
    }
}

impl Event {
    /// A fresh event stamped with a new id and the current time.
    pub fn new(board_id: Uuid, user_id: Uuid, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            board_id,
            user_id,
            timestamp: Utc::now(),
            payload,
            received_data: None,
        }
    }

    pub fn kind(&self) -> &str {
        self.payload.kind()
    }

    pub fn from_raw(raw: RawEvent) -> Result<Self, DecodeError> {
        let payload = EventPayload::from_parts(&raw.kind, raw.data.clone())?;
        Ok(Self {
            id: raw.id,
            board_id: raw.board_id,
            user_id: raw.user_id,
            timestamp: raw.timestamp,
            payload,
            received_data: Some(raw.data),
        })
    }

    /// The wire envelope. Decoded events return their `data` as received;
    /// events built in-process encode their typed payload.
    pub fn to_raw(&self) -> serde_json::Result<RawEvent> {
        let data = match &self.received_data {
            Some(data) => data.clone(),
            None => self.payload.to_data()?,
        };
        Ok(RawEvent {
            id: self.id,
            kind: self.kind().to_string(),
            board_id: self.board_id,
            user_id: self.user_id,
            data,
            timestamp: self.timestamp,
        })
    }
}

impl Decode for Event {
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawEvent = serde_json::from_slice(bytes).map_err(DecodeError::Envelope)?;
        Self::from_raw(raw)
    }
}

impl Encode for Event {
    fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.to_raw()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(kind: &str, data: Value) -> Vec<u8> {
        json!({
            "id": "7f2c1a8e-4a4b-4f59-9a53-2d6d3c8f0a11",
            "type": kind,
            "boardId": "0b7e6f1c-2f0e-4d55-8a0a-0c1f6a3b9e22",
            "userId": "5a1d0c9e-8b7a-4c3d-9e2f-1a0b9c8d7e33",
            "data": data,
            "timestamp": "2024-03-04T10:15:00Z"
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_decode_task_moved() {
        let bytes = envelope(
            TASK_MOVED,
            json!({
                "taskId": "11111111-1111-4111-8111-111111111111",
                "oldColumnId": "22222222-2222-4222-8222-222222222222",
                "newColumnId": "33333333-3333-4333-8333-333333333333",
                "oldPosition": 0,
                "newPosition": 2,
                "beforeTaskId": null
            }),
        );
        let event = Event::decode(&bytes).unwrap();
        assert_eq!(event.kind(), TASK_MOVED);
        match event.payload {
            EventPayload::TaskMoved(moved) => {
                assert_eq!(moved.new_position, 2);
                assert_eq!(moved.old_position, Some(0));
                assert_eq!(
                    moved.new_column_id.to_string(),
                    "33333333-3333-4333-8333-333333333333"
                );
            }
            other => panic!("Expected TaskMoved, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_type_is_kept() {
        let bytes = envelope("suggestion.approved", json!({"suggestionId": "abc"}));
        let event = Event::decode(&bytes).unwrap();
        assert_eq!(event.kind(), "suggestion.approved");
        assert!(matches!(
            event.payload,
            EventPayload::Unknown { ref data, .. } if data["suggestionId"] == "abc"
        ));
    }

    #[test]
    fn test_decode_rejects_malformed_payload() {
        let bytes = envelope(TASK_MOVED, json!({"taskId": "not-a-uuid", "newPosition": 1}));
        let err = Event::decode(&bytes).unwrap_err();
        match err {
            DecodeError::Payload { kind, .. } => assert_eq!(kind, TASK_MOVED),
            other => panic!("Expected Payload error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_bad_envelope() {
        let err = Event::decode(b"{\"id\": 42}").unwrap_err();
        assert!(matches!(err, DecodeError::Envelope(_)));

        let err = Event::decode(b"not json at all").unwrap_err();
        assert!(matches!(err, DecodeError::Envelope(_)));
    }

    #[test]
    fn test_missing_data_decodes_for_optional_payloads() {
        let mut raw: Value = serde_json::from_slice(&envelope(BOARD_CREATED, Value::Null)).unwrap();
        raw.as_object_mut().unwrap().remove("data");
        let event = Event::decode(raw.to_string().as_bytes()).unwrap();
        assert_eq!(
            event.payload,
            EventPayload::BoardCreated(BoardChanged {
                name: String::new(),
                description: String::new(),
            })
        );
    }

    #[test]
    fn test_task_updated_completion() {
        let event = Event::decode(&envelope(
            TASK_UPDATED,
            json!({"taskId": "11111111-1111-4111-8111-111111111111", "status": "completed"}),
        ))
        .unwrap();
        let EventPayload::TaskUpdated(update) = event.payload else {
            panic!("Expected TaskUpdated");
        };
        assert!(update.is_completion());
    }

    #[test]
    fn test_encode_then_decode_is_identity() {
        let event = Event::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            EventPayload::TaskCreated(TaskCreated {
                task_id: Uuid::new_v4(),
                column_id: Uuid::new_v4(),
                title: "Write docs".into(),
                assignee_id: None,
                story_points: 5,
                position: 3,
            }),
        );
        let decoded = Event::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_wire_field_names() {
        let event = Event::new(
            Uuid::nil(),
            Uuid::nil(),
            EventPayload::ColumnUpdated(ColumnUpdated {
                column_id: Uuid::nil(),
                name: None,
                wip_limit: Some(4),
            }),
        );
        let wire: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(wire["type"], COLUMN_UPDATED);
        assert_eq!(wire["boardId"], Uuid::nil().to_string());
        assert_eq!(wire["data"]["wipLimit"], 4);
        assert!(wire["data"].get("name").is_none());
    }

    #[test]
    fn test_reencode_keeps_fields_outside_the_payload() {
        let data = json!({
            "taskId": "11111111-1111-4111-8111-111111111111",
            "columnId": "22222222-2222-4222-8222-222222222222",
            "title": "Ship it",
            "storyPoints": 3,
            "position": 0,
            "description": "keep me",
            "priority": "high",
            "afterTaskId": null
        });
        let event = Event::decode(&envelope(TASK_CREATED, data.clone())).unwrap();
        assert!(matches!(event.payload, EventPayload::TaskCreated(_)));

        let raw = event.to_raw().unwrap();
        assert_eq!(raw.data, data);
        let wire: Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(wire["data"]["description"], "keep me");
        assert_eq!(wire["data"]["priority"], "high");
    }
}
