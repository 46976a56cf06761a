//! Typed error hierarchy for flowboard.
//!
//! Four enums cover the subsystems:
//! - `PublishError`: handing a message to the bus failed
//! - `BusError`: broker bookkeeping (fetch, ack, nack, recovery) failed
//! - `BoardError`: board persistence and action execution
//! - `AgentError`: the allocator agent's outbound calls
//!
//! Message decoding failures are `flowboard_common::DecodeError`.

use thiserror::Error;
use uuid::Uuid;

pub use flowboard_common::DecodeError;

/// Failure to publish a message. Producers treat this as non-fatal: the event
/// is already in the log, so only propagation is delayed.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Exchange '{exchange}' is not declared")]
    UnknownExchange { exchange: String },

    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Bus storage unavailable: {0}")]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Queue '{queue}' is not declared")]
    UnknownQueue { queue: String },

    #[error("Delivery {tag} is not outstanding")]
    UnknownDelivery { tag: i64 },

    #[error("Bus storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Board {id} not found")]
    BoardNotFound { id: Uuid },

    #[error("Column {id} not found")]
    ColumnNotFound { id: Uuid },

    #[error("Task {id} not found")]
    TaskNotFound { id: Uuid },

    #[error("Column {column_id} belongs to a different board than task {task_id}")]
    CrossBoardMove { task_id: Uuid, column_id: Uuid },

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected HTTP status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_error_unknown_exchange_carries_name() {
        let err = PublishError::UnknownExchange {
            exchange: "flowboard.nowhere".into(),
        };
        assert!(err.to_string().contains("flowboard.nowhere"));
    }

    #[test]
    fn bus_error_converts_from_publish_error() {
        let inner = PublishError::Storage(anyhow::anyhow!("disk full"));
        let err: BusError = inner.into();
        match &err {
            BusError::Publish(PublishError::Storage(e)) => assert_eq!(e.to_string(), "disk full"),
            _ => panic!("Expected BusError::Publish(Storage(...))"),
        }
    }

    #[test]
    fn board_error_not_found_carries_id() {
        let id = Uuid::new_v4();
        let err = BoardError::TaskNotFound { id };
        assert!(err.to_string().contains(&id.to_string()));
        assert!(!matches!(err, BoardError::ColumnNotFound { .. }));
    }

    #[test]
    fn board_error_survives_anyhow_round_trip() {
        let id = Uuid::new_v4();
        let wrapped: anyhow::Error = BoardError::ColumnNotFound { id }.into();
        let back = wrapped.downcast_ref::<BoardError>();
        assert!(matches!(back, Some(BoardError::ColumnNotFound { id: found }) if *found == id));
    }

    #[test]
    fn agent_error_unexpected_status_is_matchable() {
        let err = AgentError::UnexpectedStatus {
            status: 500,
            body: "boom".into(),
        };
        assert!(matches!(err, AgentError::UnexpectedStatus { status: 500, .. }));
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PublishError::UnknownExchange { exchange: "x".into() });
        assert_std_error(&BusError::UnknownDelivery { tag: 1 });
        assert_std_error(&BoardError::InvalidAction("x".into()));
        assert_std_error(&AgentError::Other(anyhow::anyhow!("x")));
    }
}
