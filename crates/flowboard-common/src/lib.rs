//! Wire types shared by the flowboard board service and the allocator agent.
//!
//! Everything crossing the message bus or the agent's HTTP boundary is
//! defined here and decoded once, at the boundary, into typed values.

pub mod action;
pub mod event;
pub mod risk;

pub use action::{ActionKind, ActionPayload, ActionRequest};
pub use event::{Event, EventPayload, RawEvent};
pub use risk::{AlertKind, RiskAlert, RiskLevel, RiskPrediction};

use thiserror::Error;

/// Failure to turn bytes or loosely typed JSON into a typed message.
///
/// Decode failures are never retried: a malformed message stays malformed.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed message envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("Malformed `{kind}` payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unknown {what} type '{kind}'")]
    UnknownKind { what: &'static str, kind: String },
}

/// Types that can be decoded from a raw bus message body.
pub trait Decode: Sized {
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError>;
}

/// Types that can be encoded into a bus message body.
pub trait Encode {
    fn encode(&self) -> serde_json::Result<Vec<u8>>;
}
