use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::state::match_session::StatEvent;

/// Snapshot sent once on every (re)connection.
pub const EVENT_INIT: &str = "init";
/// A goal was accepted; receivers re-read the log.
pub const EVENT_GOAL: &str = "goal";
/// The match reached its terminal state.
pub const EVENT_FINISH: &str = "finish";
/// Keep-alive carrying the server clock.
pub const EVENT_PING: &str = "ping";
/// No match is live.
pub const EVENT_INACTIVE: &str = "inactive";

#[derive(Clone, Debug)]
/// Dispatched payload carried across SSE channels.
pub struct ServerEvent {
    /// SSE event name; `None` sends a plain data message.
    pub event: Option<String>,
    /// Serialized payload.
    pub data: String,
}

impl ServerEvent {
    /// Build an event with a raw data field.
    pub fn new<E>(event: E, data: String) -> Self
    where
        E: Into<Option<String>>,
    {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Convenience wrapper that serialises `payload` into the SSE data field.
    pub fn json<E, T>(event: E, payload: &T) -> serde_json::Result<Self>
    where
        E: Into<Option<String>>,
        T: Serialize,
    {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_string(payload)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
/// Authoritative snapshot of a match log.
pub struct InitEvent {
    /// Match being described; carried on the live ticker stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_id: Option<Uuid>,
    /// Every event logged so far.
    pub stats: Vec<StatEvent>,
    /// Black goals at the time of the snapshot.
    pub black_goals: u32,
    /// Orange goals at the time of the snapshot.
    pub orange_goals: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
/// Notification that a goal was appended.
pub struct GoalEvent {
    /// The goal just logged.
    pub stat: StatEvent,
    /// Black goals after this goal.
    pub black_goals: u32,
    /// Orange goals after this goal.
    pub orange_goals: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
/// Notification that a match finished.
pub struct FinishEvent {
    /// Match that finished.
    pub match_id: Uuid,
    /// Final black goals, when known.
    #[serde(default)]
    pub black_score: Option<u32>,
    /// Final orange goals, when known.
    #[serde(default)]
    pub orange_score: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
/// Liveness signal carrying the server time in epoch milliseconds.
pub struct PingEvent {
    /// Server time in epoch milliseconds.
    pub ts: u64,
}
