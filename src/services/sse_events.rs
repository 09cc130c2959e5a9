use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::{
    dto::sse::{
        EVENT_FINISH, EVENT_GOAL, EVENT_INACTIVE, EVENT_INIT, FinishEvent, GoalEvent, InitEvent,
        ServerEvent,
    },
    state::{
        SharedState,
        match_session::{MatchSession, MatchStatus, Score, StatEvent},
    },
};

/// Build the `init` snapshot of a match log.
pub fn init_event(match_id: Option<Uuid>, stats: Vec<StatEvent>) -> Option<ServerEvent> {
    let score = Score::from_events(&stats);
    let payload = InitEvent {
        match_id,
        stats,
        black_goals: score.black,
        orange_goals: score.orange,
    };
    to_server_event(EVENT_INIT, &payload)
}

/// `inactive` event: the ticker has no live match.
pub fn inactive_event() -> ServerEvent {
    ServerEvent::new(Some(EVENT_INACTIVE.to_string()), "{}".to_string())
}

/// `finish` event with the final score.
pub fn finish_event(session: &MatchSession) -> Option<ServerEvent> {
    let payload = FinishEvent {
        match_id: session.id,
        black_score: Some(session.score.black),
        orange_score: Some(session.score.orange),
    };
    to_server_event(EVENT_FINISH, &payload)
}

/// Notify observers that a goal was accepted.
pub async fn broadcast_goal(state: &SharedState, stat: &StatEvent, score: Score) {
    let payload = GoalEvent {
        stat: stat.clone(),
        black_goals: score.black,
        orange_goals: score.orange,
    };
    if let Some(event) = to_server_event(EVENT_GOAL, &payload) {
        send_match_event(state, stat.match_id, event).await;
    }
}

/// Push a fresh `init` snapshot after the log changed in a way a `goal` cannot express.
pub async fn broadcast_log_snapshot(state: &SharedState, match_id: Uuid, stats: Vec<StatEvent>) {
    if let Some(event) = init_event(Some(match_id), stats) {
        send_match_event(state, match_id, event).await;
    }
}

/// Announce a lifecycle change on the match stream and on the dashboard ticker.
pub async fn broadcast_status_changed(state: &SharedState, session: &MatchSession) {
    match session.status {
        MatchStatus::Scheduled => {}
        MatchStatus::InProgress => {
            state.set_live_match(session.id).await;
            if let Some(event) = init_event(Some(session.id), Vec::new()) {
                state.live_sse().broadcast(event);
            }
        }
        MatchStatus::Finished => {
            if let Some(event) = finish_event(session) {
                send_match_event(state, session.id, event).await;
            }
            if state.clear_live_match(session.id).await {
                state.live_sse().broadcast(inactive_event());
            }
            state.retire_match_sse(session.id);
        }
    }
}

async fn send_match_event(state: &SharedState, match_id: Uuid, event: ServerEvent) {
    if state.live_match().await == Some(match_id) {
        state.live_sse().broadcast(event.clone());
    }
    state.match_sse(match_id).broadcast(event);
}

fn to_server_event(event: &str, payload: &impl Serialize) -> Option<ServerEvent> {
    match ServerEvent::json(Some(event.to_string()), payload) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(event, error = %err, "failed to serialize SSE payload");
            None
        }
    }
}
