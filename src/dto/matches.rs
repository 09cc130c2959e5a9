//! DTO definitions used by the match REST API and its client.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dto::{
        format_system_time,
        validation::{MAX_MATCH_MINUTE, validate_distinct_players, validate_roster},
    },
    state::match_session::{MatchSession, MatchStatus, PlayerId, Score, StreakPair, Team},
};

/// Payload starting a new match session.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct CreateMatchRequest {
    /// Players fielded for black.
    #[validate(custom(function = "validate_roster"))]
    #[schema(value_type = Vec<uuid::Uuid>)]
    pub black_roster: Vec<PlayerId>,
    /// Players fielded for orange.
    #[validate(custom(function = "validate_roster"))]
    #[schema(value_type = Vec<uuid::Uuid>)]
    pub orange_roster: Vec<PlayerId>,
    /// Players present but not fielded.
    #[serde(default)]
    #[validate(custom(function = "validate_distinct_players"))]
    #[schema(value_type = Vec<uuid::Uuid>)]
    pub bench: Vec<PlayerId>,
    /// Streak counters carried over from the previous match.
    #[serde(default)]
    pub black_win_streak: u32,
    /// Same as `black_win_streak`, for orange.
    #[serde(default)]
    pub orange_win_streak: u32,
}

/// Authoritative view of a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MatchDetail {
    /// Match id.
    pub id: Uuid,
    /// Lifecycle status.
    pub status: MatchStatus,
    /// Epoch milliseconds the match clock is anchored to.
    pub started_at_ms: Option<u64>,
    /// RFC 3339 time the match finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    /// Black goals, derived from the event log.
    pub black_score: u32,
    /// Orange goals, derived from the event log.
    pub orange_score: u32,
    /// Consecutive wins of black; after a finish, the counters for the next match.
    pub black_win_streak: u32,
    /// Consecutive wins of orange.
    pub orange_win_streak: u32,
    /// Black players currently fielded.
    #[schema(value_type = Vec<uuid::Uuid>)]
    pub black_roster: Vec<PlayerId>,
    /// Orange players currently fielded.
    #[schema(value_type = Vec<uuid::Uuid>)]
    pub orange_roster: Vec<PlayerId>,
    /// Players waiting on the bench.
    #[serde(default)]
    #[schema(value_type = Vec<uuid::Uuid>)]
    pub bench: Vec<PlayerId>,
    /// Set after a plain draw until the tie-break winner is recorded.
    #[serde(default)]
    pub awaiting_tie_break: bool,
    /// Crowd override the match was finished with.
    #[serde(default)]
    pub many_present: bool,
    /// Headcount the match was finished with; zero while it runs.
    #[serde(default)]
    pub present_count: usize,
}

impl MatchDetail {
    /// Current score.
    pub fn score(&self) -> Score {
        Score::new(self.black_score, self.orange_score)
    }

    /// Streak counters as a pair.
    pub fn streak(&self) -> StreakPair {
        StreakPair::new(self.black_win_streak, self.orange_win_streak)
    }
}

impl From<MatchSession> for MatchDetail {
    fn from(value: MatchSession) -> Self {
        Self {
            id: value.id,
            status: value.status,
            started_at_ms: value.started_at_ms,
            finished_at: value.finished_at.map(format_system_time),
            black_score: value.score.black,
            orange_score: value.score.orange,
            black_win_streak: value.streak.black,
            orange_win_streak: value.streak.orange,
            black_roster: value.black_roster.into_iter().collect(),
            orange_roster: value.orange_roster.into_iter().collect(),
            bench: value.bench.into_iter().collect(),
            awaiting_tie_break: value.awaiting_tie_break,
            many_present: value.many_present,
            present_count: value.present_count,
        }
    }
}

/// Goal submission. The idempotency key is generated by the client before the first send
/// and makes replays of the same submission harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, Validate)]
pub struct GoalSubmission {
    /// Client-generated key; the server stores each key once.
    pub idempotency_key: Uuid,
    /// Side of the scorer. An own goal is credited to the other side.
    pub team: Team,
    /// Player credited, if known.
    #[serde(default)]
    #[schema(value_type = Option<uuid::Uuid>)]
    pub scorer_id: Option<PlayerId>,
    /// Ignored for own goals.
    #[serde(default)]
    #[schema(value_type = Option<uuid::Uuid>)]
    pub assist_id: Option<PlayerId>,
    /// The goal counts for the opponent of `team`.
    #[serde(default)]
    pub is_own_goal: bool,
    /// Match minute the goal was scored in.
    #[validate(range(max = MAX_MATCH_MINUTE))]
    pub minute: u32,
}

/// Swap a fielded player with a bench player.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct SubstitutionRequest {
    /// Side making the change.
    pub team: Team,
    /// Fielded player leaving.
    #[schema(value_type = uuid::Uuid)]
    pub player_out: PlayerId,
    /// Bench player coming on.
    #[schema(value_type = uuid::Uuid)]
    pub player_in: PlayerId,
    /// Match minute of the change.
    #[validate(range(max = MAX_MATCH_MINUTE))]
    pub minute: u32,
}

/// Manual override of the streak counters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct StreakAdjustment {
    /// New black counter.
    pub black_win_streak: u32,
    /// New orange counter.
    pub orange_win_streak: u32,
}

/// Final result reported when a match ends.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct FinishRequest {
    /// Black goals as seen by the client; the server trusts its log.
    pub black_score: u32,
    /// Orange goals as seen by the client.
    pub orange_score: u32,
    /// Every player who took part, substitutes included.
    #[validate(custom(function = "validate_distinct_players"))]
    #[schema(value_type = Vec<uuid::Uuid>)]
    pub participants: Vec<PlayerId>,
    /// Everyone leaves regardless of streaks.
    #[serde(default)]
    pub many_present: bool,
    /// Players present at the venue, fielded or not.
    #[serde(default)]
    pub present_count: usize,
}

/// Winner of the out-of-band tie-break on a drawn match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct TieBreakRequest {
    /// Side that won the tie-break.
    pub winner: Team,
}
