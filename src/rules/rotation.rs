//! Decide which team(s) stay on the field after a match ends.
//!
//! Checks run in a fixed precedence order: a draw with the override (or a crowd) sends both
//! teams out, a plain draw waits on a tie-break, a winner about to saturate its streak sends
//! both teams out, a crowd sends both teams out, and otherwise the winner stays.

use indexmap::IndexSet;
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    rules::streak::{MatchOutcome, StreakInput, next_streak},
    state::match_session::{PlayerId, Score, StreakPair, Team},
};

/// Head count above which the pool is large enough to rotate everyone.
pub const DEFAULT_CROWD_LIMIT: usize = 17;

/// How the next match is seeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    /// Winner stays, loser goes to the bench.
    KeepWinner,
    /// Both teams go to the bench; the next match is picked from scratch.
    BothLeave,
    /// Draw waiting on the tie-break; nobody has moved yet.
    Manual,
}

/// Tunables of the rotation policy.
#[derive(Debug, Clone, Copy)]
pub struct RotationPolicy {
    /// Crowd override chosen at finish.
    pub many_present: bool,
    /// Wins after which the winner leaves too.
    pub streak_threshold: u32,
    /// Headcount above which both teams leave.
    pub crowd_limit: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            many_present: false,
            streak_threshold: crate::rules::streak::DEFAULT_STREAK_THRESHOLD,
            crowd_limit: DEFAULT_CROWD_LIMIT,
        }
    }
}

/// Everything known about a finished match when deciding the rotation.
#[derive(Debug, Clone, Copy)]
pub struct RotationInput<'a> {
    /// Score the match ended with.
    pub final_score: Score,
    /// Black players on the field at the end.
    pub black_roster: &'a IndexSet<PlayerId>,
    /// Orange players on the field at the end.
    pub orange_roster: &'a IndexSet<PlayerId>,
    /// Bench at the end.
    pub bench: &'a IndexSet<PlayerId>,
    /// Streak counters as they were before this match.
    pub prior_streak: StreakPair,
    /// Players at the venue.
    pub present_count: usize,
}

impl RotationInput<'_> {
    fn roster(&self, team: Team) -> &IndexSet<PlayerId> {
        match team {
            Team::Black => self.black_roster,
            Team::Orange => self.orange_roster,
        }
    }
}

/// Derived decision for the next session. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct RotationOutcome {
    /// Side that keeps the field, if any.
    pub staying_team: Option<Team>,
    /// Side that goes to the bench, if only one does.
    pub leaving_team: Option<Team>,
    /// How the next match is formed.
    pub mode: RotationMode,
    /// Bench pool after the rotation, de-duplicated, in arrival order.
    #[schema(value_type = Vec<uuid::Uuid>)]
    pub bench_candidates: IndexSet<PlayerId>,
    /// Streak counters the next match starts with.
    pub next_streak: StreakPair,
    /// Pre-populated selection for the next match; the open slot is picked manually.
    #[schema(value_type = Vec<uuid::Uuid>)]
    pub next_black: IndexSet<PlayerId>,
    /// Orange counterpart of `next_black`.
    #[schema(value_type = Vec<uuid::Uuid>)]
    pub next_orange: IndexSet<PlayerId>,
}

impl RotationOutcome {
    /// True while a tie-break result is still needed.
    pub fn awaiting_tie_break(&self) -> bool {
        self.mode == RotationMode::Manual
    }
}

/// Recompute the bench: previous bench plus outgoing players, minus incoming ones.
pub fn recompute_bench<'a>(
    previous: &IndexSet<PlayerId>,
    outgoing: impl IntoIterator<Item = &'a PlayerId>,
    incoming: impl IntoIterator<Item = &'a PlayerId>,
) -> IndexSet<PlayerId> {
    let mut bench = previous.clone();
    bench.extend(outgoing.into_iter().copied());
    for player in incoming {
        bench.shift_remove(player);
    }
    bench
}

/// Decide the rotation for a finished match.
///
/// A plain draw yields [`RotationMode::Manual`]; call [`resolve_tie_break`] once the
/// tie-break winner is known.
pub fn decide(input: &RotationInput<'_>, policy: &RotationPolicy) -> RotationOutcome {
    let crowded = input.present_count > policy.crowd_limit;
    let threshold = policy.streak_threshold.max(1);

    let Some(winner) = input.final_score.winner() else {
        if policy.many_present || crowded {
            return both_leave(input, StreakPair::default());
        }
        return RotationOutcome {
            staying_team: None,
            leaving_team: None,
            mode: RotationMode::Manual,
            bench_candidates: input.bench.clone(),
            next_streak: input.prior_streak,
            next_black: IndexSet::new(),
            next_orange: IndexSet::new(),
        };
    };

    let next = next_streak(&StreakInput {
        many_present: policy.many_present,
        outcome: Some(MatchOutcome::Winner(winner)),
        tie_winner: None,
        prior: input.prior_streak,
        threshold,
    });

    if input.prior_streak.get(winner) >= threshold - 1 || crowded {
        return both_leave(input, next);
    }

    keep_winner(input, winner, next)
}

/// Finish a drawn match's rotation once the tie-break winner is known.
pub fn resolve_tie_break(
    input: &RotationInput<'_>,
    policy: &RotationPolicy,
    tie_winner: Team,
) -> RotationOutcome {
    let threshold = policy.streak_threshold.max(1);
    let next = next_streak(&StreakInput {
        many_present: policy.many_present,
        outcome: Some(MatchOutcome::Draw),
        tie_winner: Some(tie_winner),
        prior: input.prior_streak,
        threshold,
    });

    if input.prior_streak.get(tie_winner) >= threshold - 1 {
        return both_leave(input, next);
    }

    keep_winner(input, tie_winner, next)
}

fn both_leave(input: &RotationInput<'_>, next_streak: StreakPair) -> RotationOutcome {
    let outgoing = input.black_roster.iter().chain(input.orange_roster.iter());
    RotationOutcome {
        staying_team: None,
        leaving_team: None,
        mode: RotationMode::BothLeave,
        bench_candidates: recompute_bench(input.bench, outgoing, std::iter::empty()),
        next_streak,
        next_black: IndexSet::new(),
        next_orange: IndexSet::new(),
    }
}

fn keep_winner(input: &RotationInput<'_>, winner: Team, next_streak: StreakPair) -> RotationOutcome {
    let loser = winner.opponent();
    let staying = input.roster(winner);
    let bench = recompute_bench(input.bench, input.roster(loser), staying);
    let (next_black, next_orange) = match winner {
        Team::Black => (staying.clone(), IndexSet::new()),
        Team::Orange => (IndexSet::new(), staying.clone()),
    };

    RotationOutcome {
        staying_team: Some(winner),
        leaving_team: Some(loser),
        mode: RotationMode::KeepWinner,
        bench_candidates: bench,
        next_streak,
        next_black,
        next_orange,
    }
}
