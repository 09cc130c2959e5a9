use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Identifier of a registered player.
pub type PlayerId = Uuid;

/// The two sides of a match, named after their bib colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Team {
    /// Black bibs.
    Black,
    /// Orange bibs.
    Orange,
}

impl Team {
    /// The other side.
    pub fn opponent(self) -> Self {
        match self {
            Team::Black => Team::Orange,
            Team::Orange => Team::Black,
        }
    }

    /// Parse the wire name of a team; anything else is unrecognized.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "black" => Some(Team::Black),
            "orange" => Some(Team::Orange),
            _ => None,
        }
    }
}

/// Lifecycle of a match. `Finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Created, not kicked off.
    Scheduled,
    /// Running; goals and substitutions are accepted.
    InProgress,
    /// Closed for writes.
    Finished,
}

/// Kinds of entries in the append-only stat log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    /// A goal, own goals included.
    Goal,
    /// A fielded player swapped with a bench player.
    Substitution,
    /// Winner of the tie-break after a plain draw.
    TieDecider,
}

/// Immutable entry of the authoritative event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct StatEvent {
    /// Event id.
    pub stat_id: Uuid,
    /// Match the event belongs to.
    pub match_id: Uuid,
    /// What happened.
    pub event_type: StatKind,
    /// Side of the player who produced the event (for tie deciders, the winner).
    pub team: Team,
    /// Scorer of a goal, if known.
    #[serde(default)]
    #[schema(value_type = Option<uuid::Uuid>)]
    pub scorer_id: Option<PlayerId>,
    /// Assisting player; never set on own goals.
    #[serde(default)]
    #[schema(value_type = Option<uuid::Uuid>)]
    pub assist_id: Option<PlayerId>,
    /// The goal counts for the opponent of `team`.
    #[serde(default)]
    pub is_own_goal: bool,
    /// Match minute.
    pub minute: u32,
    /// Player entering the field (substitutions only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<uuid::Uuid>)]
    pub player_in: Option<PlayerId>,
    /// Player leaving the field (substitutions only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<uuid::Uuid>)]
    pub player_out: Option<PlayerId>,
}

impl StatEvent {
    /// Team credited with this event when it is a goal. Own goals credit the opponent.
    pub fn credited_team(&self) -> Option<Team> {
        match self.event_type {
            StatKind::Goal if self.is_own_goal => Some(self.team.opponent()),
            StatKind::Goal => Some(self.team),
            _ => None,
        }
    }
}

/// Goal counts for both sides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Score {
    /// Black goals.
    pub black: u32,
    /// Orange goals.
    pub orange: u32,
}

impl Score {
    /// Score of `black` to `orange`.
    pub fn new(black: u32, orange: u32) -> Self {
        Self { black, orange }
    }

    /// Derive the score from the event log. This is the only trusted source of a score.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a StatEvent>) -> Self {
        events
            .into_iter()
            .filter_map(StatEvent::credited_team)
            .fold(Self::default(), |mut score, team| {
                *score.get_mut(team) += 1;
                score
            })
    }

    /// Goals of `team`.
    pub fn get(&self, team: Team) -> u32 {
        match team {
            Team::Black => self.black,
            Team::Orange => self.orange,
        }
    }

    fn get_mut(&mut self, team: Team) -> &mut u32 {
        match team {
            Team::Black => &mut self.black,
            Team::Orange => &mut self.orange,
        }
    }

    /// Winning side, `None` on a draw.
    pub fn winner(&self) -> Option<Team> {
        match self.black.cmp(&self.orange) {
            std::cmp::Ordering::Greater => Some(Team::Black),
            std::cmp::Ordering::Less => Some(Team::Orange),
            std::cmp::Ordering::Equal => None,
        }
    }
}

/// Consecutive-win counters for both sides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct StreakPair {
    /// Consecutive black wins.
    pub black: u32,
    /// Consecutive orange wins.
    pub orange: u32,
}

impl StreakPair {
    /// Pair from both counters.
    pub fn new(black: u32, orange: u32) -> Self {
        Self { black, orange }
    }

    /// Counter of `team`.
    pub fn get(&self, team: Team) -> u32 {
        match team {
            Team::Black => self.black,
            Team::Orange => self.orange,
        }
    }

    /// Build a pair where `team` holds `own` and its opponent holds `other`.
    pub fn for_team(team: Team, own: u32, other: u32) -> Self {
        match team {
            Team::Black => Self::new(own, other),
            Team::Orange => Self::new(other, own),
        }
    }
}

/// Authoritative record of one match held by the server.
#[derive(Debug, Clone)]
pub struct MatchSession {
    /// Match id.
    pub id: Uuid,
    /// Lifecycle status.
    pub status: MatchStatus,
    /// Wall-clock anchor (epoch milliseconds) the elapsed time is derived from.
    pub started_at_ms: Option<u64>,
    /// Set once the match is finished.
    pub finished_at: Option<SystemTime>,
    /// Score derived from the log.
    pub score: Score,
    /// Counters the match started with; replaced by the next ones on finish.
    pub streak: StreakPair,
    /// Black players on the field.
    pub black_roster: IndexSet<PlayerId>,
    /// Orange players on the field.
    pub orange_roster: IndexSet<PlayerId>,
    /// Players present but not on the field.
    pub bench: IndexSet<PlayerId>,
    /// Everyone who took part, recorded on finish.
    pub participants: Vec<PlayerId>,
    /// Finished on a plain draw; the streak waits on the tie-break winner.
    pub awaiting_tie_break: bool,
    /// Crowd override chosen at finish.
    pub many_present: bool,
    /// Headcount reported at finish; zero until then.
    pub present_count: usize,
}

impl MatchSession {
    /// New scheduled session: rosters fixed, scores zeroed, clock not yet anchored.
    pub fn schedule(
        black_roster: IndexSet<PlayerId>,
        orange_roster: IndexSet<PlayerId>,
        bench: IndexSet<PlayerId>,
        streak: StreakPair,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: MatchStatus::Scheduled,
            started_at_ms: None,
            finished_at: None,
            score: Score::default(),
            streak,
            black_roster,
            orange_roster,
            bench,
            participants: Vec::new(),
            awaiting_tie_break: false,
            many_present: false,
            present_count: 0,
        }
    }

    /// Kick off: the match accepts writes and its clock is anchored at `now_ms`.
    pub fn begin(&mut self, now_ms: u64) {
        self.status = MatchStatus::InProgress;
        self.started_at_ms = Some(now_ms);
    }

    /// Fielded players of `team`.
    pub fn roster(&self, team: Team) -> &IndexSet<PlayerId> {
        match team {
            Team::Black => &self.black_roster,
            Team::Orange => &self.orange_roster,
        }
    }

    /// Mutable roster of `team`.
    pub fn roster_mut(&mut self, team: Team) -> &mut IndexSet<PlayerId> {
        match team {
            Team::Black => &mut self.black_roster,
            Team::Orange => &mut self.orange_roster,
        }
    }

    /// Side a player is currently fielded on.
    pub fn team_of(&self, player: &PlayerId) -> Option<Team> {
        if self.black_roster.contains(player) {
            Some(Team::Black)
        } else if self.orange_roster.contains(player) {
            Some(Team::Orange)
        } else {
            None
        }
    }

    /// Goals and substitutions are allowed only while in progress.
    pub fn accepts_writes(&self) -> bool {
        self.status == MatchStatus::InProgress
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn goal(team: Team, own_goal: bool) -> StatEvent {
        StatEvent {
            stat_id: Uuid::new_v4(),
            match_id: Uuid::nil(),
            event_type: StatKind::Goal,
            team,
            scorer_id: None,
            assist_id: None,
            is_own_goal: own_goal,
            minute: 1,
            player_in: None,
            player_out: None,
        }
    }

    #[test]
    fn own_goal_credits_opponent() {
        let events = vec![
            goal(Team::Black, false),
            goal(Team::Black, true),
            goal(Team::Orange, false),
        ];
        assert_eq!(Score::from_events(&events), Score::new(1, 2));
    }

    #[test]
    fn non_goal_events_do_not_count() {
        let mut substitution = goal(Team::Black, false);
        substitution.event_type = StatKind::Substitution;
        let mut decider = goal(Team::Orange, false);
        decider.event_type = StatKind::TieDecider;
        assert_eq!(Score::from_events(&[substitution, decider]), Score::default());
    }

    #[test]
    fn winner_reports_draw_as_none() {
        assert_eq!(Score::new(2, 2).winner(), None);
        assert_eq!(Score::new(3, 1).winner(), Some(Team::Black));
        assert_eq!(Score::new(0, 1).winner(), Some(Team::Orange));
    }

    #[test]
    fn team_parse_rejects_unknown_names() {
        assert_eq!(Team::parse(" Black "), Some(Team::Black));
        assert_eq!(Team::parse("orange"), Some(Team::Orange));
        assert_eq!(Team::parse("draw"), None);
    }
}
