//! Win-streak counters: a pure function from a match outcome to the next pair of counters.

use crate::state::match_session::{StreakPair, Team};

/// Default number of consecutive wins after which a streak saturates.
pub const DEFAULT_STREAK_THRESHOLD: u32 = 3;

/// Result of a finished match as seen by the streak rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// One side won.
    Winner(Team),
    /// Level at the end.
    Draw,
}

impl MatchOutcome {
    /// Parse `black`, `orange` or `draw`; anything else is unrecognized.
    pub fn parse(value: &str) -> Option<Self> {
        if value.trim().eq_ignore_ascii_case("draw") {
            return Some(Self::Draw);
        }
        Team::parse(value).map(Self::Winner)
    }
}

/// Inputs of [`next_streak`].
#[derive(Debug, Clone, Copy)]
pub struct StreakInput {
    /// "Many-present" override: a draw sends both teams out.
    pub many_present: bool,
    /// `None` when the winner input was missing or unrecognized.
    pub outcome: Option<MatchOutcome>,
    /// Winner of the tie-break procedure, consulted only on draws without override.
    pub tie_winner: Option<Team>,
    /// Counters before the match.
    pub prior: StreakPair,
    /// Consecutive wins that end a streak; floored at 1.
    pub threshold: u32,
}

/// Compute the streak counters after a match.
///
/// No returned counter ever reaches the (floored) threshold: a team that would reach it
/// resets to zero instead.
pub fn next_streak(input: &StreakInput) -> StreakPair {
    let threshold = input.threshold.max(1);

    match input.outcome {
        Some(MatchOutcome::Draw) if input.many_present => StreakPair::default(),
        Some(MatchOutcome::Draw) => match input.tie_winner {
            Some(team) => {
                let incremented = input.prior.get(team).saturating_add(1);
                if incremented >= threshold {
                    // Momentum passes to the other side.
                    let handed_off = if threshold > 1 { 1 } else { 0 };
                    StreakPair::for_team(team, 0, handed_off)
                } else {
                    StreakPair::for_team(team, incremented, 0)
                }
            }
            None => StreakPair::default(),
        },
        Some(MatchOutcome::Winner(team)) => {
            let incremented = input.prior.get(team).saturating_add(1);
            let own = if incremented >= threshold {
                0
            } else {
                incremented
            };
            StreakPair::for_team(team, own, 0)
        }
        None => StreakPair::default(),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn input(
        many_present: bool,
        outcome: Option<MatchOutcome>,
        tie_winner: Option<Team>,
        prior: StreakPair,
    ) -> StreakInput {
        StreakInput {
            many_present,
            outcome,
            tie_winner,
            prior,
            threshold: DEFAULT_STREAK_THRESHOLD,
        }
    }

    #[test]
    fn draw_with_override_resets_both() {
        let next = next_streak(&input(
            true,
            Some(MatchOutcome::Draw),
            Some(Team::Black),
            StreakPair::new(2, 0),
        ));
        assert_eq!(next, StreakPair::new(0, 0));
    }

    #[test]
    fn tie_break_winner_increments_then_hands_off() {
        let mut prior = StreakPair::new(0, 0);
        prior = next_streak(&input(
            false,
            Some(MatchOutcome::Draw),
            Some(Team::Black),
            prior,
        ));
        assert_eq!(prior, StreakPair::new(1, 0));

        prior = next_streak(&input(
            false,
            Some(MatchOutcome::Draw),
            Some(Team::Black),
            prior,
        ));
        assert_eq!(prior, StreakPair::new(2, 0));

        prior = next_streak(&input(
            false,
            Some(MatchOutcome::Draw),
            Some(Team::Black),
            prior,
        ));
        assert_eq!(prior, StreakPair::new(0, 1));
    }

    #[test]
    fn draw_without_tie_winner_resets_both() {
        let next = next_streak(&input(
            false,
            Some(MatchOutcome::Draw),
            None,
            StreakPair::new(0, 2),
        ));
        assert_eq!(next, StreakPair::default());
    }

    #[test]
    fn clear_win_increments_winner_and_zeroes_loser() {
        let next = next_streak(&input(
            true,
            Some(MatchOutcome::Winner(Team::Black)),
            None,
            StreakPair::new(1, 0),
        ));
        assert_eq!(next, StreakPair::new(2, 0));

        let next = next_streak(&input(
            false,
            Some(MatchOutcome::Winner(Team::Orange)),
            None,
            StreakPair::new(2, 0),
        ));
        assert_eq!(next, StreakPair::new(0, 1));
    }

    #[test]
    fn third_win_saturates_to_zero() {
        let next = next_streak(&input(
            false,
            Some(MatchOutcome::Winner(Team::Orange)),
            None,
            StreakPair::new(0, 2),
        ));
        assert_eq!(next, StreakPair::new(0, 0));
    }

    #[test]
    fn unrecognized_outcome_resets_both() {
        assert_eq!(MatchOutcome::parse("forfeit"), None);
        let next = next_streak(&input(
            false,
            MatchOutcome::parse("forfeit"),
            Some(Team::Black),
            StreakPair::new(1, 0),
        ));
        assert_eq!(next, StreakPair::default());
    }

    #[test]
    fn zero_threshold_is_floored_to_one() {
        let next = next_streak(&StreakInput {
            many_present: false,
            outcome: Some(MatchOutcome::Draw),
            tie_winner: Some(Team::Black),
            prior: StreakPair::default(),
            threshold: 0,
        });
        assert_eq!(next, StreakPair::default());
    }

    fn team_strategy() -> impl Strategy<Value = Team> {
        prop_oneof![Just(Team::Black), Just(Team::Orange)]
    }

    fn outcome_strategy() -> impl Strategy<Value = Option<MatchOutcome>> {
        prop_oneof![
            Just(None),
            Just(Some(MatchOutcome::Draw)),
            team_strategy().prop_map(|team| Some(MatchOutcome::Winner(team))),
        ]
    }

    proptest! {
        #[test]
        fn never_reaches_threshold(
            many_present in any::<bool>(),
            outcome in outcome_strategy(),
            tie_winner in proptest::option::of(team_strategy()),
            threshold in 0u32..8,
            black in 0u32..8,
            orange in 0u32..8,
        ) {
            let floor = threshold.max(1);
            let next = next_streak(&StreakInput {
                many_present,
                outcome,
                tie_winner,
                prior: StreakPair::new(black.min(floor - 1), orange.min(floor - 1)),
                threshold,
            });
            prop_assert!(next.black < floor);
            prop_assert!(next.orange < floor);
        }
    }
}
