use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    dao::match_store::AppendOutcome,
    dto::matches::{
        CreateMatchRequest, FinishRequest, GoalSubmission, MatchDetail, StreakAdjustment,
        SubstitutionRequest, TieBreakRequest,
    },
    error::ServiceError,
    rules::rotation::{self, RotationInput},
    services::sse_events::{broadcast_goal, broadcast_log_snapshot},
    state::{
        SharedState,
        lifecycle::MatchEvent,
        match_session::{
            MatchSession, MatchStatus, Score, StatEvent, StatKind, StreakPair, now_ms,
        },
        transitions::run_transition_with_broadcast,
    },
};

fn not_found(match_id: Uuid) -> ServiceError {
    ServiceError::NotFound(format!("match `{match_id}` not found"))
}

async fn load(state: &SharedState, match_id: Uuid) -> Result<MatchSession, ServiceError> {
    state
        .store()
        .find_match(match_id)
        .await?
        .ok_or_else(|| not_found(match_id))
}

fn ensure_open(match_id: Uuid, status: MatchStatus) -> Result<(), ServiceError> {
    if status == MatchStatus::InProgress {
        Ok(())
    } else {
        Err(ServiceError::MatchClosed(format!(
            "match `{match_id}` is not in progress"
        )))
    }
}

/// Reject streak counters the rule engine could never produce.
fn validate_streak(streak: StreakPair, threshold: u32) -> Result<(), ServiceError> {
    if streak.black >= threshold || streak.orange >= threshold {
        return Err(ServiceError::InvalidInput(format!(
            "win streaks must stay below {threshold}"
        )));
    }
    if streak.black > 0 && streak.orange > 0 {
        return Err(ServiceError::InvalidInput(
            "only one side can carry a win streak".into(),
        ));
    }
    Ok(())
}

/// Minute of play relative to the clock anchor, frozen at the final whistle.
fn match_minute(session: &MatchSession) -> u32 {
    let end_ms = session
        .finished_at
        .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
        .map(|since| since.as_millis() as u64)
        .unwrap_or_else(now_ms);
    let elapsed_ms = session
        .started_at_ms
        .map(|started| end_ms.saturating_sub(started))
        .unwrap_or_default();
    (elapsed_ms / 60_000) as u32
}

/// Create a match and kick it off immediately.
pub async fn create_match(
    state: &SharedState,
    request: CreateMatchRequest,
) -> Result<MatchDetail, ServiceError> {
    let black: IndexSet<_> = request.black_roster.into_iter().collect();
    let orange: IndexSet<_> = request.orange_roster.into_iter().collect();
    if let Some(player) = black.intersection(&orange).next() {
        return Err(ServiceError::InvalidInput(format!(
            "player `{player}` is on both rosters"
        )));
    }
    let bench: IndexSet<_> = request
        .bench
        .into_iter()
        .filter(|player| !black.contains(player) && !orange.contains(player))
        .collect();

    let streak = StreakPair::new(request.black_win_streak, request.orange_win_streak);
    validate_streak(streak, state.config().rules.streak_threshold)?;

    let session = MatchSession::schedule(black, orange, bench, streak);
    let match_id = session.id;
    let store = state.store();
    store.save_match(session.clone()).await?;
    state.track_lifecycle(match_id, MatchStatus::Scheduled);

    let session = run_transition_with_broadcast(state, match_id, MatchEvent::Start, move || {
        async move {
            let mut session = session;
            session.begin(now_ms());
            store.save_match(session.clone()).await?;
            Ok(session)
        }
    })
    .await?;

    info!(match_id = %match_id, "match started");
    Ok(session.into())
}

/// Authoritative detail of one match.
pub async fn get_match(state: &SharedState, match_id: Uuid) -> Result<MatchDetail, ServiceError> {
    load(state, match_id).await.map(Into::into)
}

/// Authoritative event log of a match, in append order.
pub async fn list_stats(
    state: &SharedState,
    match_id: Uuid,
) -> Result<Vec<StatEvent>, ServiceError> {
    load(state, match_id).await?;
    Ok(state.store().list_stats(match_id).await?)
}

/// Append a goal. A repeated idempotency key returns the stored event unchanged.
pub async fn record_goal(
    state: &SharedState,
    match_id: Uuid,
    goal: GoalSubmission,
) -> Result<StatEvent, ServiceError> {
    let gate = state.lock_match(match_id).await?;
    let store = state.store();
    let mut session = load(state, match_id).await?;

    if let Some(existing) = store
        .find_keyed_stat(match_id, goal.idempotency_key)
        .await?
    {
        info!(
            match_id = %match_id,
            stat_id = %existing.stat_id,
            "duplicate goal submission ignored"
        );
        return Ok(existing);
    }

    ensure_open(match_id, gate.status())?;

    let roster = session.roster(goal.team);
    if let Some(scorer) = goal.scorer_id
        && !roster.contains(&scorer)
    {
        return Err(ServiceError::InvalidInput(format!(
            "scorer `{scorer}` is not fielded for {:?}",
            goal.team
        )));
    }
    if let Some(assist) = goal.assist_id {
        if goal.is_own_goal {
            return Err(ServiceError::InvalidInput("own goals carry no assist".into()));
        }
        if Some(assist) == goal.scorer_id {
            return Err(ServiceError::InvalidInput(
                "a player cannot assist their own goal".into(),
            ));
        }
        if !roster.contains(&assist) {
            return Err(ServiceError::InvalidInput(format!(
                "assist `{assist}` is not fielded for {:?}",
                goal.team
            )));
        }
    }

    let stat = StatEvent {
        stat_id: Uuid::new_v4(),
        match_id,
        event_type: StatKind::Goal,
        team: goal.team,
        scorer_id: goal.scorer_id,
        assist_id: goal.assist_id,
        is_own_goal: goal.is_own_goal,
        minute: goal.minute,
        player_in: None,
        player_out: None,
    };

    let stat = match store.append_stat(stat, Some(goal.idempotency_key)).await? {
        AppendOutcome::Appended(stat) => stat,
        AppendOutcome::Duplicate(stat) => return Ok(stat),
    };

    let stats = store.list_stats(match_id).await?;
    session.score = Score::from_events(&stats);
    store.save_match(session.clone()).await?;
    drop(gate);

    info!(
        match_id = %match_id,
        stat_id = %stat.stat_id,
        black = session.score.black,
        orange = session.score.orange,
        "goal recorded"
    );
    broadcast_goal(state, &stat, session.score).await;
    Ok(stat)
}

/// Swap a fielded player with someone off the field.
pub async fn record_substitution(
    state: &SharedState,
    match_id: Uuid,
    request: SubstitutionRequest,
) -> Result<StatEvent, ServiceError> {
    let gate = state.lock_match(match_id).await?;
    ensure_open(match_id, gate.status())?;
    let store = state.store();
    let mut session = load(state, match_id).await?;

    let SubstitutionRequest {
        team,
        player_out,
        player_in,
        minute,
    } = request;

    if player_in == player_out {
        return Err(ServiceError::InvalidInput(
            "a player cannot replace themselves".into(),
        ));
    }
    if !session.roster(team).contains(&player_out) {
        return Err(ServiceError::InvalidInput(format!(
            "player `{player_out}` is not fielded for {team:?}"
        )));
    }
    if session.team_of(&player_in).is_some() {
        return Err(ServiceError::InvalidInput(format!(
            "player `{player_in}` is already fielded"
        )));
    }

    let roster = session.roster_mut(team);
    roster.shift_remove(&player_out);
    roster.insert(player_in);
    session.bench.shift_remove(&player_in);
    session.bench.insert(player_out);

    let stat = StatEvent {
        stat_id: Uuid::new_v4(),
        match_id,
        event_type: StatKind::Substitution,
        team,
        scorer_id: None,
        assist_id: None,
        is_own_goal: false,
        minute,
        player_in: Some(player_in),
        player_out: Some(player_out),
    };
    let stat = store.append_stat(stat, None).await?.into_stat();
    store.save_match(session).await?;

    info!(match_id = %match_id, player_in = %player_in, player_out = %player_out, "substitution recorded");
    Ok(stat)
}

/// Correction: drop one event and recompute the score from what is left.
pub async fn remove_stat(
    state: &SharedState,
    match_id: Uuid,
    stat_id: Uuid,
) -> Result<MatchDetail, ServiceError> {
    let gate = state.lock_match(match_id).await?;
    ensure_open(match_id, gate.status())?;
    let store = state.store();
    let mut session = load(state, match_id).await?;

    if !store.remove_stat(match_id, stat_id).await? {
        return Err(ServiceError::NotFound(format!(
            "stat `{stat_id}` not found in match `{match_id}`"
        )));
    }

    let stats = store.list_stats(match_id).await?;
    session.score = Score::from_events(&stats);
    store.save_match(session.clone()).await?;
    drop(gate);

    info!(match_id = %match_id, stat_id = %stat_id, "stat removed");
    broadcast_log_snapshot(state, match_id, stats).await;
    Ok(session.into())
}

/// Manual override of the win-streak counters.
pub async fn adjust_streak(
    state: &SharedState,
    match_id: Uuid,
    adjustment: StreakAdjustment,
) -> Result<MatchDetail, ServiceError> {
    let _gate = state.lock_match(match_id).await?;
    let mut session = load(state, match_id).await?;

    let streak = StreakPair::new(adjustment.black_win_streak, adjustment.orange_win_streak);
    validate_streak(streak, state.config().rules.streak_threshold)?;
    session.streak = streak;
    state.store().save_match(session.clone()).await?;

    info!(
        match_id = %match_id,
        black = streak.black,
        orange = streak.orange,
        "win streak adjusted"
    );
    Ok(session.into())
}

/// Terminal transition. The final score is re-derived from the log and the streak comes
/// from the rotation rules.
pub async fn finish_match(
    state: &SharedState,
    match_id: Uuid,
    request: FinishRequest,
) -> Result<MatchDetail, ServiceError> {
    let work_state = state.clone();
    let session = run_transition_with_broadcast(state, match_id, MatchEvent::Finish, move || {
        async move {
            let store = work_state.store();
            let mut session = load(&work_state, match_id).await?;
            let stats = store.list_stats(match_id).await?;
            let score = Score::from_events(&stats);

            let reported = Score::new(request.black_score, request.orange_score);
            if reported != score {
                warn!(
                    match_id = %match_id,
                    reported_black = reported.black,
                    reported_orange = reported.orange,
                    black = score.black,
                    orange = score.orange,
                    "reported final score differs from the event log; using the log"
                );
            }

            let policy = work_state.config().rules.policy(request.many_present);
            let outcome = rotation::decide(
                &RotationInput {
                    final_score: score,
                    black_roster: &session.black_roster,
                    orange_roster: &session.orange_roster,
                    bench: &session.bench,
                    prior_streak: session.streak,
                    present_count: request.present_count,
                },
                &policy,
            );

            session.status = MatchStatus::Finished;
            session.finished_at = Some(SystemTime::now());
            session.score = score;
            session.streak = outcome.next_streak;
            session.awaiting_tie_break = outcome.awaiting_tie_break();
            session.many_present = request.many_present;
            session.present_count = request.present_count;
            session.participants = request.participants;
            store.save_match(session.clone()).await?;

            info!(match_id = %match_id, mode = ?outcome.mode, "match finished");
            Ok(session)
        }
    })
    .await?;

    Ok(session.into())
}

/// Record the tie-break winner of a plain draw and settle the streak counters.
pub async fn resolve_tie_break(
    state: &SharedState,
    match_id: Uuid,
    request: TieBreakRequest,
) -> Result<MatchDetail, ServiceError> {
    let gate = state.lock_match(match_id).await?;
    if gate.status() != MatchStatus::Finished {
        return Err(ServiceError::InvalidState(format!(
            "match `{match_id}` has not finished yet"
        )));
    }
    let store = state.store();
    let mut session = load(state, match_id).await?;
    if !session.awaiting_tie_break {
        return Err(ServiceError::InvalidState(format!(
            "match `{match_id}` has no pending tie-break"
        )));
    }

    let policy = state.config().rules.policy(false);
    let outcome = rotation::resolve_tie_break(
        &RotationInput {
            final_score: session.score,
            black_roster: &session.black_roster,
            orange_roster: &session.orange_roster,
            bench: &session.bench,
            prior_streak: session.streak,
            present_count: session.participants.len(),
        },
        &policy,
        request.winner,
    );

    let stat = StatEvent {
        stat_id: Uuid::new_v4(),
        match_id,
        event_type: StatKind::TieDecider,
        team: request.winner,
        scorer_id: None,
        assist_id: None,
        is_own_goal: false,
        minute: match_minute(&session),
        player_in: None,
        player_out: None,
    };
    store.append_stat(stat, None).await?;

    session.streak = outcome.next_streak;
    session.awaiting_tie_break = false;
    store.save_match(session.clone()).await?;

    info!(match_id = %match_id, winner = ?request.winner, mode = ?outcome.mode, "tie-break resolved");
    Ok(session.into())
}
