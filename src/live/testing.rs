//! In-memory doubles of the server used by the client core tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use futures::{
    FutureExt, StreamExt,
    future::BoxFuture,
    stream::BoxStream,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::{
    dto::matches::{
        CreateMatchRequest, FinishRequest, GoalSubmission, MatchDetail, StreakAdjustment,
        SubstitutionRequest, TieBreakRequest,
    },
    live::{
        api::{ApiError, MatchApi},
        stream::{EventSubscriber, StreamSignal, StreamTarget},
    },
    state::match_session::{MatchStatus, PlayerId, Score, StatEvent, StatKind, Team},
};

#[derive(Default)]
struct FakeState {
    matches: HashMap<Uuid, MatchDetail>,
    stats: HashMap<Uuid, Vec<StatEvent>>,
    keys: HashMap<Uuid, StatEvent>,
    offline: bool,
    goal_answers: VecDeque<Option<ApiError>>,
    goal_calls: Vec<Uuid>,
    finish_calls: Vec<FinishRequest>,
    fetch_calls: usize,
}

/// Server double with the same write rules as the real one: keyed goals are stored once and
/// a finished match refuses writes with 403.
#[derive(Default)]
pub struct FakeServer {
    state: Mutex<FakeState>,
}

fn offline() -> ApiError {
    ApiError::Unreachable("connection refused".into())
}

fn forbidden() -> ApiError {
    ApiError::Status {
        status: 403,
        message: "match no longer accepts writes".into(),
    }
}

fn not_found() -> ApiError {
    ApiError::Status {
        status: 404,
        message: "match not found".into(),
    }
}

fn ready<T: Send + 'static>(value: Result<T, ApiError>) -> BoxFuture<'static, Result<T, ApiError>> {
    async move { value }.boxed()
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Register an in-progress match and return its detail.
    pub fn seed_match(&self, black: &[PlayerId], orange: &[PlayerId], bench: &[PlayerId]) -> MatchDetail {
        let detail = MatchDetail {
            id: Uuid::new_v4(),
            status: MatchStatus::InProgress,
            started_at_ms: Some(1_000),
            finished_at: None,
            black_score: 0,
            orange_score: 0,
            black_win_streak: 0,
            orange_win_streak: 0,
            black_roster: black.to_vec(),
            orange_roster: orange.to_vec(),
            bench: bench.to_vec(),
            awaiting_tie_break: false,
            many_present: false,
            present_count: 0,
        };
        let mut state = self.state();
        state.matches.insert(detail.id, detail.clone());
        state.stats.insert(detail.id, Vec::new());
        detail
    }

    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn fail_next_goals(&self, failures: impl IntoIterator<Item = ApiError>) {
        self.script_goals(failures.into_iter().map(Some));
    }

    /// Script the next goal answers in order; `None` lets the call through.
    pub fn script_goals(&self, answers: impl IntoIterator<Item = Option<ApiError>>) {
        self.state().goal_answers.extend(answers);
    }

    /// Idempotency keys of every goal submission received, replays included.
    pub fn goal_calls(&self) -> Vec<Uuid> {
        self.state().goal_calls.clone()
    }

    pub fn finish_calls(&self) -> Vec<FinishRequest> {
        self.state().finish_calls.clone()
    }

    pub fn fetch_calls(&self) -> usize {
        self.state().fetch_calls
    }

    pub fn stats(&self, match_id: Uuid) -> Vec<StatEvent> {
        self.state().stats.get(&match_id).cloned().unwrap_or_default()
    }

    pub fn detail(&self, match_id: Uuid) -> Option<MatchDetail> {
        self.state().matches.get(&match_id).cloned()
    }

    /// Record a goal as if another client had submitted it.
    pub fn inject_goal(&self, match_id: Uuid, team: Team) -> StatEvent {
        let mut state = self.state();
        append_goal(
            &mut state,
            match_id,
            GoalSubmission {
                idempotency_key: Uuid::new_v4(),
                team,
                scorer_id: None,
                assist_id: None,
                is_own_goal: false,
                minute: 1,
            },
        )
    }

    /// Finish the match as if another client had done it.
    pub fn close_match(&self, match_id: Uuid) -> Option<MatchDetail> {
        let mut state = self.state();
        let detail = state.matches.get_mut(&match_id)?;
        detail.status = MatchStatus::Finished;
        Some(detail.clone())
    }
}

fn append_goal(state: &mut FakeState, match_id: Uuid, goal: GoalSubmission) -> StatEvent {
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
    state.keys.insert(goal.idempotency_key, stat.clone());
    let log = state.stats.entry(match_id).or_default();
    log.push(stat.clone());
    let score = Score::from_events(log.iter());
    if let Some(detail) = state.matches.get_mut(&match_id) {
        detail.black_score = score.black;
        detail.orange_score = score.orange;
    }
    stat
}

impl MatchApi for FakeServer {
    fn create_match(
        &self,
        request: CreateMatchRequest,
    ) -> BoxFuture<'static, Result<MatchDetail, ApiError>> {
        if self.state().offline {
            return ready(Err(offline()));
        }
        let mut detail = self.seed_match(
            &request.black_roster,
            &request.orange_roster,
            &request.bench,
        );
        detail.black_win_streak = request.black_win_streak;
        detail.orange_win_streak = request.orange_win_streak;
        self.state().matches.insert(detail.id, detail.clone());
        ready(Ok(detail))
    }

    fn fetch_match(&self, match_id: Uuid) -> BoxFuture<'static, Result<MatchDetail, ApiError>> {
        let mut state = self.state();
        if state.offline {
            return ready(Err(offline()));
        }
        state.fetch_calls += 1;
        ready(state.matches.get(&match_id).cloned().ok_or_else(not_found))
    }

    fn fetch_stats(&self, match_id: Uuid) -> BoxFuture<'static, Result<Vec<StatEvent>, ApiError>> {
        let state = self.state();
        if state.offline {
            return ready(Err(offline()));
        }
        ready(state.stats.get(&match_id).cloned().ok_or_else(not_found))
    }

    fn submit_goal(
        &self,
        match_id: Uuid,
        goal: GoalSubmission,
    ) -> BoxFuture<'static, Result<StatEvent, ApiError>> {
        let mut state = self.state();
        if state.offline {
            return ready(Err(offline()));
        }
        state.goal_calls.push(goal.idempotency_key);
        if let Some(Some(failure)) = state.goal_answers.pop_front() {
            return ready(Err(failure));
        }
        if let Some(stat) = state.keys.get(&goal.idempotency_key) {
            return ready(Ok(stat.clone()));
        }
        let status = state.matches.get(&match_id).map(|detail| detail.status);
        match status {
            None => ready(Err(not_found())),
            Some(MatchStatus::InProgress) => ready(Ok(append_goal(&mut state, match_id, goal))),
            Some(_) => ready(Err(forbidden())),
        }
    }

    fn submit_substitution(
        &self,
        match_id: Uuid,
        request: SubstitutionRequest,
    ) -> BoxFuture<'static, Result<StatEvent, ApiError>> {
        let mut state = self.state();
        if state.offline {
            return ready(Err(offline()));
        }
        let Some(detail) = state.matches.get_mut(&match_id) else {
            return ready(Err(not_found()));
        };
        if detail.status != MatchStatus::InProgress {
            return ready(Err(forbidden()));
        }
        let roster = match request.team {
            Team::Black => &mut detail.black_roster,
            Team::Orange => &mut detail.orange_roster,
        };
        roster.retain(|player| *player != request.player_out);
        roster.push(request.player_in);
        detail.bench.retain(|player| *player != request.player_in);
        detail.bench.push(request.player_out);

        let stat = StatEvent {
            stat_id: Uuid::new_v4(),
            match_id,
            event_type: StatKind::Substitution,
            team: request.team,
            scorer_id: None,
            assist_id: None,
            is_own_goal: false,
            minute: request.minute,
            player_in: Some(request.player_in),
            player_out: Some(request.player_out),
        };
        state.stats.entry(match_id).or_default().push(stat.clone());
        ready(Ok(stat))
    }

    fn adjust_streak(
        &self,
        match_id: Uuid,
        request: StreakAdjustment,
    ) -> BoxFuture<'static, Result<MatchDetail, ApiError>> {
        let mut state = self.state();
        if state.offline {
            return ready(Err(offline()));
        }
        let Some(detail) = state.matches.get_mut(&match_id) else {
            return ready(Err(not_found()));
        };
        detail.black_win_streak = request.black_win_streak;
        detail.orange_win_streak = request.orange_win_streak;
        ready(Ok(detail.clone()))
    }

    fn finish_match(
        &self,
        match_id: Uuid,
        request: FinishRequest,
    ) -> BoxFuture<'static, Result<MatchDetail, ApiError>> {
        let mut state = self.state();
        if state.offline {
            return ready(Err(offline()));
        }
        let (many_present, present_count) = (request.many_present, request.present_count);
        state.finish_calls.push(request);
        let Some(detail) = state.matches.get_mut(&match_id) else {
            return ready(Err(not_found()));
        };
        if detail.status == MatchStatus::Finished {
            return ready(Err(ApiError::Status {
                status: 409,
                message: "match already finished".into(),
            }));
        }
        detail.status = MatchStatus::Finished;
        detail.awaiting_tie_break =
            detail.black_score == detail.orange_score && !many_present;
        detail.many_present = many_present;
        detail.present_count = present_count;
        ready(Ok(detail.clone()))
    }

    fn submit_tie_break(
        &self,
        match_id: Uuid,
        _: TieBreakRequest,
    ) -> BoxFuture<'static, Result<MatchDetail, ApiError>> {
        let mut state = self.state();
        if state.offline {
            return ready(Err(offline()));
        }
        let Some(detail) = state.matches.get_mut(&match_id) else {
            return ready(Err(not_found()));
        };
        detail.awaiting_tie_break = false;
        ready(Ok(detail.clone()))
    }

    fn health(&self) -> BoxFuture<'static, Result<(), ApiError>> {
        ready(if self.state().offline { Err(offline()) } else { Ok(()) })
    }
}

/// Subscriber whose streams are fed by the test.
#[derive(Default)]
pub struct FakeSubscriber {
    streams: Mutex<Vec<(StreamTarget, Option<mpsc::UnboundedSender<StreamSignal>>)>>,
}

impl FakeSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriptions(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    pub fn targets(&self) -> Vec<StreamTarget> {
        self.streams.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    /// Push a signal on the most recent subscription.
    pub fn push(&self, signal: StreamSignal) {
        let streams = self.streams.lock().unwrap();
        if let Some((_, Some(tx))) = streams.last() {
            let _ = tx.send(signal);
        }
    }

    /// Fail the most recent subscription: an error signal, then end of stream.
    pub fn fail(&self, reason: &str) {
        self.push(StreamSignal::Error(reason.to_string()));
        if let Some((_, tx)) = self.streams.lock().unwrap().last_mut() {
            tx.take();
        }
    }
}

impl EventSubscriber for FakeSubscriber {
    fn subscribe(&self, target: StreamTarget) -> BoxStream<'static, StreamSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().push((target, Some(tx)));
        UnboundedReceiverStream::new(rx).boxed()
    }
}

/// Let spawned tasks run until they are all parked.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
