use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use indexmap::IndexSet;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    dto::matches::{
        CreateMatchRequest, FinishRequest, GoalSubmission, MatchDetail, StreakAdjustment,
        SubstitutionRequest, TieBreakRequest,
    },
    live::{
        api::{ApiError, SharedMatchApi},
        channel::{ChannelNotice, LiveSyncChannel, LiveView},
        connectivity::ConnectivityMonitor,
        kv::{KeyValueStore, KvError},
        queue::OfflineGoalQueue,
        scope::TaskScope,
        snapshot::{
            PlayerTally, RosterSnapshot, SessionSnapshot, SessionSnapshotStore, TickerSnapshot,
            tally_events,
        },
        stream::{EventSubscriber, StreamTarget},
        timer::{AlarmSink, Clock, MatchTimer, TimerView},
    },
    rules::rotation::{self, RotationInput, RotationOutcome},
    state::match_session::{
        MatchStatus, PlayerId, Score, StatEvent, StatKind, StreakPair, Team,
    },
};

/// Failure of a [`LiveSession`] operation.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Nothing is running on this device.
    #[error("no match is active")]
    NoActiveMatch,
    /// The match cannot be attached to.
    #[error("match `{0}` is not in progress")]
    NotInProgress(Uuid),
    /// The player is not on that side of the field.
    #[error("player `{0}` is not fielded for that team")]
    NotFielded(PlayerId),
    /// No drawn match waits on a tie-break.
    #[error("no drawn match is waiting for a tie-break")]
    NoPendingTieBreak,
    /// The server refused the write for good; the match no longer accepts it.
    #[error("server rejected the write: {0}")]
    Rejected(ApiError),
    /// The server could not be reached or answered with an error.
    #[error(transparent)]
    Api(ApiError),
    /// Local storage failed.
    #[error(transparent)]
    Storage(#[from] KvError),
}

impl From<ApiError> for SessionError {
    fn from(err: ApiError) -> Self {
        if err.is_definitive_rejection() {
            Self::Rejected(err)
        } else {
            Self::Api(err)
        }
    }
}

/// Collaborators of a [`LiveSession`].
#[derive(Clone)]
pub struct SessionDeps {
    /// REST client.
    pub api: SharedMatchApi,
    /// Push stream factory.
    pub subscriber: Arc<dyn EventSubscriber>,
    /// Network reachability.
    pub connectivity: ConnectivityMonitor,
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
    /// Overtime alarm output.
    pub alarm: Arc<dyn AlarmSink>,
    /// Local storage for the snapshot and the offline queue.
    pub kv: Arc<dyn KeyValueStore>,
    /// Rules and cadences.
    pub config: AppConfig,
}

/// A goal as entered by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoalEntry {
    /// Side of the scorer.
    pub team: Team,
    /// Scorer, if known; must be fielded for `team`.
    pub scorer_id: Option<PlayerId>,
    /// Assisting player; dropped for own goals.
    pub assist_id: Option<PlayerId>,
    /// The goal counts for the other side.
    pub is_own_goal: bool,
}

/// Where a goal ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GoalReceipt {
    /// Stored by the server.
    Recorded(StatEvent),
    /// Held locally until connectivity returns.
    Queued {
        /// Key the submission will be replayed with.
        idempotency_key: Uuid,
    },
}

/// Choices made when ending a match.
#[derive(Debug, Clone, Copy, Default)]
pub struct FinishOptions {
    /// Send both teams out whatever the streaks.
    pub many_present: bool,
    /// Players at the venue; defaults to rosters plus bench.
    pub present_count: Option<usize>,
}

/// Outcome of a finalized match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishReport {
    /// Match that was finalized.
    pub match_id: Uuid,
    /// Score from the server log.
    pub final_score: Score,
    /// Decided rotation; `Manual` while a tie-break is pending.
    pub rotation: RotationOutcome,
    /// Another client finished the match.
    pub remote: bool,
}

#[derive(Debug, Clone)]
struct MatchContext {
    match_id: Uuid,
    started_at_ms: u64,
    black: IndexSet<PlayerId>,
    orange: IndexSet<PlayerId>,
    bench: IndexSet<PlayerId>,
    prior_streak: StreakPair,
}

impl MatchContext {
    fn from_detail(detail: &MatchDetail, now_ms: u64) -> Self {
        Self {
            match_id: detail.id,
            started_at_ms: detail.started_at_ms.unwrap_or(now_ms),
            black: detail.black_roster.iter().copied().collect(),
            orange: detail.orange_roster.iter().copied().collect(),
            bench: detail.bench.iter().copied().collect(),
            prior_streak: detail.streak(),
        }
    }

    fn roster(&self, team: Team) -> &IndexSet<PlayerId> {
        match team {
            Team::Black => &self.black,
            Team::Orange => &self.orange,
        }
    }

    fn roster_mut(&mut self, team: Team) -> &mut IndexSet<PlayerId> {
        match team {
            Team::Black => &mut self.black,
            Team::Orange => &mut self.orange,
        }
    }

    fn rosters(&self) -> RosterSnapshot {
        RosterSnapshot {
            black: self.black.iter().copied().collect(),
            orange: self.orange.iter().copied().collect(),
        }
    }

    fn headcount(&self) -> usize {
        self.black.len() + self.orange.len() + self.bench.len()
    }

    fn rotation_input(&self, final_score: Score, present_count: usize) -> RotationInput<'_> {
        RotationInput {
            final_score,
            black_roster: &self.black,
            orange_roster: &self.orange,
            bench: &self.bench,
            prior_streak: self.prior_streak,
            present_count,
        }
    }
}

/// Crowd override and headcount the server finished the match with.
///
/// A match closed without them (zero headcount) falls back to the local roster count.
fn finish_terms(detail: &MatchDetail, ctx: &MatchContext) -> (bool, usize) {
    let present_count = match detail.present_count {
        0 => ctx.headcount(),
        count => count,
    };
    (detail.many_present, present_count)
}

/// Streak the server reports for a match that is still running.
fn server_streak(view: &LiveView) -> Option<StreakPair> {
    view.streak
        .filter(|_| view.status == Some(MatchStatus::InProgress))
}

/// Fielded players plus everyone substituted out during the match.
fn participants(ctx: &MatchContext, events: &[StatEvent]) -> Vec<PlayerId> {
    let mut players: IndexSet<PlayerId> = ctx.black.iter().chain(ctx.orange.iter()).copied().collect();
    players.extend(
        events
            .iter()
            .filter(|event| event.event_type == StatKind::Substitution)
            .filter_map(|event| event.player_out),
    );
    players.into_iter().collect()
}

struct ActiveMatch {
    ctx: MatchContext,
    channel: Arc<LiveSyncChannel>,
    timer: MatchTimer,
    scope: TaskScope,
}

struct PendingTieBreak {
    ctx: MatchContext,
    final_score: Score,
    present_count: usize,
    remote: bool,
}

struct SessionInner {
    deps: SessionDeps,
    snapshots: SessionSnapshotStore,
    queue: OfflineGoalQueue,
    active: Mutex<Option<ActiveMatch>>,
    tie_break: Mutex<Option<PendingTieBreak>>,
    reports: watch::Sender<Option<FinishReport>>,
}

/// Controller of the match being run from this device.
///
/// Every background task of a match (clock, alarm, push stream, fallback poll, queue drain,
/// reconnect watcher) lives in one [`TaskScope`]; [`LiveSession::deactivate`] cancels all of
/// them at once.
#[derive(Clone)]
pub struct LiveSession {
    inner: Arc<SessionInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LiveSession {
    /// Idle session; call [`Self::resume`], [`Self::start`] or [`Self::attach`].
    pub fn new(deps: SessionDeps) -> Self {
        let snapshots = SessionSnapshotStore::new(deps.kv.clone());
        let queue = OfflineGoalQueue::new(snapshots.clone(), deps.api.clone());
        let (reports, _) = watch::channel(None);
        Self {
            inner: Arc::new(SessionInner {
                deps,
                snapshots,
                queue,
                active: Mutex::new(None),
                tie_break: Mutex::new(None),
                reports,
            }),
        }
    }

    fn downgrade(&self) -> Weak<SessionInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(inner: &Weak<SessionInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    /// Create a match on the server and start running it.
    pub async fn start(&self, request: CreateMatchRequest) -> Result<Uuid, SessionError> {
        let detail = self.inner.deps.api.create_match(request).await?;
        let ctx = MatchContext::from_detail(&detail, self.inner.deps.clock.now_ms());
        self.activate(ctx, false, Score::default(), BTreeMap::new())?;
        info!(match_id = %detail.id, "match started");
        Ok(detail.id)
    }

    /// Take over a match already in progress.
    pub async fn attach(&self, match_id: Uuid) -> Result<(), SessionError> {
        let detail = self.inner.deps.api.fetch_match(match_id).await?;
        if detail.status != MatchStatus::InProgress {
            return Err(SessionError::NotInProgress(match_id));
        }
        let ctx = MatchContext::from_detail(&detail, self.inner.deps.clock.now_ms());
        self.activate(
            ctx,
            self.inner.snapshots.alarm_muted(),
            detail.score(),
            BTreeMap::new(),
        )?;
        Ok(())
    }

    /// Rebuild the session persisted before a reload, if any.
    ///
    /// The clock is recomputed from the stored anchor. When the server is unreachable the
    /// local snapshot is trusted; a match the server reports finished is finalized from the
    /// streak persisted at activation, since the server's counters already moved on.
    pub async fn resume(&self) -> Result<Option<Uuid>, SessionError> {
        let now_ms = self.inner.deps.clock.now_ms();
        let Some(restored) = self.inner.snapshots.load(now_ms) else {
            return Ok(None);
        };
        let snapshot = restored.snapshot;
        let match_id = snapshot.match_id;
        info!(%match_id, elapsed_secs = restored.elapsed_secs, "resuming persisted match");

        let mut ctx = MatchContext {
            match_id,
            started_at_ms: snapshot.ticker.map(|t| t.started_at_ms).unwrap_or(now_ms),
            black: snapshot.rosters.black.iter().copied().collect(),
            orange: snapshot.rosters.orange.iter().copied().collect(),
            bench: snapshot.bench.iter().copied().collect(),
            prior_streak: snapshot.prior_streak,
        };
        let score = snapshot.ticker.map(|t| t.score()).unwrap_or_default();

        match self.inner.deps.api.fetch_match(match_id).await {
            Ok(detail) if detail.status == MatchStatus::Finished => {
                let (many_present, present_count) = finish_terms(&detail, &ctx);
                self.finalize(ctx, detail.score(), many_present, present_count, true)?;
                return Ok(None);
            }
            Ok(detail) => {
                let anchor = ctx.started_at_ms;
                ctx = MatchContext::from_detail(&detail, anchor);
            }
            Err(err) if err.status() == Some(404) => {
                warn!(%match_id, "persisted match is unknown to the server; discarding it");
                self.inner.snapshots.clear(match_id)?;
                return Ok(None);
            }
            Err(err) => {
                warn!(%match_id, error = %err, "server unreachable; resuming from local state");
            }
        }

        self.activate(ctx, snapshot.alarm_muted, score, snapshot.tallies)?;
        Ok(Some(match_id))
    }

    fn activate(
        &self,
        ctx: MatchContext,
        muted: bool,
        score: Score,
        tallies: BTreeMap<PlayerId, PlayerTally>,
    ) -> Result<(), SessionError> {
        self.deactivate();
        let deps = &self.inner.deps;
        let match_id = ctx.match_id;

        self.inner.snapshots.save(&SessionSnapshot {
            match_id,
            in_progress: true,
            rosters: ctx.rosters(),
            bench: ctx.bench.iter().copied().collect(),
            ticker: Some(TickerSnapshot {
                started_at_ms: ctx.started_at_ms,
                black_goals: score.black,
                orange_goals: score.orange,
            }),
            tallies,
            alarm_muted: muted,
            prior_streak: ctx.prior_streak,
        })?;

        let scope = TaskScope::new();
        let timer = MatchTimer::new(
            ctx.started_at_ms,
            muted,
            deps.config.clock.clone(),
            deps.clock.clone(),
            deps.alarm.clone(),
        );
        timer.start(&scope);

        let (channel, mut notices) = LiveSyncChannel::new(
            deps.api.clone(),
            deps.subscriber.clone(),
            deps.connectivity.clone(),
            deps.clock.clone(),
            deps.config.sync.clone(),
        );
        channel.activate(StreamTarget::Match(match_id));
        let channel = Arc::new(channel);

        let session = self.downgrade();
        scope.spawn_interval("queue-drain", deps.config.sync.drain_interval, move || {
            let session = session.clone();
            async move {
                if let Some(session) = LiveSession::upgrade(&session) {
                    session.drain_and_refresh().await;
                }
            }
        });

        let session = self.downgrade();
        let mut online = deps.connectivity.subscribe();
        scope.spawn("reconnect-drain", async move {
            while online.changed().await.is_ok() {
                if !*online.borrow_and_update() {
                    continue;
                }
                let Some(session) = LiveSession::upgrade(&session) else {
                    break;
                };
                debug!("connectivity restored; draining queued goals");
                session.drain_and_refresh().await;
            }
        });

        let session = self.downgrade();
        scope.spawn("finish-notices", async move {
            while let Some(notice) = notices.recv().await {
                let ChannelNotice::Finished { match_id, score } = notice else {
                    continue;
                };
                let Some(session) = LiveSession::upgrade(&session) else {
                    break;
                };
                if let Err(err) = session.handle_remote_finish(match_id, score).await {
                    warn!(%match_id, error = %err, "failed to finalize remotely finished match");
                }
            }
        });

        let session = self.downgrade();
        let snapshots = self.inner.snapshots.clone();
        let mut view = channel.subscribe();
        let started_at_ms = ctx.started_at_ms;
        scope.spawn("score-mirror", async move {
            let mut last: Option<(Score, usize)> = None;
            while view.changed().await.is_ok() {
                let (score, events, streak) = {
                    let current = view.borrow_and_update();
                    if current.match_id != Some(match_id) {
                        continue;
                    }
                    let events = current.synced.then(|| current.events.clone());
                    (current.score, events, server_streak(&current))
                };
                if let Some(streak) = streak {
                    let Some(session) = LiveSession::upgrade(&session) else {
                        break;
                    };
                    if let Err(err) = session.adopt_server_streak(match_id, streak) {
                        warn!(%match_id, error = %err, "failed to persist streak counters");
                    }
                }
                // Until the log is read the view holds nothing worth persisting.
                let Some(events) = events else {
                    continue;
                };
                if last == Some((score, events.len())) {
                    continue;
                }
                last = Some((score, events.len()));
                let ticker = TickerSnapshot {
                    started_at_ms,
                    black_goals: score.black,
                    orange_goals: score.orange,
                };
                if let Err(err) = snapshots
                    .save_ticker(&ticker)
                    .and_then(|()| snapshots.save_tallies(&tally_events(&events)))
                {
                    warn!(%match_id, error = %err, "failed to persist live score");
                }
            }
        });

        *lock(&self.inner.active) = Some(ActiveMatch {
            ctx,
            channel,
            timer,
            scope,
        });
        Ok(())
    }

    /// Stop every task of the current match. The persisted snapshot is kept.
    pub fn deactivate(&self) {
        let Some(active) = lock(&self.inner.active).take() else {
            return;
        };
        active.channel.deactivate();
        active.scope.cancel_all();
        debug!(match_id = %active.ctx.match_id, "live session deactivated");
    }

    fn active_parts(&self) -> Result<(MatchContext, Arc<LiveSyncChannel>, MatchTimer), SessionError> {
        lock(&self.inner.active)
            .as_ref()
            .map(|active| (active.ctx.clone(), active.channel.clone(), active.timer.clone()))
            .ok_or(SessionError::NoActiveMatch)
    }

    async fn drain_and_refresh(&self) {
        let Ok((ctx, channel, _)) = self.active_parts() else {
            return;
        };
        let online = self.inner.deps.connectivity.is_online();
        let report = self.inner.queue.drain(Some(ctx.match_id), online).await;
        if report.changed_log() {
            channel.refresh().await;
        }
    }

    /// Submit a goal, or queue it when the server cannot be reached.
    pub async fn record_goal(&self, entry: GoalEntry) -> Result<GoalReceipt, SessionError> {
        let (ctx, channel, timer) = self.active_parts()?;
        // Own goals carry no assist.
        let assist_id = entry.assist_id.filter(|_| !entry.is_own_goal);
        for player in entry.scorer_id.iter().chain(assist_id.iter()) {
            if !ctx.roster(entry.team).contains(player) {
                return Err(SessionError::NotFielded(*player));
            }
        }

        let payload = GoalSubmission {
            idempotency_key: Uuid::new_v4(),
            team: entry.team,
            scorer_id: entry.scorer_id,
            assist_id,
            is_own_goal: entry.is_own_goal,
            minute: timer.minute(),
        };
        let key = payload.idempotency_key;
        let now_ms = self.inner.deps.clock.now_ms();

        if !self.inner.deps.connectivity.is_online() {
            self.inner.queue.enqueue(ctx.match_id, payload, now_ms)?;
            return Ok(GoalReceipt::Queued {
                idempotency_key: key,
            });
        }

        match self.inner.deps.api.submit_goal(ctx.match_id, payload.clone()).await {
            Ok(stat) => {
                channel.refresh().await;
                Ok(GoalReceipt::Recorded(stat))
            }
            Err(err) if err.is_transient() => {
                warn!(match_id = %ctx.match_id, error = %err, "goal not delivered; queued for replay");
                self.inner.queue.enqueue(ctx.match_id, payload, now_ms)?;
                Ok(GoalReceipt::Queued {
                    idempotency_key: key,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Swap `player_out` for `player_in` on `team`. Not queued while offline.
    pub async fn record_substitution(
        &self,
        team: Team,
        player_out: PlayerId,
        player_in: PlayerId,
    ) -> Result<StatEvent, SessionError> {
        let (ctx, channel, timer) = self.active_parts()?;
        if !ctx.roster(team).contains(&player_out) {
            return Err(SessionError::NotFielded(player_out));
        }
        let stat = self
            .inner
            .deps
            .api
            .submit_substitution(
                ctx.match_id,
                SubstitutionRequest {
                    team,
                    player_out,
                    player_in,
                    minute: timer.minute(),
                },
            )
            .await?;

        let updated = self.update_context(ctx.match_id, |ctx| {
            let roster = ctx.roster_mut(team);
            roster.shift_remove(&player_out);
            roster.insert(player_in);
            ctx.bench.shift_remove(&player_in);
            ctx.bench.insert(player_out);
        });
        if let Some(ctx) = updated {
            let bench: Vec<PlayerId> = ctx.bench.iter().copied().collect();
            self.inner.snapshots.save_rosters(&ctx.rosters(), &bench)?;
        }
        channel.refresh().await;
        Ok(stat)
    }

    /// Override the streak counters the rotation starts from.
    pub async fn adjust_streak(&self, streak: StreakPair) -> Result<MatchDetail, SessionError> {
        let (ctx, _, _) = self.active_parts()?;
        let detail = self
            .inner
            .deps
            .api
            .adjust_streak(
                ctx.match_id,
                StreakAdjustment {
                    black_win_streak: streak.black,
                    orange_win_streak: streak.orange,
                },
            )
            .await?;
        let confirmed = detail.streak();
        if self
            .update_context(ctx.match_id, |ctx| ctx.prior_streak = confirmed)
            .is_some()
        {
            self.inner.snapshots.save_prior_streak(confirmed)?;
        }
        Ok(detail)
    }

    /// Take the streak counters the server reports for the running match.
    fn adopt_server_streak(&self, match_id: Uuid, streak: StreakPair) -> Result<(), KvError> {
        let changed = {
            let mut active = lock(&self.inner.active);
            match active.as_mut().filter(|a| a.ctx.match_id == match_id) {
                Some(active) if active.ctx.prior_streak != streak => {
                    active.ctx.prior_streak = streak;
                    true
                }
                _ => false,
            }
        };
        if !changed {
            return Ok(());
        }
        debug!(%match_id, black = streak.black, orange = streak.orange, "streak counters from server");
        self.inner.snapshots.save_prior_streak(streak)
    }

    /// Silence or re-enable the overtime alarm, persisted across reloads.
    pub fn set_alarm_muted(&self, muted: bool) -> Result<(), SessionError> {
        let (_, _, timer) = self.active_parts()?;
        timer.set_muted(muted);
        self.inner.snapshots.set_alarm_muted(muted)?;
        Ok(())
    }

    /// End the match on the server, decide the rotation and clear local state.
    pub async fn finish(&self, options: FinishOptions) -> Result<FinishReport, SessionError> {
        let (mut ctx, channel, _) = self.active_parts()?;
        let online = self.inner.deps.connectivity.is_online();
        let drained = self.inner.queue.drain(Some(ctx.match_id), online).await;
        if drained.remaining > 0 {
            warn!(match_id = %ctx.match_id, remaining = drained.remaining, "finishing with undelivered goals");
        }
        channel.refresh().await;

        let view = channel.view();
        if let Some(streak) = server_streak(&view) {
            ctx.prior_streak = streak;
            self.adopt_server_streak(ctx.match_id, streak)?;
        }
        let present_count = options.present_count.unwrap_or_else(|| ctx.headcount());
        let request = FinishRequest {
            black_score: view.score.black,
            orange_score: view.score.orange,
            participants: participants(&ctx, &view.events),
            many_present: options.many_present,
            present_count,
        };
        let detail = self
            .inner
            .deps
            .api
            .finish_match(ctx.match_id, request)
            .await?;

        self.finalize(ctx, detail.score(), options.many_present, present_count, false)
    }

    /// React to another client finishing the match this session runs.
    pub async fn handle_remote_finish(
        &self,
        match_id: Uuid,
        score: Option<Score>,
    ) -> Result<Option<FinishReport>, SessionError> {
        let Ok((ctx, channel, _)) = self.active_parts() else {
            return Ok(None);
        };
        if ctx.match_id != match_id {
            return Ok(None);
        }

        let (final_score, many_present, present_count) =
            match self.inner.deps.api.fetch_match(match_id).await {
                Ok(detail) => {
                    let (many_present, present_count) = finish_terms(&detail, &ctx);
                    (detail.score(), many_present, present_count)
                }
                Err(err) => {
                    debug!(%match_id, error = %err, "using pushed final score");
                    (
                        score.unwrap_or_else(|| channel.view().score),
                        self.inner.deps.config.rules.many_present,
                        ctx.headcount(),
                    )
                }
            };
        self.finalize(ctx, final_score, many_present, present_count, true)
            .map(Some)
    }

    fn finalize(
        &self,
        ctx: MatchContext,
        final_score: Score,
        many_present: bool,
        present_count: usize,
        remote: bool,
    ) -> Result<FinishReport, SessionError> {
        let policy = self.inner.deps.config.rules.policy(many_present);
        let rotation = rotation::decide(&ctx.rotation_input(final_score, present_count), &policy);
        let match_id = ctx.match_id;

        let cleared = self.inner.snapshots.clear(match_id);
        self.deactivate();

        let report = FinishReport {
            match_id,
            final_score,
            rotation: rotation.clone(),
            remote,
        };
        info!(
            %match_id,
            black = final_score.black,
            orange = final_score.orange,
            mode = ?rotation.mode,
            remote,
            "match finalized"
        );

        *lock(&self.inner.tie_break) = rotation.awaiting_tie_break().then_some(PendingTieBreak {
            ctx,
            final_score,
            present_count,
            remote,
        });
        self.inner.reports.send_replace(Some(report.clone()));
        cleared?;
        Ok(report)
    }

    /// Record the tie-break winner of the last drawn match and complete its rotation.
    pub async fn resolve_tie_break(&self, winner: Team) -> Result<FinishReport, SessionError> {
        let Some(pending) = lock(&self.inner.tie_break).take() else {
            return Err(SessionError::NoPendingTieBreak);
        };
        let match_id = pending.ctx.match_id;

        if let Err(err) = self
            .inner
            .deps
            .api
            .submit_tie_break(match_id, TieBreakRequest { winner })
            .await
        {
            *lock(&self.inner.tie_break) = Some(pending);
            return Err(err.into());
        }

        let policy = self.inner.deps.config.rules.policy(false);
        let rotation = rotation::resolve_tie_break(
            &pending.ctx.rotation_input(pending.final_score, pending.present_count),
            &policy,
            winner,
        );
        let report = FinishReport {
            match_id,
            final_score: pending.final_score,
            rotation,
            remote: pending.remote,
        };
        info!(%match_id, ?winner, mode = ?report.rotation.mode, "tie-break recorded");
        self.inner.reports.send_replace(Some(report.clone()));
        Ok(report)
    }

    fn update_context(
        &self,
        match_id: Uuid,
        change: impl FnOnce(&mut MatchContext),
    ) -> Option<MatchContext> {
        let mut active = lock(&self.inner.active);
        let active = active.as_mut().filter(|a| a.ctx.match_id == match_id)?;
        change(&mut active.ctx);
        Some(active.ctx.clone())
    }

    /// Match running on this device.
    pub fn active_match(&self) -> Option<Uuid> {
        lock(&self.inner.active).as_ref().map(|a| a.ctx.match_id)
    }

    /// Streak counters the running match started with.
    pub fn prior_streak(&self) -> Option<StreakPair> {
        lock(&self.inner.active).as_ref().map(|a| a.ctx.prior_streak)
    }

    /// Per-player goals and assists of the running match, as last persisted.
    pub fn tallies(&self) -> BTreeMap<PlayerId, PlayerTally> {
        self.inner.snapshots.tallies()
    }

    /// Latest finalized match.
    pub fn reports(&self) -> watch::Receiver<Option<FinishReport>> {
        self.inner.reports.subscribe()
    }

    /// Live view of the running match.
    pub fn live_view(&self) -> Option<watch::Receiver<LiveView>> {
        lock(&self.inner.active)
            .as_ref()
            .map(|a| a.channel.subscribe())
    }

    /// Clock of the running match.
    pub fn timer_view(&self) -> Option<watch::Receiver<TimerView>> {
        lock(&self.inner.active)
            .as_ref()
            .map(|a| a.timer.subscribe())
    }

    /// Goals waiting in the offline queue, all matches.
    pub fn pending_goals(&self) -> usize {
        self.inner.queue.pending().len()
    }

    /// Background tasks still running for the current match.
    pub fn active_tasks(&self) -> usize {
        lock(&self.inner.active)
            .as_ref()
            .map_or(0, |a| a.scope.active() + a.channel.active_tasks())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::sleep;

    use super::*;
    use crate::{
        dto::sse::{FinishEvent, InitEvent},
        live::{
            api::MatchApi,
            kv::MemoryKvStore,
            snapshot::KEY_MATCH_ID,
            stream::{PushMessage, StreamSignal},
            testing::{FakeServer, FakeSubscriber, settle},
            timer::{LogAlarm, ManualClock},
        },
        rules::rotation::RotationMode,
    };

    struct Harness {
        server: Arc<FakeServer>,
        subscriber: Arc<FakeSubscriber>,
        clock: Arc<ManualClock>,
        connectivity: ConnectivityMonitor,
        kv: Arc<MemoryKvStore>,
        black: Vec<PlayerId>,
        orange: Vec<PlayerId>,
        bench: Vec<PlayerId>,
    }

    impl Harness {
        fn new() -> Self {
            let players = |n| (0..n).map(|_| Uuid::new_v4()).collect::<Vec<_>>();
            Self {
                server: Arc::new(FakeServer::new()),
                subscriber: Arc::new(FakeSubscriber::new()),
                clock: Arc::new(ManualClock::new(1_000)),
                connectivity: ConnectivityMonitor::new(true),
                kv: Arc::new(MemoryKvStore::new()),
                black: players(5),
                orange: players(5),
                bench: players(3),
            }
        }

        fn session(&self) -> LiveSession {
            LiveSession::new(SessionDeps {
                api: self.server.clone(),
                subscriber: self.subscriber.clone(),
                connectivity: self.connectivity.clone(),
                clock: self.clock.clone(),
                alarm: Arc::new(LogAlarm),
                kv: self.kv.clone(),
                config: AppConfig::default(),
            })
        }

        fn request(&self, streak: StreakPair) -> CreateMatchRequest {
            CreateMatchRequest {
                black_roster: self.black.clone(),
                orange_roster: self.orange.clone(),
                bench: self.bench.clone(),
                black_win_streak: streak.black,
                orange_win_streak: streak.orange,
            }
        }

        fn go_offline(&self) {
            self.server.set_offline(true);
            self.connectivity.set_online(false);
        }

        fn go_online(&self) {
            self.server.set_offline(false);
            self.connectivity.set_online(true);
        }

        fn persisted(&self) -> SessionSnapshot {
            SessionSnapshotStore::new(self.kv.clone())
                .load(self.clock.now_ms())
                .expect("a persisted session")
                .snapshot
        }
    }

    fn goal(team: Team) -> GoalEntry {
        GoalEntry {
            team,
            scorer_id: None,
            assist_id: None,
            is_own_goal: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deactivation_leaves_no_running_tasks() {
        let h = Harness::new();
        let session = h.session();
        session.start(h.request(StreakPair::default())).await.unwrap();
        settle().await;
        assert!(session.active_tasks() >= 5);

        session.deactivate();
        assert_eq!(session.active_tasks(), 0);
        assert_eq!(session.active_match(), None);

        let subscriptions = h.subscriber.subscriptions();
        sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(h.subscriber.subscriptions(), subscriptions);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_goal_is_replayed_when_connectivity_returns() {
        let h = Harness::new();
        let session = h.session();
        let match_id = session.start(h.request(StreakPair::default())).await.unwrap();
        settle().await;

        h.go_offline();
        let receipt = session.record_goal(goal(Team::Black)).await.unwrap();
        assert!(matches!(receipt, GoalReceipt::Queued { .. }));
        assert_eq!(session.pending_goals(), 1);
        assert!(h.server.stats(match_id).is_empty());

        h.go_online();
        settle().await;

        assert_eq!(session.pending_goals(), 0);
        assert_eq!(h.server.stats(match_id).len(), 1);
        let view = session.live_view().unwrap().borrow().clone();
        assert_eq!(view.score, Score::new(1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_by_the_periodic_drain() {
        let h = Harness::new();
        let session = h.session();
        let match_id = session.start(h.request(StreakPair::default())).await.unwrap();
        h.server.fail_next_goals([ApiError::Status {
            status: 503,
            message: "busy".into(),
        }]);

        let receipt = session.record_goal(goal(Team::Orange)).await.unwrap();
        let GoalReceipt::Queued { idempotency_key } = receipt else {
            panic!("expected the goal to be queued");
        };

        sleep(Duration::from_millis(5_100)).await;
        settle().await;
        assert_eq!(session.pending_goals(), 0);
        assert_eq!(h.server.stats(match_id).len(), 1);
        assert_eq!(
            h.server.goal_calls(),
            vec![idempotency_key, idempotency_key]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn goal_on_a_closed_match_is_rejected() {
        let h = Harness::new();
        let session = h.session();
        let match_id = session.start(h.request(StreakPair::default())).await.unwrap();
        h.server.close_match(match_id);

        let err = session.record_goal(goal(Team::Black)).await.unwrap_err();
        assert!(matches!(err, SessionError::Rejected(_)));
        assert_eq!(session.pending_goals(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn scorer_must_be_fielded_for_the_team() {
        let h = Harness::new();
        let session = h.session();
        session.start(h.request(StreakPair::default())).await.unwrap();

        let err = session
            .record_goal(GoalEntry {
                scorer_id: Some(h.orange[0]),
                ..goal(Team::Black)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotFielded(p) if p == h.orange[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn finish_rotates_clears_state_and_tears_down() {
        let h = Harness::new();
        let session = h.session();
        session.start(h.request(StreakPair::new(1, 0))).await.unwrap();
        settle().await;

        session.record_goal(goal(Team::Black)).await.unwrap();
        session.record_goal(goal(Team::Black)).await.unwrap();
        session.record_goal(goal(Team::Orange)).await.unwrap();
        session
            .record_substitution(Team::Orange, h.orange[0], h.bench[0])
            .await
            .unwrap();

        let report = session.finish(FinishOptions::default()).await.unwrap();

        assert_eq!(report.final_score, Score::new(2, 1));
        assert_eq!(report.rotation.mode, RotationMode::KeepWinner);
        assert_eq!(report.rotation.staying_team, Some(Team::Black));
        assert_eq!(report.rotation.next_streak, StreakPair::new(2, 0));
        assert!(report.rotation.bench_candidates.contains(&h.orange[0]));
        assert!(!report.remote);

        let sent = &h.server.finish_calls()[0];
        assert_eq!((sent.black_score, sent.orange_score), (2, 1));
        assert!(sent.participants.contains(&h.orange[0]));
        assert!(sent.participants.contains(&h.bench[0]));
        assert_eq!(sent.present_count, 13);

        assert_eq!(session.active_tasks(), 0);
        assert_eq!(session.active_match(), None);
        assert_eq!(h.kv.get(KEY_MATCH_ID).unwrap(), None);
        assert_eq!(*session.reports().borrow(), Some(report));
    }

    #[tokio::test(start_paused = true)]
    async fn plain_draw_waits_for_the_tie_break() {
        let h = Harness::new();
        let session = h.session();
        session.start(h.request(StreakPair::new(2, 0))).await.unwrap();

        let report = session.finish(FinishOptions::default()).await.unwrap();
        assert_eq!(report.rotation.mode, RotationMode::Manual);
        assert_eq!(report.rotation.next_streak, StreakPair::new(2, 0));

        let resolved = session.resolve_tie_break(Team::Black).await.unwrap();
        assert_eq!(resolved.rotation.mode, RotationMode::BothLeave);
        assert_eq!(resolved.rotation.next_streak, StreakPair::new(0, 1));

        assert!(matches!(
            session.resolve_tie_break(Team::Black).await,
            Err(SessionError::NoPendingTieBreak)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reload_resumes_with_the_clock_recomputed() {
        let h = Harness::new();
        let first = h.session();
        let match_id = first.start(h.request(StreakPair::default())).await.unwrap();
        first.record_goal(goal(Team::Orange)).await.unwrap();
        first.set_alarm_muted(true).unwrap();
        settle().await;
        // A crash leaves the snapshot behind.
        first.deactivate();

        h.clock.set(1_000 + 95_000);
        let second = h.session();
        assert_eq!(second.resume().await.unwrap(), Some(match_id));

        let timer = second.timer_view().unwrap().borrow().clone();
        assert_eq!(timer.elapsed_secs, 95);
        assert!(timer.muted);
        second.deactivate();
    }

    #[tokio::test(start_paused = true)]
    async fn resume_offline_trusts_the_local_snapshot() {
        let h = Harness::new();
        let first = h.session();
        let match_id = first.start(h.request(StreakPair::default())).await.unwrap();
        first.deactivate();

        h.go_offline();
        let second = h.session();
        assert_eq!(second.resume().await.unwrap(), Some(match_id));
        assert_eq!(second.active_match(), Some(match_id));
        second.deactivate();
    }

    #[tokio::test(start_paused = true)]
    async fn remote_finish_finalizes_and_drops_queued_goals() {
        let h = Harness::new();
        let session = h.session();
        let match_id = session.start(h.request(StreakPair::default())).await.unwrap();
        settle().await;
        h.server.inject_goal(match_id, Team::Orange);

        h.connectivity.set_online(false);
        session.record_goal(goal(Team::Black)).await.unwrap();
        assert_eq!(session.pending_goals(), 1);

        h.server.close_match(match_id);
        h.subscriber
            .push(StreamSignal::Message(PushMessage::Finish(FinishEvent {
                match_id,
                black_score: Some(0),
                orange_score: Some(1),
            })));
        settle().await;

        let report = session.reports().borrow().clone().unwrap();
        assert!(report.remote);
        assert_eq!(report.final_score, Score::new(0, 1));
        assert_eq!(report.rotation.staying_team, Some(Team::Orange));
        assert_eq!(session.active_match(), None);
        assert_eq!(session.active_tasks(), 0);
        assert_eq!(session.pending_goals(), 0);
        assert_eq!(h.kv.get(KEY_MATCH_ID).unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn streak_adjustment_feeds_the_rotation() {
        let h = Harness::new();
        let session = h.session();
        session.start(h.request(StreakPair::default())).await.unwrap();
        session.adjust_streak(StreakPair::new(0, 2)).await.unwrap();
        session.record_goal(goal(Team::Orange)).await.unwrap();

        let report = session.finish(FinishOptions::default()).await.unwrap();
        assert_eq!(report.rotation.mode, RotationMode::BothLeave);
        assert_eq!(report.rotation.next_streak, StreakPair::new(0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn own_goal_ignores_a_stray_assist() {
        let h = Harness::new();
        let session = h.session();
        session.start(h.request(StreakPair::default())).await.unwrap();

        let receipt = session
            .record_goal(GoalEntry {
                team: Team::Black,
                scorer_id: Some(h.black[0]),
                assist_id: Some(h.orange[1]),
                is_own_goal: true,
            })
            .await
            .unwrap();
        let GoalReceipt::Recorded(stat) = receipt else {
            panic!("expected the goal to be recorded");
        };
        assert!(stat.is_own_goal);
        assert_eq!(stat.assist_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_resume_keeps_the_prior_streak_for_the_rotation() {
        let h = Harness::new();
        let first = h.session();
        first.start(h.request(StreakPair::new(2, 0))).await.unwrap();
        first.record_goal(goal(Team::Black)).await.unwrap();
        settle().await;
        first.deactivate();

        h.go_offline();
        let second = h.session();
        second.resume().await.unwrap();
        assert_eq!(second.prior_streak(), Some(StreakPair::new(2, 0)));

        h.go_online();
        settle().await;
        let report = second.finish(FinishOptions::default()).await.unwrap();
        assert_eq!(report.final_score, Score::new(1, 0));
        assert_eq!(report.rotation.mode, RotationMode::BothLeave);
        assert_eq!(report.rotation.next_streak, StreakPair::new(0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn resume_of_a_match_closed_elsewhere_rotates_from_the_persisted_streak() {
        let h = Harness::new();
        let first = h.session();
        let match_id = first.start(h.request(StreakPair::new(2, 0))).await.unwrap();
        first.record_goal(goal(Team::Black)).await.unwrap();
        settle().await;
        first.deactivate();

        h.server.close_match(match_id);
        let second = h.session();
        assert_eq!(second.resume().await.unwrap(), None);

        let report = second.reports().borrow().clone().unwrap();
        assert!(report.remote);
        assert_eq!(report.final_score, Score::new(1, 0));
        assert_eq!(report.rotation.mode, RotationMode::BothLeave);
        assert_eq!(report.rotation.next_streak, StreakPair::new(0, 0));
        assert_eq!(h.kv.get(KEY_MATCH_ID).unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn server_streak_replaces_a_stale_local_copy() {
        let h = Harness::new();
        let first = h.session();
        let match_id = first.start(h.request(StreakPair::default())).await.unwrap();
        settle().await;
        first.deactivate();
        // Corrected from another device while this one was away.
        h.server
            .adjust_streak(
                match_id,
                StreakAdjustment {
                    black_win_streak: 2,
                    orange_win_streak: 0,
                },
            )
            .await
            .unwrap();

        h.go_offline();
        let second = h.session();
        second.resume().await.unwrap();
        settle().await;
        assert_eq!(second.prior_streak(), Some(StreakPair::default()));

        h.go_online();
        h.subscriber.push(StreamSignal::Opened);
        h.subscriber
            .push(StreamSignal::Message(PushMessage::Init(InitEvent {
                match_id: Some(match_id),
                stats: Vec::new(),
                black_goals: 0,
                orange_goals: 0,
            })));
        settle().await;

        assert_eq!(second.prior_streak(), Some(StreakPair::new(2, 0)));
        assert_eq!(h.persisted().prior_streak, StreakPair::new(2, 0));
        second.deactivate();
    }

    #[tokio::test(start_paused = true)]
    async fn offline_resume_keeps_the_player_tallies() {
        let h = Harness::new();
        let first = h.session();
        first.start(h.request(StreakPair::default())).await.unwrap();
        first
            .record_goal(GoalEntry {
                scorer_id: Some(h.black[0]),
                ..goal(Team::Black)
            })
            .await
            .unwrap();
        settle().await;
        assert_eq!(first.tallies()[&h.black[0]].goals, 1);
        first.deactivate();

        h.go_offline();
        let second = h.session();
        second.resume().await.unwrap();
        settle().await;
        // The stream fails before any log could be read.
        h.subscriber.fail("network down");
        settle().await;

        assert_eq!(second.tallies()[&h.black[0]].goals, 1);
        assert_eq!(h.persisted().ticker.unwrap().score(), Score::new(1, 0));
        second.deactivate();
    }

    #[tokio::test(start_paused = true)]
    async fn remote_finish_follows_the_server_crowd_override() {
        let h = Harness::new();
        let session = h.session();
        let match_id = session.start(h.request(StreakPair::new(2, 0))).await.unwrap();
        settle().await;

        // Another device ends the draw with the override on.
        h.server
            .finish_match(
                match_id,
                FinishRequest {
                    black_score: 0,
                    orange_score: 0,
                    participants: Vec::new(),
                    many_present: true,
                    present_count: 13,
                },
            )
            .await
            .unwrap();
        h.subscriber
            .push(StreamSignal::Message(PushMessage::Finish(FinishEvent {
                match_id,
                black_score: Some(0),
                orange_score: Some(0),
            })));
        settle().await;

        let report = session.reports().borrow().clone().unwrap();
        assert!(report.remote);
        assert_eq!(report.rotation.mode, RotationMode::BothLeave);
        assert_eq!(report.rotation.next_streak, StreakPair::new(0, 0));
        assert!(matches!(
            session.resolve_tie_break(Team::Black).await,
            Err(SessionError::NoPendingTieBreak)
        ));
    }
}
