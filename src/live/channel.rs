use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::StreamExt;
use rand::Rng;
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    time::sleep,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::SyncSettings,
    live::{
        api::SharedMatchApi,
        connectivity::ConnectivityMonitor,
        scope::{TaskId, TaskScope},
        stream::{EventSubscriber, PushMessage, StreamSignal, StreamTarget},
        timer::Clock,
    },
    state::match_session::{MatchStatus, Score, StatEvent, StreakPair},
};

/// Connection label shown to the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Push stream open.
    Online,
    /// Stream down while a match is observed; polling may be covering.
    Reconnecting,
    /// No network.
    #[default]
    Offline,
}

/// Local view of the observed match, published on every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveView {
    /// Stream being followed.
    pub target: Option<StreamTarget>,
    /// Match being mirrored. The dashboard ticker learns it from `init`.
    pub match_id: Option<Uuid>,
    /// Stream state for the user.
    pub connection: ConnectionState,
    /// Consecutive stream failures, capped.
    pub failures: u32,
    /// The fallback poll is running.
    pub polling: bool,
    /// Authoritative log as last fetched.
    pub events: Vec<StatEvent>,
    /// The log has been read from the server since activation.
    pub synced: bool,
    /// Score derived from `events`.
    pub score: Score,
    /// Streak counters last reported by the server.
    pub streak: Option<StreakPair>,
    /// Match status last reported by the server.
    pub status: Option<MatchStatus>,
    /// Moving average of `server - client` clock offset in milliseconds.
    pub clock_offset_ms: f64,
}

/// Things the owner of the channel must act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNotice {
    /// The observed match finished.
    Finished {
        /// Match that finished.
        match_id: Uuid,
        /// Final score pushed by the server, if any.
        score: Option<Score>,
    },
    /// The dashboard ticker has nothing live.
    Inactive,
}

#[derive(Default)]
struct Runtime {
    scope: TaskScope,
    target: Option<StreamTarget>,
    poll_task: Option<TaskId>,
    finish_notified: bool,
}

struct ChannelInner {
    api: SharedMatchApi,
    subscriber: Arc<dyn EventSubscriber>,
    connectivity: ConnectivityMonitor,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
    view: watch::Sender<LiveView>,
    notices: mpsc::UnboundedSender<ChannelNotice>,
    runtime: Mutex<Runtime>,
}

/// Keeps a [`LiveView`] converged with the authoritative log.
///
/// Push messages only trigger re-reads; the log fetched over REST is the only data that
/// lands in the view. Stream failures escalate to a fixed-interval poll and never lose
/// data.
pub struct LiveSyncChannel {
    inner: Arc<ChannelInner>,
}

impl LiveSyncChannel {
    /// Channel and the receiver of its notices. Nothing runs until [`Self::activate`].
    pub fn new(
        api: SharedMatchApi,
        subscriber: Arc<dyn EventSubscriber>,
        connectivity: ConnectivityMonitor,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelNotice>) {
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let (view, _) = watch::channel(LiveView {
            connection: idle_state(&connectivity),
            ..LiveView::default()
        });
        let inner = ChannelInner {
            api,
            subscriber,
            connectivity,
            clock,
            settings,
            view,
            notices,
            runtime: Mutex::new(Runtime::default()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            notice_rx,
        )
    }

    /// Watch every change of the view.
    pub fn subscribe(&self) -> watch::Receiver<LiveView> {
        self.inner.view.subscribe()
    }

    /// Current view.
    pub fn view(&self) -> LiveView {
        self.inner.view.borrow().clone()
    }

    /// Label for the user: the stream state while active, plain reachability otherwise.
    pub fn connection_state(&self) -> ConnectionState {
        if self.inner.runtime().target.is_none() {
            return idle_state(&self.inner.connectivity);
        }
        self.inner.view.borrow().connection
    }

    /// Open the push subscription. Any previous activation is torn down first.
    pub fn activate(&self, target: StreamTarget) {
        let scope = {
            let mut runtime = self.inner.runtime();
            runtime.scope.cancel_all();
            *runtime = Runtime {
                target: Some(target),
                ..Runtime::default()
            };
            runtime.scope.clone()
        };

        let clock_offset_ms = self.inner.view.borrow().clock_offset_ms;
        self.inner.view.send_replace(LiveView {
            target: Some(target),
            match_id: target.match_id(),
            connection: ConnectionState::Reconnecting,
            clock_offset_ms,
            ..LiveView::default()
        });

        info!(?target, "live sync activated");
        let inner = self.inner.clone();
        scope.spawn("push-stream", inner.run_stream(target));
    }

    /// Tear down the subscription and every timer, synchronously.
    pub fn deactivate(&self) {
        let scope = {
            let mut runtime = self.inner.runtime();
            let scope = runtime.scope.clone();
            runtime.target = None;
            runtime.poll_task = None;
            scope
        };
        scope.cancel_all();

        let connection = idle_state(&self.inner.connectivity);
        self.inner.view.send_modify(|view| {
            *view = LiveView {
                connection,
                clock_offset_ms: view.clock_offset_ms,
                ..LiveView::default()
            };
        });
        debug!("live sync deactivated");
    }

    /// Re-read the log and the match detail now.
    pub async fn refresh(&self) {
        self.inner.refresh().await;
    }

    /// Tasks still running for this channel.
    pub fn active_tasks(&self) -> usize {
        self.inner.runtime().scope.active()
    }
}

impl Drop for LiveSyncChannel {
    fn drop(&mut self) {
        self.inner.runtime().scope.cancel_all();
    }
}

fn idle_state(connectivity: &ConnectivityMonitor) -> ConnectionState {
    if connectivity.is_online() {
        ConnectionState::Online
    } else {
        ConnectionState::Offline
    }
}

impl ChannelInner {
    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_match(&self) -> Option<Uuid> {
        self.view.borrow().match_id
    }

    async fn run_stream(self: Arc<Self>, target: StreamTarget) {
        loop {
            let mut stream = self.subscriber.subscribe(target);
            let mut failed = false;
            while let Some(signal) = stream.next().await {
                match signal {
                    StreamSignal::Opened => self.on_open(),
                    StreamSignal::Message(message) => self.on_message(message).await,
                    StreamSignal::Error(reason) => {
                        self.on_error(&reason);
                        failed = true;
                        break;
                    }
                    StreamSignal::Closed => break,
                }
            }
            if !failed {
                self.on_error("stream closed");
            }

            let delay = self.reconnect_delay();
            debug!(?target, delay_ms = delay.as_millis() as u64, "reconnecting push stream");
            sleep(delay).await;
        }
    }

    /// Capped exponential backoff on the failure counter, plus up to 20% jitter.
    fn reconnect_delay(&self) -> Duration {
        let failures = self.view.borrow().failures.max(1);
        let base = self.settings.reconnect_base;
        let capped = base
            .saturating_mul(1 << (failures - 1).min(16))
            .min(self.settings.reconnect_max);
        let spread = u64::try_from(capped.as_millis() / 5).unwrap_or(0);
        let jitter = rand::rng().random_range(0..=spread);
        capped + Duration::from_millis(jitter)
    }

    fn on_open(&self) {
        let poll = {
            let mut runtime = self.runtime();
            runtime
                .poll_task
                .take()
                .map(|id| (runtime.scope.clone(), id))
        };
        if let Some((scope, id)) = poll {
            scope.cancel(id);
            info!("push stream restored; fallback poll stopped");
        }
        self.view.send_modify(|view| {
            view.connection = ConnectionState::Online;
            view.failures = 0;
            view.polling = false;
        });
    }

    /// Any failure of an active stream reads as reconnecting, whatever the device reachability.
    fn on_error(self: &Arc<Self>, reason: &str) {
        let cap = self.settings.failure_cap;
        let mut failures = 0;
        self.view.send_modify(|view| {
            view.connection = ConnectionState::Reconnecting;
            view.failures = (view.failures + 1).min(cap);
            failures = view.failures;
        });
        debug!(failures, reason, "push stream failed");

        if failures >= self.settings.poll_after_failures {
            self.start_polling();
        }
    }

    fn start_polling(self: &Arc<Self>) {
        let mut runtime = self.runtime();
        if runtime.poll_task.is_some() || runtime.target.is_none() {
            return;
        }
        let inner = self.clone();
        runtime.poll_task = runtime.scope.spawn_interval(
            "fallback-poll",
            self.settings.poll_interval,
            move || {
                let inner = inner.clone();
                async move { inner.refresh().await }
            },
        );
        let started = runtime.poll_task.is_some();
        drop(runtime);

        if started {
            warn!("push stream keeps failing; polling the match log");
            self.view.send_modify(|view| view.polling = true);
        }
    }

    async fn on_message(self: &Arc<Self>, message: PushMessage) {
        match message {
            PushMessage::Init(init) => {
                let target = self.runtime().target;
                let match_id = match (target, init.match_id) {
                    (Some(StreamTarget::Live), announced) => {
                        if announced != self.current_match() {
                            self.runtime().finish_notified = false;
                        }
                        self.view.send_modify(|view| view.match_id = announced);
                        announced
                    }
                    (_, Some(announced)) if Some(announced) != self.current_match() => {
                        debug!(%announced, "ignoring init of another match");
                        return;
                    }
                    _ => self.current_match(),
                };

                let score = Score::new(init.black_goals, init.orange_goals);
                self.view.send_modify(|view| {
                    view.events = init.stats;
                    view.score = score;
                    view.synced = true;
                });
                // `init` carries no streak counters.
                if let Some(match_id) = match_id {
                    self.reconcile_match(match_id).await;
                }
            }
            PushMessage::Goal(_) => {
                if let Some(match_id) = self.current_match() {
                    self.reload_log(match_id).await;
                }
            }
            PushMessage::Ping(ping) => self.on_ping(ping.ts),
            PushMessage::Finish(finish) => {
                if self.current_match() != Some(finish.match_id) {
                    debug!(match_id = %finish.match_id, "ignoring finish of another match");
                    return;
                }
                let score = finish
                    .black_score
                    .zip(finish.orange_score)
                    .map(|(black, orange)| Score::new(black, orange));
                self.view
                    .send_modify(|view| view.status = Some(MatchStatus::Finished));
                self.notify_finished(finish.match_id, score);

                let scope = self.runtime().scope.clone();
                let inner = self.clone();
                scope.spawn_after(
                    "finish-refresh",
                    self.settings.finish_refresh_delay,
                    async move { inner.refresh().await },
                );
            }
            PushMessage::Inactive => {
                self.view.send_modify(|view| {
                    view.match_id = None;
                    view.events.clear();
                    view.synced = false;
                    view.score = Score::default();
                    view.streak = None;
                    view.status = None;
                });
                let _ = self.notices.send(ChannelNotice::Inactive);
            }
            PushMessage::Unknown(name) => debug!(event = %name, "ignoring unknown push event"),
        }
    }

    fn on_ping(&self, server_ts: u64) {
        let sample = server_ts as f64 - self.clock.now_ms() as f64;
        let weight = self.settings.skew_weight;
        self.view.send_modify(|view| {
            view.connection = ConnectionState::Online;
            view.clock_offset_ms = (1.0 - weight) * view.clock_offset_ms + weight * sample;
        });
    }

    fn notify_finished(&self, match_id: Uuid, score: Option<Score>) {
        let first = {
            let mut runtime = self.runtime();
            !std::mem::replace(&mut runtime.finish_notified, true)
        };
        if first {
            info!(%match_id, "observed match finished");
            let _ = self.notices.send(ChannelNotice::Finished { match_id, score });
        }
    }

    async fn refresh(&self) {
        let Some(match_id) = self.current_match() else {
            return;
        };
        self.reload_log(match_id).await;
        self.reconcile_match(match_id).await;
    }

    async fn reload_log(&self, match_id: Uuid) {
        match self.api.fetch_stats(match_id).await {
            Ok(stats) => {
                if self.current_match() != Some(match_id) {
                    return;
                }
                let score = Score::from_events(&stats);
                self.view.send_modify(|view| {
                    view.events = stats;
                    view.score = score;
                    view.synced = true;
                });
            }
            Err(err) => debug!(%match_id, error = %err, "failed to fetch match log"),
        }
    }

    async fn reconcile_match(&self, match_id: Uuid) {
        match self.api.fetch_match(match_id).await {
            Ok(detail) => {
                if self.current_match() != Some(match_id) {
                    return;
                }
                self.view.send_modify(|view| {
                    view.streak = Some(detail.streak());
                    view.status = Some(detail.status);
                });
                if detail.status == MatchStatus::Finished {
                    self.notify_finished(match_id, Some(detail.score()));
                }
            }
            Err(err) => debug!(%match_id, error = %err, "failed to fetch match detail"),
        }
    }
}
