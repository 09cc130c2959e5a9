//! Headless live client: resumes (or attaches to) a match and logs its live state.
//!
//! `PELADA_SERVER_URL` points at the server, `PELADA_MATCH_ID` picks a match to attach to,
//! and `PELADA_STATE_PATH` is where the session snapshot survives restarts. Without a match
//! to run it follows the server's live ticker.

use std::{env, sync::Arc, time::Duration};

use anyhow::Context;
use reqwest::Client;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use pelada_live::{
    config::AppConfig,
    live::{
        api::{HttpMatchApi, SharedMatchApi},
        channel::{ChannelNotice, LiveSyncChannel},
        connectivity::{ConnectivityMonitor, run_health_check},
        kv::JsonFileKvStore,
        session::{LiveSession, SessionDeps},
        stream::{SseSubscriber, StreamTarget},
        timer::{LogAlarm, SystemClock},
    },
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let base_url = env::var("PELADA_SERVER_URL").unwrap_or_else(|_| "http://localhost:8080".into());
    let state_path =
        env::var("PELADA_STATE_PATH").unwrap_or_else(|_| "pelada-live-state.json".into());
    let match_id = env::var("PELADA_MATCH_ID")
        .ok()
        .map(|raw| raw.parse::<Uuid>())
        .transpose()
        .context("PELADA_MATCH_ID is not a UUID")?;

    let config = AppConfig::load();
    let api: SharedMatchApi =
        Arc::new(HttpMatchApi::new(base_url.clone(), REQUEST_TIMEOUT).context("building HTTP client")?);
    let subscriber = Arc::new(SseSubscriber::new(Client::new(), base_url.clone()));
    let kv = Arc::new(JsonFileKvStore::open(&state_path).context("opening local state")?);
    let connectivity = ConnectivityMonitor::new(true);
    let checker = tokio::spawn(run_health_check(connectivity.clone(), api.clone()));

    let session = LiveSession::new(SessionDeps {
        api: api.clone(),
        subscriber: subscriber.clone(),
        connectivity: connectivity.clone(),
        clock: Arc::new(SystemClock),
        alarm: Arc::new(LogAlarm),
        kv,
        config: config.clone(),
    });

    let running = match session.resume().await {
        Ok(Some(id)) => Some(id),
        Ok(None) => match match_id {
            Some(id) => match session.attach(id).await {
                Ok(()) => Some(id),
                Err(err) => {
                    warn!(match_id = %id, error = %err, "cannot attach; following the live ticker");
                    None
                }
            },
            None => None,
        },
        Err(err) => {
            warn!(error = %err, "failed to resume persisted match");
            None
        }
    };

    if let Some(id) = running {
        info!(match_id = %id, server = %base_url, "running match");
        observe_session(&session).await;
        session.deactivate();
    } else {
        info!(server = %base_url, "following the live ticker");
        let (ticker, notices) = LiveSyncChannel::new(
            api,
            subscriber,
            connectivity,
            Arc::new(SystemClock),
            config.sync.clone(),
        );
        ticker.activate(StreamTarget::Live);
        observe_ticker(&ticker, notices).await;
        ticker.deactivate();
    }

    checker.abort();
    Ok(())
}

/// Log score and clock changes until Ctrl+C or until the match is finalized.
async fn observe_session(session: &LiveSession) {
    let (Some(mut view), Some(mut timer)) = (session.live_view(), session.timer_view()) else {
        return;
    };
    let mut reports = session.reports();
    let mut last_minute = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = view.borrow_and_update().clone();
                info!(
                    black = view.score.black,
                    orange = view.score.orange,
                    connection = ?view.connection,
                    polling = view.polling,
                    pending = session.pending_goals(),
                    "live view"
                );
            }
            changed = timer.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *timer.borrow_and_update();
                let minute = current.elapsed_secs / 60;
                if last_minute != Some(minute) {
                    last_minute = Some(minute);
                    info!(minute, overtime = current.overtime, "clock");
                }
            }
            changed = reports.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(report) = reports.borrow_and_update().clone() {
                    info!(
                        match_id = %report.match_id,
                        black = report.final_score.black,
                        orange = report.final_score.orange,
                        mode = ?report.rotation.mode,
                        "match finished"
                    );
                    break;
                }
            }
        }
    }
}

async fn observe_ticker(
    ticker: &LiveSyncChannel,
    mut notices: tokio::sync::mpsc::UnboundedReceiver<ChannelNotice>,
) {
    let mut view = ticker.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = view.borrow_and_update().clone();
                match view.match_id {
                    Some(id) => info!(
                        match_id = %id,
                        black = view.score.black,
                        orange = view.score.orange,
                        connection = ?view.connection,
                        "ticker"
                    ),
                    None => info!(connection = ?view.connection, "no live match"),
                }
            }
            Some(notice) = notices.recv() => match notice {
                ChannelNotice::Finished { match_id, score } => {
                    info!(%match_id, ?score, "live match finished");
                }
                ChannelNotice::Inactive => info!("live match ended"),
            },
        }
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
