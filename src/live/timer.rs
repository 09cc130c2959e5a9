use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{sync::watch, time::sleep};
use tracing::{debug, info};

use crate::{config::ClockSettings, live::scope::TaskScope, state::match_session::now_ms};

/// Wall clock in epoch milliseconds.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Operating system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        now_ms()
    }
}

/// Clock moved by hand, for replays and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Clock frozen at `now_ms`.
    pub fn new(now_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(now_ms),
        }
    }

    /// Jump to `now_ms`.
    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.now
            .fetch_add(u64::try_from(by.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Failure to sound the alarm; the timer ignores it.
#[derive(Debug, Error)]
pub enum AlarmError {
    /// No audio output.
    #[error("alarm output unavailable: {0}")]
    Unavailable(String),
}

/// Audible overtime signal.
pub trait AlarmSink: Send + Sync {
    /// Play one alarm beep.
    fn sound(&self) -> Result<(), AlarmError>;
}

/// Alarm written to the log, for headless observers.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlarm;

impl AlarmSink for LogAlarm {
    fn sound(&self) -> Result<(), AlarmError> {
        info!("overtime");
        Ok(())
    }
}

/// What the clock display shows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerView {
    /// Seconds since kick-off.
    pub elapsed_secs: u64,
    /// Regulation time is over.
    pub overtime: bool,
    /// The alarm should be ringing.
    pub alarm_active: bool,
    /// The user silenced the alarm.
    pub muted: bool,
}

/// Pure clock state derived from the persisted anchor.
#[derive(Debug, Clone, Copy)]
struct ClockState {
    started_at_ms: u64,
    duration_secs: u64,
    muted: bool,
}

impl ClockState {
    fn view(&self, now_ms: u64) -> TimerView {
        let elapsed_secs = now_ms.saturating_sub(self.started_at_ms) / 1000;
        let overtime = elapsed_secs >= self.duration_secs;
        TimerView {
            elapsed_secs,
            overtime,
            alarm_active: overtime && !self.muted,
            muted: self.muted,
        }
    }
}

/// Match clock with its overtime alarm.
///
/// Elapsed time is always recomputed from the anchor, so a reload loses nothing. Once the
/// configured duration is reached the alarm repeats every cadence until muted or until the
/// owning scope is cancelled.
#[derive(Clone)]
pub struct MatchTimer {
    state: Arc<Mutex<ClockState>>,
    settings: ClockSettings,
    clock: Arc<dyn Clock>,
    alarm: Arc<dyn AlarmSink>,
    view: watch::Sender<TimerView>,
    ringing: Arc<AtomicBool>,
}

impl MatchTimer {
    /// Timer anchored at `started_at_ms`. Nothing runs until [`Self::start`].
    pub fn new(
        started_at_ms: u64,
        muted: bool,
        settings: ClockSettings,
        clock: Arc<dyn Clock>,
        alarm: Arc<dyn AlarmSink>,
    ) -> Self {
        let state = ClockState {
            started_at_ms,
            duration_secs: settings.duration_secs,
            muted,
        };
        let (view, _) = watch::channel(state.view(clock.now_ms()));
        Self {
            state: Arc::new(Mutex::new(state)),
            settings,
            clock,
            alarm,
            view,
            ringing: Arc::new(AtomicBool::new(false)),
        }
    }

    fn state(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recompute the display from the anchor and publish it.
    pub fn tick(&self) -> TimerView {
        let view = self.state().view(self.clock.now_ms());
        self.view.send_replace(view);
        view
    }

    /// Seconds since kick-off, recomputed now.
    pub fn elapsed_secs(&self) -> u64 {
        self.state().view(self.clock.now_ms()).elapsed_secs
    }

    /// Whole minutes on the clock, used to stamp events.
    pub fn minute(&self) -> u32 {
        u32::try_from(self.elapsed_secs() / 60).unwrap_or(u32::MAX)
    }

    /// Silence or re-enable the alarm.
    pub fn set_muted(&self, muted: bool) {
        self.state().muted = muted;
        self.tick();
    }

    /// Watch the display.
    pub fn subscribe(&self) -> watch::Receiver<TimerView> {
        self.view.subscribe()
    }

    /// Spawn the tick loop in `scope`.
    pub fn start(&self, scope: &TaskScope) {
        let timer = self.clone();
        let alarm_scope = scope.clone();
        scope.spawn_interval("match-clock", self.settings.tick, move || {
            let timer = timer.clone();
            let scope = alarm_scope.clone();
            async move {
                let view = timer.tick();
                if view.alarm_active && !timer.ringing.swap(true, Ordering::SeqCst) {
                    timer.spawn_alarm(&scope);
                }
            }
        });
        self.tick();
    }

    fn spawn_alarm(&self, scope: &TaskScope) {
        let timer = self.clone();
        let spawned = scope.spawn("overtime-alarm", async move {
            debug!("overtime alarm started");
            loop {
                if !timer.tick().alarm_active {
                    break;
                }
                if let Err(err) = timer.alarm.sound() {
                    debug!(error = %err, "alarm could not sound");
                }
                sleep(timer.settings.alarm_cadence).await;
            }
            timer.ringing.store(false, Ordering::SeqCst);
            debug!("overtime alarm stopped");
        });
        if spawned.is_none() {
            self.ringing.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[derive(Default)]
    struct CountingAlarm {
        rings: AtomicUsize,
        broken: bool,
    }

    impl AlarmSink for CountingAlarm {
        fn sound(&self) -> Result<(), AlarmError> {
            self.rings.fetch_add(1, Ordering::SeqCst);
            if self.broken {
                return Err(AlarmError::Unavailable("no audio device".into()));
            }
            Ok(())
        }
    }

    fn settings(duration_secs: u64) -> ClockSettings {
        ClockSettings {
            duration_secs,
            tick: Duration::from_secs(1),
            alarm_cadence: Duration::from_millis(1_200),
        }
    }

    #[test]
    fn elapsed_is_derived_from_the_anchor() {
        let clock = Arc::new(ManualClock::new(10_000));
        let timer = MatchTimer::new(
            1_000,
            false,
            settings(600),
            clock.clone(),
            Arc::new(LogAlarm),
        );
        assert_eq!(timer.elapsed_secs(), 9);

        clock.advance(Duration::from_secs(120));
        assert_eq!(timer.minute(), 2);
        assert!(!timer.tick().overtime);
    }

    #[tokio::test(start_paused = true)]
    async fn alarm_repeats_until_muted() {
        let clock = Arc::new(ManualClock::new(0));
        let alarm = Arc::new(CountingAlarm::default());
        let timer = MatchTimer::new(0, false, settings(5), clock.clone(), alarm.clone());
        let scope = TaskScope::new();
        timer.start(&scope);

        clock.set(5_000);
        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(alarm.rings.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(1_200)).await;
        assert_eq!(alarm.rings.load(Ordering::SeqCst), 2);

        timer.set_muted(true);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(alarm.rings.load(Ordering::SeqCst), 2);
        assert!(timer.subscribe().borrow().muted);
        assert!(timer.subscribe().borrow().overtime);

        scope.cancel_all();
        assert_eq!(scope.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_alarm_does_not_stop_the_clock() {
        let clock = Arc::new(ManualClock::new(10_000));
        let alarm = Arc::new(CountingAlarm {
            broken: true,
            ..CountingAlarm::default()
        });
        let timer = MatchTimer::new(0, false, settings(5), clock.clone(), alarm.clone());
        let scope = TaskScope::new();
        timer.start(&scope);

        sleep(Duration::from_millis(3_500)).await;
        assert!(alarm.rings.load(Ordering::SeqCst) >= 2);
        clock.advance(Duration::from_secs(3));
        sleep(Duration::from_secs(1)).await;
        assert_eq!(timer.subscribe().borrow().elapsed_secs, 13);

        scope.cancel_all();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_the_scope_silences_the_alarm() {
        let clock = Arc::new(ManualClock::new(60_000));
        let alarm = Arc::new(CountingAlarm::default());
        let timer = MatchTimer::new(0, false, settings(5), clock, alarm.clone());
        let scope = TaskScope::new();
        timer.start(&scope);

        sleep(Duration::from_millis(1_100)).await;
        scope.cancel_all();
        let rings = alarm.rings.load(Ordering::SeqCst);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(alarm.rings.load(Ordering::SeqCst), rings);
        assert_eq!(scope.active(), 0);
    }
}
