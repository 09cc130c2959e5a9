use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    live::{
        kv::{KeyValueStore, KvError, KvOp},
        queue::QueuedSubmission,
    },
    state::match_session::{PlayerId, Score, StatEvent, StatKind, StreakPair},
};

/// Id of the match being run.
pub const KEY_MATCH_ID: &str = "live.match_id";
/// Whether that match still runs.
pub const KEY_IN_PROGRESS: &str = "live.in_progress";
/// Fielded players of both sides.
pub const KEY_ROSTERS: &str = "live.rosters";
/// Bench players.
pub const KEY_BENCH: &str = "live.bench";
/// Clock anchor and score.
pub const KEY_TICKER: &str = "live.ticker";
/// Per-player tally cache.
pub const KEY_TALLIES: &str = "live.tallies";
/// Alarm mute flag.
pub const KEY_ALARM_MUTED: &str = "live.alarm_muted";
/// Win streaks the match started with, needed to rotate after a reload.
pub const KEY_PRIOR_STREAK: &str = "live.prior_streak";
/// Offline goal queue, shared by every match.
pub const KEY_OFFLINE_QUEUE: &str = "live.offline_queue";

/// Keys owned by one match; the offline queue is shared and filtered instead.
const MATCH_KEYS: [&str; 8] = [
    KEY_MATCH_ID,
    KEY_IN_PROGRESS,
    KEY_ROSTERS,
    KEY_BENCH,
    KEY_TICKER,
    KEY_TALLIES,
    KEY_ALARM_MUTED,
    KEY_PRIOR_STREAK,
];

/// Fielded players of both sides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterSnapshot {
    /// Black roster.
    pub black: Vec<PlayerId>,
    /// Orange roster.
    pub orange: Vec<PlayerId>,
}

/// Clock anchor and score mirror.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerSnapshot {
    /// Kick-off time in epoch milliseconds.
    pub started_at_ms: u64,
    /// Black goals.
    pub black_goals: u32,
    /// Orange goals.
    pub orange_goals: u32,
}

impl TickerSnapshot {
    /// Mirrored score.
    pub fn score(&self) -> Score {
        Score::new(self.black_goals, self.orange_goals)
    }
}

/// Goal involvement of one player.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerTally {
    /// Goals scored.
    pub goals: u32,
    /// Assists given.
    pub assists: u32,
    /// Own goals conceded.
    pub own_goals: u32,
}

/// Per-player tallies derived from an event log.
pub fn tally_events(events: &[StatEvent]) -> BTreeMap<PlayerId, PlayerTally> {
    let mut tallies: BTreeMap<PlayerId, PlayerTally> = BTreeMap::new();
    for event in events.iter().filter(|e| e.event_type == StatKind::Goal) {
        if let Some(scorer) = event.scorer_id {
            let tally = tallies.entry(scorer).or_default();
            if event.is_own_goal {
                tally.own_goals += 1;
            } else {
                tally.goals += 1;
            }
        }
        if let Some(assist) = event.assist_id.filter(|_| !event.is_own_goal) {
            tallies.entry(assist).or_default().assists += 1;
        }
    }
    tallies
}

/// Everything needed to resume a match after a reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Match being run.
    pub match_id: Uuid,
    /// Only in-progress matches are restored.
    pub in_progress: bool,
    /// Fielded players.
    pub rosters: RosterSnapshot,
    /// Bench players.
    pub bench: Vec<PlayerId>,
    /// Clock anchor and last mirrored score.
    pub ticker: Option<TickerSnapshot>,
    /// Last mirrored tallies.
    pub tallies: BTreeMap<PlayerId, PlayerTally>,
    /// Alarm mute flag.
    pub alarm_muted: bool,
    /// Streak counters the match started with.
    pub prior_streak: StreakPair,
}

/// Snapshot found at startup, with the clock already recomputed from its anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredSession {
    /// What was persisted.
    pub snapshot: SessionSnapshot,
    /// Clock at load time.
    pub elapsed_secs: u64,
}

/// Reads and writes the `live.*` keys of the injected store.
#[derive(Clone)]
pub struct SessionSnapshotStore {
    kv: Arc<dyn KeyValueStore>,
}

impl SessionSnapshotStore {
    /// Store over `kv`.
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Write every match key at once.
    pub fn save(&self, snapshot: &SessionSnapshot) -> Result<(), KvError> {
        let mut ops = vec![
            KvOp::set(KEY_MATCH_ID, serde_json::to_string(&snapshot.match_id)?),
            KvOp::set(KEY_IN_PROGRESS, serde_json::to_string(&snapshot.in_progress)?),
            KvOp::set(KEY_ROSTERS, serde_json::to_string(&snapshot.rosters)?),
            KvOp::set(KEY_BENCH, serde_json::to_string(&snapshot.bench)?),
            KvOp::set(KEY_TALLIES, serde_json::to_string(&snapshot.tallies)?),
            KvOp::set(KEY_ALARM_MUTED, serde_json::to_string(&snapshot.alarm_muted)?),
            KvOp::set(KEY_PRIOR_STREAK, serde_json::to_string(&snapshot.prior_streak)?),
        ];
        match &snapshot.ticker {
            Some(ticker) => ops.push(KvOp::set(KEY_TICKER, serde_json::to_string(ticker)?)),
            None => ops.push(KvOp::remove(KEY_TICKER)),
        }
        self.kv.apply(ops)
    }

    /// Mirror the clock anchor and score.
    pub fn save_ticker(&self, ticker: &TickerSnapshot) -> Result<(), KvError> {
        self.put(KEY_TICKER, ticker)
    }

    /// Rosters and bench after a substitution, in one batch.
    pub fn save_rosters(&self, rosters: &RosterSnapshot, bench: &[PlayerId]) -> Result<(), KvError> {
        self.kv.apply(vec![
            KvOp::set(KEY_ROSTERS, serde_json::to_string(rosters)?),
            KvOp::set(KEY_BENCH, serde_json::to_string(bench)?),
        ])
    }

    /// Mirror the tally cache.
    pub fn save_tallies(&self, tallies: &BTreeMap<PlayerId, PlayerTally>) -> Result<(), KvError> {
        self.put(KEY_TALLIES, tallies)
    }

    /// Persisted tallies of the current match, empty when none were mirrored yet.
    pub fn tallies(&self) -> BTreeMap<PlayerId, PlayerTally> {
        self.read(KEY_TALLIES).unwrap_or_default()
    }

    /// Record the streak counters the rotation will start from.
    pub fn save_prior_streak(&self, streak: StreakPair) -> Result<(), KvError> {
        self.put(KEY_PRIOR_STREAK, &streak)
    }

    /// Persist the alarm mute flag.
    pub fn set_alarm_muted(&self, muted: bool) -> Result<(), KvError> {
        self.put(KEY_ALARM_MUTED, &muted)
    }

    /// Persisted mute flag, false when unset.
    pub fn alarm_muted(&self) -> bool {
        self.read(KEY_ALARM_MUTED).unwrap_or(false)
    }

    /// The persisted session, if a match was in progress. Corrupt entries are skipped.
    pub fn load(&self, now_ms: u64) -> Option<RestoredSession> {
        let match_id: Uuid = self.read(KEY_MATCH_ID)?;
        if !self.read::<bool>(KEY_IN_PROGRESS).unwrap_or(false) {
            debug!(%match_id, "persisted match is not in progress");
            return None;
        }

        let ticker: Option<TickerSnapshot> = self.read(KEY_TICKER);
        let elapsed_secs = ticker
            .map(|t| now_ms.saturating_sub(t.started_at_ms) / 1000)
            .unwrap_or(0);

        Some(RestoredSession {
            snapshot: SessionSnapshot {
                match_id,
                in_progress: true,
                rosters: self.read(KEY_ROSTERS).unwrap_or_default(),
                bench: self.read(KEY_BENCH).unwrap_or_default(),
                ticker,
                tallies: self.read(KEY_TALLIES).unwrap_or_default(),
                alarm_muted: self.read(KEY_ALARM_MUTED).unwrap_or(false),
                prior_streak: self.read(KEY_PRIOR_STREAK).unwrap_or_default(),
            },
            elapsed_secs,
        })
    }

    /// Remove every key of `match_id` and its queued submissions in one batch.
    ///
    /// Nothing is removed when the stored keys belong to another match.
    pub fn clear(&self, match_id: Uuid) -> Result<(), KvError> {
        let owner: Option<Uuid> = self.read(KEY_MATCH_ID);
        let mut ops: Vec<KvOp> = if owner.is_none() || owner == Some(match_id) {
            MATCH_KEYS.iter().map(|key| KvOp::remove(*key)).collect()
        } else {
            Vec::new()
        };

        let queue = self.load_queue();
        let kept: Vec<QueuedSubmission> = queue
            .iter()
            .filter(|item| item.match_id != match_id)
            .cloned()
            .collect();
        if kept.len() != queue.len() {
            ops.push(Self::queue_op(&kept)?);
        }

        if ops.is_empty() {
            return Ok(());
        }
        self.kv.apply(ops)
    }

    /// Offline queue; a corrupt entry reads as empty.
    pub fn load_queue(&self) -> Vec<QueuedSubmission> {
        self.read(KEY_OFFLINE_QUEUE).unwrap_or_default()
    }

    /// Replace the offline queue; an empty one removes the key.
    pub fn store_queue(&self, queue: &[QueuedSubmission]) -> Result<(), KvError> {
        self.kv.apply(vec![Self::queue_op(queue)?])
    }

    fn queue_op(queue: &[QueuedSubmission]) -> Result<KvOp, KvError> {
        Ok(if queue.is_empty() {
            KvOp::remove(KEY_OFFLINE_QUEUE)
        } else {
            KvOp::set(KEY_OFFLINE_QUEUE, serde_json::to_string(queue)?)
        })
    }

    fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), KvError> {
        self.kv.set(key, serde_json::to_string(value)?)
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.kv.get(key) {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(key, error = %err, "failed to read local state");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "ignoring corrupt local state entry");
                None
            }
        }
    }
}
