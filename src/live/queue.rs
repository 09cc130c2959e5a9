use std::{
    collections::HashSet,
    sync::{Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dto::matches::GoalSubmission,
    live::{api::SharedMatchApi, kv::KvError, snapshot::SessionSnapshotStore},
};

/// Goal submission waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedSubmission {
    /// Match the goal belongs to.
    pub match_id: Uuid,
    /// Submission as first attempted, key included.
    pub payload: GoalSubmission,
    /// Local time it was queued.
    pub enqueued_at_ms: u64,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Accepted by the server, duplicates included.
    pub applied: usize,
    /// Rejected for good and discarded.
    pub dropped: usize,
    /// Still queued, all matches.
    pub remaining: usize,
}

impl DrainReport {
    /// The authoritative log may have changed; the local view should be refreshed.
    pub fn changed_log(&self) -> bool {
        self.applied > 0 || self.dropped > 0
    }
}

/// Persistent FIFO of goal submissions that could not reach the server.
///
/// Submissions carry their idempotency key from the first attempt, so replaying one the
/// server already stored is harmless.
pub struct OfflineGoalQueue {
    snapshots: SessionSnapshotStore,
    api: SharedMatchApi,
    /// At most one drain pass at a time.
    drain_gate: tokio::sync::Mutex<()>,
    /// Serializes read-modify-write of the persisted list.
    write_gate: Mutex<()>,
}

impl OfflineGoalQueue {
    /// Queue persisted through `snapshots`.
    pub fn new(snapshots: SessionSnapshotStore, api: SharedMatchApi) -> Self {
        Self {
            snapshots,
            api,
            drain_gate: tokio::sync::Mutex::new(()),
            write_gate: Mutex::new(()),
        }
    }

    /// Append a submission unless its key is already queued.
    pub fn enqueue(
        &self,
        match_id: Uuid,
        payload: GoalSubmission,
        now_ms: u64,
    ) -> Result<(), KvError> {
        let _write = self.write_gate.lock().unwrap_or_else(PoisonError::into_inner);
        let mut queue = self.snapshots.load_queue();
        let key = payload.idempotency_key;
        if queue.iter().any(|item| item.payload.idempotency_key == key) {
            return Ok(());
        }
        queue.push(QueuedSubmission {
            match_id,
            payload,
            enqueued_at_ms: now_ms,
        });
        self.snapshots.store_queue(&queue)?;
        info!(%match_id, %key, pending = queue.len(), "goal queued until connectivity returns");
        Ok(())
    }

    /// Queued submissions in order.
    pub fn pending(&self) -> Vec<QueuedSubmission> {
        self.snapshots.load_queue()
    }

    /// Replay the submissions of `active_match` in order.
    ///
    /// Accepted and definitively rejected items leave the queue. The first transient failure
    /// stops the pass and keeps that item and everything after it. Items of other matches
    /// are left alone, and nothing is sent while offline.
    pub async fn drain(&self, active_match: Option<Uuid>, is_online: bool) -> DrainReport {
        if !is_online {
            return DrainReport {
                remaining: self.snapshots.load_queue().len(),
                ..DrainReport::default()
            };
        }
        let Some(match_id) = active_match else {
            return DrainReport {
                remaining: self.snapshots.load_queue().len(),
                ..DrainReport::default()
            };
        };

        let _drain = self.drain_gate.lock().await;
        let snapshot = self.snapshots.load_queue();
        let mut report = DrainReport::default();
        let mut settled: HashSet<Uuid> = HashSet::new();

        for item in snapshot.iter().filter(|item| item.match_id == match_id) {
            let key = item.payload.idempotency_key;
            match self.api.submit_goal(match_id, item.payload.clone()).await {
                Ok(stat) => {
                    debug!(%match_id, %key, stat_id = %stat.stat_id, "queued goal applied");
                    report.applied += 1;
                    settled.insert(key);
                }
                Err(err) if err.is_definitive_rejection() => {
                    warn!(%match_id, %key, error = %err, "queued goal rejected; dropping it");
                    report.dropped += 1;
                    settled.insert(key);
                }
                Err(err) => {
                    debug!(%match_id, %key, error = %err, "queued goal still undeliverable");
                    break;
                }
            }
        }

        report.remaining = self.remove_settled(&settled);
        if report.changed_log() {
            info!(
                %match_id,
                applied = report.applied,
                dropped = report.dropped,
                remaining = report.remaining,
                "offline queue drained"
            );
        }
        report
    }

    /// Remove settled items from the current list, keeping anything enqueued meanwhile.
    fn remove_settled(&self, settled: &HashSet<Uuid>) -> usize {
        let _write = self.write_gate.lock().unwrap_or_else(PoisonError::into_inner);
        let mut queue = self.snapshots.load_queue();
        if settled.is_empty() {
            return queue.len();
        }
        queue.retain(|item| !settled.contains(&item.payload.idempotency_key));
        if let Err(err) = self.snapshots.store_queue(&queue) {
            warn!(error = %err, "failed to persist drained queue; items will be replayed");
        }
        queue.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        live::{
            api::{ApiError, MatchApi},
            kv::MemoryKvStore,
            testing::FakeServer,
        },
        state::match_session::Team,
    };

    fn goal(minute: u32) -> GoalSubmission {
        GoalSubmission {
            idempotency_key: Uuid::new_v4(),
            team: Team::Black,
            scorer_id: None,
            assist_id: None,
            is_own_goal: false,
            minute,
        }
    }

    fn setup() -> (Arc<FakeServer>, Uuid, OfflineGoalQueue) {
        let server = Arc::new(FakeServer::new());
        let detail = server.seed_match(&[Uuid::new_v4()], &[Uuid::new_v4()], &[]);
        let snapshots = SessionSnapshotStore::new(Arc::new(MemoryKvStore::new()));
        (server.clone(), detail.id, OfflineGoalQueue::new(snapshots, server))
    }

    fn unreachable() -> ApiError {
        ApiError::Unreachable("connection refused".into())
    }

    fn forbidden() -> ApiError {
        ApiError::Status {
            status: 403,
            message: "match is closed".into(),
        }
    }

    #[tokio::test]
    async fn offline_drain_sends_nothing() {
        let (server, match_id, queue) = setup();
        queue.enqueue(match_id, goal(1), 0).unwrap();

        let report = queue.drain(Some(match_id), false).await;
        assert_eq!(report.remaining, 1);
        assert!(server.goal_calls().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_stops_the_pass_and_keeps_order() {
        let (server, match_id, queue) = setup();
        let (first, second, third) = (goal(1), goal(2), goal(3));
        for g in [&first, &second, &third] {
            queue.enqueue(match_id, g.clone(), 0).unwrap();
        }
        server.script_goals([None, Some(unreachable())]);

        let report = queue.drain(Some(match_id), true).await;
        assert_eq!(
            report,
            DrainReport {
                applied: 1,
                dropped: 0,
                remaining: 2
            }
        );
        let keys: Vec<Uuid> = queue
            .pending()
            .iter()
            .map(|item| item.payload.idempotency_key)
            .collect();
        assert_eq!(keys, vec![second.idempotency_key, third.idempotency_key]);
        assert_eq!(
            server.goal_calls(),
            vec![first.idempotency_key, second.idempotency_key]
        );
    }

    #[tokio::test]
    async fn rejected_items_are_dropped_and_the_rest_applied() {
        let (server, match_id, queue) = setup();
        queue.enqueue(match_id, goal(1), 0).unwrap();
        queue.enqueue(match_id, goal(2), 0).unwrap();
        server.fail_next_goals([forbidden()]);

        let report = queue.drain(Some(match_id), true).await;
        assert_eq!(report.applied, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.remaining, 0);
        assert!(report.changed_log());
        assert_eq!(server.stats(match_id).len(), 1);
    }

    #[tokio::test]
    async fn other_matches_stay_queued() {
        let (server, active, queue) = setup();
        let stale = Uuid::new_v4();
        queue.enqueue(stale, goal(1), 0).unwrap();
        queue.enqueue(active, goal(2), 0).unwrap();

        let report = queue.drain(Some(active), true).await;
        assert_eq!(report.applied, 1);
        assert_eq!(report.remaining, 1);
        assert_eq!(queue.pending()[0].match_id, stale);
        assert_eq!(server.goal_calls().len(), 1);

        let idle = queue.drain(None, true).await;
        assert_eq!(idle.remaining, 1);
    }

    #[tokio::test]
    async fn second_drain_after_success_is_a_no_op() {
        let (server, match_id, queue) = setup();
        let submission = goal(4);
        queue.enqueue(match_id, submission.clone(), 0).unwrap();
        queue.enqueue(match_id, submission.clone(), 0).unwrap();

        queue.drain(Some(match_id), true).await;
        let again = queue.drain(Some(match_id), true).await;

        assert_eq!(again, DrainReport::default());
        assert_eq!(server.goal_calls(), vec![submission.idempotency_key]);
        assert_eq!(server.stats(match_id).len(), 1);
    }

    #[tokio::test]
    async fn replay_of_an_already_stored_goal_is_counted_once() {
        let (server, match_id, queue) = setup();
        let submission = goal(7);
        // The first send reached the server but the answer was lost.
        server.submit_goal(match_id, submission.clone()).await.unwrap();
        queue.enqueue(match_id, submission, 0).unwrap();

        let report = queue.drain(Some(match_id), true).await;
        assert_eq!(report.applied, 1);
        assert_eq!(server.stats(match_id).len(), 1);
    }
}
