use futures::future::BoxFuture;
use uuid::Uuid;

use crate::{
    dao::storage::StorageResult,
    state::match_session::{MatchSession, StatEvent},
};

/// Result of appending to a match log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The event was new and is now part of the log.
    Appended(StatEvent),
    /// An event with the same idempotency key was already stored; it is returned unchanged.
    Duplicate(StatEvent),
}

impl AppendOutcome {
    /// Stored event, whichever way the append went.
    pub fn stat(&self) -> &StatEvent {
        match self {
            AppendOutcome::Appended(stat) | AppendOutcome::Duplicate(stat) => stat,
        }
    }

    /// Consume into the stored event.
    pub fn into_stat(self) -> StatEvent {
        match self {
            AppendOutcome::Appended(stat) | AppendOutcome::Duplicate(stat) => stat,
        }
    }
}

/// Abstraction over the persistence layer for matches and their event logs.
pub trait MatchStore: Send + Sync {
    /// Insert or replace a match.
    fn save_match(&self, session: MatchSession) -> BoxFuture<'static, StorageResult<()>>;
    /// Match by id.
    fn find_match(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<MatchSession>>>;
    /// Every stored match, in no particular order.
    fn list_matches(&self) -> BoxFuture<'static, StorageResult<Vec<MatchSession>>>;
    /// Append an event, deduplicating on `idempotency_key` when one is given.
    fn append_stat(
        &self,
        stat: StatEvent,
        idempotency_key: Option<Uuid>,
    ) -> BoxFuture<'static, StorageResult<AppendOutcome>>;
    /// Event stored under an idempotency key, if any.
    fn find_keyed_stat(
        &self,
        match_id: Uuid,
        idempotency_key: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<StatEvent>>>;
    /// Events of a match in append order.
    fn list_stats(&self, match_id: Uuid) -> BoxFuture<'static, StorageResult<Vec<StatEvent>>>;
    /// Remove one event; returns whether it existed.
    fn remove_stat(&self, match_id: Uuid, stat_id: Uuid)
    -> BoxFuture<'static, StorageResult<bool>>;
    /// Fail when the backend cannot serve requests.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
}
