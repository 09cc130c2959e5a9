use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::DashMap;
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::{
    dao::{
        match_store::{AppendOutcome, MatchStore},
        storage::{StorageError, StorageResult},
    },
    state::match_session::{MatchSession, StatEvent},
};

#[derive(Debug, Default)]
struct MatchLog {
    events: Vec<StatEvent>,
    /// Idempotency key -> stat id.
    keys: HashMap<Uuid, Uuid>,
}

#[derive(Debug, Default)]
struct Inner {
    matches: DashMap<Uuid, MatchSession>,
    logs: DashMap<Uuid, MatchLog>,
    offline: AtomicBool,
}

/// Process-local match store backed by concurrent maps.
#[derive(Clone, Default)]
pub struct MemoryMatchStore {
    inner: Arc<Inner>,
}

impl MemoryMatchStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails until switched back on.
    pub fn set_available(&self, available: bool) {
        self.inner.offline.store(!available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> StorageResult<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable("memory", "switched off"));
        }
        Ok(())
    }
}

impl MatchStore for MemoryMatchStore {
    fn save_match(&self, session: MatchSession) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_available()?;
            store.inner.logs.entry(session.id).or_default();
            store.inner.matches.insert(session.id, session);
            Ok(())
        })
    }

    fn find_match(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<MatchSession>>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_available()?;
            Ok(store.inner.matches.get(&id).map(|entry| entry.clone()))
        })
    }

    fn list_matches(&self) -> BoxFuture<'static, StorageResult<Vec<MatchSession>>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_available()?;
            Ok(store
                .inner
                .matches
                .iter()
                .map(|entry| entry.value().clone())
                .collect())
        })
    }

    fn append_stat(
        &self,
        stat: StatEvent,
        idempotency_key: Option<Uuid>,
    ) -> BoxFuture<'static, StorageResult<AppendOutcome>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_available()?;
            // The entry guard serializes appends to the same log.
            let mut log = store.inner.logs.entry(stat.match_id).or_default();

            if let Some(key) = idempotency_key {
                if let Some(existing) = log
                    .keys
                    .get(&key)
                    .and_then(|stat_id| log.events.iter().find(|e| e.stat_id == *stat_id))
                {
                    return Ok(AppendOutcome::Duplicate(existing.clone()));
                }
                log.keys.insert(key, stat.stat_id);
            }

            log.events.push(stat.clone());
            Ok(AppendOutcome::Appended(stat))
        })
    }

    fn find_keyed_stat(
        &self,
        match_id: Uuid,
        idempotency_key: Uuid,
    ) -> BoxFuture<'static, StorageResult<Option<StatEvent>>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_available()?;
            let Some(log) = store.inner.logs.get(&match_id) else {
                return Ok(None);
            };
            Ok(log
                .keys
                .get(&idempotency_key)
                .and_then(|stat_id| log.events.iter().find(|e| e.stat_id == *stat_id))
                .cloned())
        })
    }

    fn list_stats(&self, match_id: Uuid) -> BoxFuture<'static, StorageResult<Vec<StatEvent>>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_available()?;
            Ok(store
                .inner
                .logs
                .get(&match_id)
                .map(|log| log.events.clone())
                .unwrap_or_default())
        })
    }

    fn remove_stat(
        &self,
        match_id: Uuid,
        stat_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move {
            store.ensure_available()?;
            let Some(mut log) = store.inner.logs.get_mut(&match_id) else {
                return Ok(false);
            };
            let before = log.events.len();
            log.events.retain(|event| event.stat_id != stat_id);
            log.keys.retain(|_, stored| *stored != stat_id);
            Ok(log.events.len() != before)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_available() })
    }
}
