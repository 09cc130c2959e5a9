use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::dto::sse::ServerEvent;

/// SSE-specific sub-state carved out from [`AppState`](super::AppState).
pub struct SseState {
    capacity: usize,
    matches: DashMap<Uuid, SseHub>,
    live: SseHub,
}

impl SseState {
    /// Build the SSE sub-tree; every hub gets the same channel capacity.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            matches: DashMap::new(),
            live: SseHub::new(capacity),
        }
    }

    /// Hub of one match, created on first use.
    pub fn match_hub(&self, match_id: Uuid) -> SseHub {
        self.matches
            .entry(match_id)
            .or_insert_with(|| SseHub::new(self.capacity))
            .clone()
    }

    /// Drop the hub of a finished match once its last event has been sent.
    pub fn retire(&self, match_id: Uuid) {
        self.matches.remove(&match_id);
    }

    /// Hub feeding the dashboard-wide ticker.
    pub fn live(&self) -> &SseHub {
        &self.live
    }
}

/// Simple broadcast hub wrapper used by the SSE services.
#[derive(Clone)]
pub struct SseHub {
    sender: broadcast::Sender<ServerEvent>,
}

impl SseHub {
    /// Construct a new hub backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    /// Send an event to all current subscribers, ignoring delivery errors.
    pub fn broadcast(&self, event: ServerEvent) {
        let _ = self.sender.send(event);
    }
}
