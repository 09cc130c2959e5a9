/// Match and event-log storage abstraction.
pub mod match_store;
/// In-memory match store.
pub mod memory;
/// Storage error types shared by every backend.
pub mod storage;
