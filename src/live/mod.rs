//! Client core: keeps a local view of one match in sync with the server under unreliable
//! connectivity, buffers offline goals, drives the match clock and survives reloads.

/// Authoritative REST client.
pub mod api;
/// Push channel state machine with polling fallback.
pub mod channel;
/// Network reachability flag and its health check.
pub mod connectivity;
/// Injected key-value storage.
pub mod kv;
/// Offline goal queue.
pub mod queue;
/// Cancellable task registry.
pub mod scope;
/// Per-match controller wiring every client component.
pub mod session;
/// Crash-resilient local mirror of the match in progress.
pub mod snapshot;
/// Push subscription abstraction and its SSE implementation.
pub mod stream;
/// Match clock and overtime alarm.
pub mod timer;

#[cfg(test)]
pub(crate) mod testing;
