//! Live match session synchronization and rotation engine.
//!
//! The crate holds both halves of the system: the authoritative server (`dao`, `state`,
//! `services`, `routes`) and the observing client core (`live`). The pure streak and
//! rotation rules in `rules` are shared by both.

/// JSON configuration with built-in defaults.
pub mod config;
/// Match and event-log storage.
pub mod dao;
/// Request, response and push payloads.
pub mod dto;
/// Service and HTTP error types.
pub mod error;
/// Observing client core.
pub mod live;
/// HTTP routes.
pub mod routes;
/// Streak and rotation rules.
pub mod rules;
/// Server-side operations behind the routes.
pub mod services;
/// Shared server state and match lifecycles.
pub mod state;
