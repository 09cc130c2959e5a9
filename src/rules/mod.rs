//! Pure match rules shared by the server and the observing clients.

/// Rotation decision after a finished match.
pub mod rotation;
/// Win-streak counter rule.
pub mod streak;
