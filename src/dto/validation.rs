//! Validation helpers for DTOs.

use std::collections::HashSet;

use uuid::Uuid;
use validator::ValidationError;

/// Longest match minute accepted on an event, extra time included.
pub const MAX_MATCH_MINUTE: u32 = 240;

/// Validates that a list of players contains no duplicates.
pub fn validate_distinct_players(players: &[Uuid]) -> Result<(), ValidationError> {
    let mut seen = HashSet::with_capacity(players.len());
    if let Some(duplicate) = players.iter().find(|player| !seen.insert(**player)) {
        let mut err = ValidationError::new("duplicate_player");
        err.message = Some(format!("player `{duplicate}` is listed more than once").into());
        return Err(err);
    }
    Ok(())
}

/// Validates that a roster is not empty and has no duplicates.
pub fn validate_roster(players: &[Uuid]) -> Result<(), ValidationError> {
    if players.is_empty() {
        let mut err = ValidationError::new("empty_roster");
        err.message = Some("a roster needs at least one player".into());
        return Err(err);
    }
    validate_distinct_players(players)
}
