//! Live player records
//!
//! One [`Player`] exists per currently connected participant; the record is
//! removed from the round's live table on disconnect and preserved inside
//! the session store for the duration of the grace period.

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::{constants, watcher::Id};

/// A participant's live state for the current round
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    /// The transport connection currently carrying this player
    pub connection: Id,
    /// Sanitized, unique display name
    pub name: String,
    /// Palette color assigned at join, stable for the session's lifetime
    pub color: String,
    /// Free-text message shown to everyone if this player wins
    pub ad_message: String,
    /// Taps accepted during the stage-1 window
    pub tap_count_stage1: u32,
    /// Milliseconds from stage-2 window start to the player's first
    /// accepted tap in that window; set at most once per round
    pub reaction_time_ms: Option<u32>,
    /// Advisory bot-likeness flag with a human-readable reason
    pub suspicious: Option<String>,
    /// Monotonic join counter, used as the deterministic tie-breaker in
    /// every leaderboard ordering
    pub join_order: usize,
}

impl Player {
    /// Creates a fresh player record with zeroed per-round counters
    pub fn new(
        connection: Id,
        name: String,
        color: String,
        ad_message: String,
        join_order: usize,
    ) -> Self {
        Self {
            connection,
            name,
            color,
            ad_message,
            tap_count_stage1: 0,
            reaction_time_ms: None,
            suspicious: None,
            join_order,
        }
    }

    /// Resets the per-round counters, keeping identity intact
    pub fn reset_round_state(&mut self) {
        self.tap_count_stage1 = 0;
        self.reaction_time_ms = None;
        self.suspicious = None;
    }
}

/// Picks the palette color for the `n`-th join, round-robin
pub fn color_for_join(join_order: usize) -> String {
    let palette = constants::player::COLOR_PALETTE;
    palette[join_order % palette.len()].to_owned()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_palette_round_robin() {
        let len = constants::player::COLOR_PALETTE.len();

        assert_eq!(color_for_join(0), constants::player::COLOR_PALETTE[0]);
        assert_eq!(color_for_join(len), constants::player::COLOR_PALETTE[0]);
        assert_eq!(color_for_join(len + 3), constants::player::COLOR_PALETTE[3]);
    }

    #[test]
    fn test_reset_round_state_keeps_identity() {
        let mut player = Player::new(
            Id::new(),
            "Ada".to_owned(),
            color_for_join(0),
            "hi".to_owned(),
            0,
        );
        player.tap_count_stage1 = 42;
        player.reaction_time_ms = Some(120);
        player.suspicious = Some("too regular".to_owned());

        player.reset_round_state();

        assert_eq!(player.tap_count_stage1, 0);
        assert_eq!(player.reaction_time_ms, None);
        assert_eq!(player.suspicious, None);
        assert_eq!(player.name, "Ada");
    }
}
