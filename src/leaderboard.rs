//! Leaderboard and final scoring
//!
//! The live leaderboard is a ranked view over the round's live player
//! table: descending stage-1 taps, ties broken by join order. At the
//! finished transition a frozen snapshot is computed exactly once, applying
//! the reaction-time multiplier, and is never recomputed from live state
//! afterwards.
//!
//! Final scores use integer hundredths (taps x multiplier x 100) so that
//! ordering and winner selection are exact integer comparisons; the
//! displayed score is `centis / 100` as a float. Reaction multipliers rank
//! strictly by reaction time, independent of the resulting scores.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::player::Player;

/// Multiplier for the n-th fastest reaction, in hundredths
const REACTION_MULTIPLIER_CENTIS: [u64; 3] = [200, 150, 125];
/// Multiplier for everyone else, including players with no recorded
/// reaction, in hundredths
const BASE_MULTIPLIER_CENTIS: u64 = 100;

/// One row of the live leaderboard
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveEntry {
    /// Player display name
    pub name: String,
    /// Player palette color
    pub color: String,
    /// Stage-1 taps so far
    pub taps: u32,
    /// Stage-2 reaction time, once recorded
    pub reaction_time_ms: Option<u32>,
    /// Advisory bot-likeness reason, if flagged
    pub suspicious: Option<String>,
}

/// One row of the frozen final leaderboard
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalEntry {
    /// Player display name
    pub name: String,
    /// Player palette color
    pub color: String,
    /// Stage-1 taps
    pub taps: u32,
    /// Stage-2 reaction time, if recorded
    pub reaction_time_ms: Option<u32>,
    /// Reaction-rank multiplier applied to the tap count
    pub multiplier: f64,
    /// Final score (`taps x multiplier`), for display
    pub final_score: f64,
    /// Final score in exact hundredths, the authoritative ordering key
    pub score_centis: u64,
}

/// The winner payload broadcast when a round finishes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Winner {
    /// Winner display name
    pub name: String,
    /// Winner palette color
    pub color: String,
    /// The winner's ad message, shown to all consoles
    pub ad_message: String,
    /// The winning final score, for display
    pub final_score: f64,
}

/// Immutable ranked snapshot captured at round finish
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrozenLeaderboard {
    /// All participants, descending by final score
    pub entries: Vec<FinalEntry>,
    /// The top entry, if its final score is strictly positive
    pub winner: Option<Winner>,
}

/// Builds the live leaderboard from the round's player table
///
/// Sorted descending by stage-1 taps; equal tap counts keep join order
/// (stable sort over a join-ordered base).
pub fn live<'a>(players: impl Iterator<Item = &'a Player>) -> Vec<LiveEntry> {
    players
        .sorted_by_key(|p| p.join_order)
        .sorted_by_key(|p| std::cmp::Reverse(p.tap_count_stage1))
        .map(|p| LiveEntry {
            name: p.name.clone(),
            color: p.color.clone(),
            taps: p.tap_count_stage1,
            reaction_time_ms: p.reaction_time_ms,
            suspicious: p.suspicious.clone(),
        })
        .collect_vec()
}

/// Computes the frozen final leaderboard from the live player table
///
/// Players with a recorded reaction time are ranked by ascending reaction
/// time (ties by join order); the fastest three receive the 2.0x / 1.5x /
/// 1.25x multipliers, everyone else 1.0x. Each final score is the stage-1
/// tap count times the multiplier, ordered descending with join-order
/// tie-breaking. No winner is declared unless the top score is strictly
/// positive.
pub fn freeze<'a>(players: impl Iterator<Item = &'a Player>) -> FrozenLeaderboard {
    let players = players.sorted_by_key(|p| p.join_order).collect_vec();

    let reaction_ranks: Vec<usize> = players
        .iter()
        .enumerate()
        .filter(|(_, p)| p.reaction_time_ms.is_some())
        .sorted_by_key(|(_, p)| (p.reaction_time_ms, p.join_order))
        .map(|(index, _)| index)
        .collect_vec();

    let multiplier_of = |index: usize| {
        reaction_ranks
            .iter()
            .position(|i| *i == index)
            .and_then(|rank| REACTION_MULTIPLIER_CENTIS.get(rank).copied())
            .unwrap_or(BASE_MULTIPLIER_CENTIS)
    };

    let entries = players
        .iter()
        .enumerate()
        .map(|(index, p)| {
            let centis = multiplier_of(index);
            let score_centis = u64::from(p.tap_count_stage1) * centis;
            FinalEntry {
                name: p.name.clone(),
                color: p.color.clone(),
                taps: p.tap_count_stage1,
                reaction_time_ms: p.reaction_time_ms,
                multiplier: centis as f64 / 100.0,
                final_score: score_centis as f64 / 100.0,
                score_centis,
            }
        })
        .sorted_by_key(|entry| std::cmp::Reverse(entry.score_centis))
        .collect_vec();

    let winner = entries
        .first()
        .filter(|top| top.score_centis > 0)
        .map(|top| {
            let ad_message = players
                .iter()
                .find(|p| p.name == top.name)
                .map(|p| p.ad_message.clone())
                .unwrap_or_default();
            Winner {
                name: top.name.clone(),
                color: top.color.clone(),
                ad_message,
                final_score: top.final_score,
            }
        });

    FrozenLeaderboard { entries, winner }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::{player::color_for_join, watcher::Id};

    fn player(name: &str, join_order: usize, taps: u32, reaction: Option<u32>) -> Player {
        let mut p = Player::new(
            Id::new(),
            name.to_owned(),
            color_for_join(join_order),
            format!("{name} says hi"),
            join_order,
        );
        p.tap_count_stage1 = taps;
        p.reaction_time_ms = reaction;
        p
    }

    #[test]
    fn test_live_sorts_by_taps_then_join_order() {
        let players = vec![
            player("A", 0, 10, None),
            player("B", 1, 25, None),
            player("C", 2, 10, None),
        ];

        let live = live(players.iter());
        let names: Vec<&str> = live.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["B", "A", "C"]);
    }

    #[test]
    fn test_reaction_multiplier_beats_raw_taps() {
        // A: 50 taps, fastest reaction -> 50 x 2.0 = 100
        // B: 80 taps, second fastest  -> 80 x 1.5 = 120 -> winner
        let players = vec![
            player("A", 0, 50, Some(120)),
            player("B", 1, 80, Some(300)),
        ];

        let frozen = freeze(players.iter());
        assert_eq!(frozen.entries[0].name, "B");
        assert_eq!(frozen.entries[0].final_score, 120.0);
        assert_eq!(frozen.entries[1].final_score, 100.0);

        let winner = frozen.winner.unwrap();
        assert_eq!(winner.name, "B");
        assert_eq!(winner.ad_message, "B says hi");
    }

    #[test]
    fn test_multiplier_table() {
        let players = vec![
            player("First", 0, 10, Some(100)),
            player("Second", 1, 10, Some(200)),
            player("Third", 2, 10, Some(300)),
            player("Fourth", 3, 10, Some(400)),
            player("NoReaction", 4, 10, None),
        ];

        let frozen = freeze(players.iter());
        let by_name = |name: &str| {
            frozen
                .entries
                .iter()
                .find(|e| e.name == name)
                .unwrap()
                .multiplier
        };

        assert_eq!(by_name("First"), 2.0);
        assert_eq!(by_name("Second"), 1.5);
        assert_eq!(by_name("Third"), 1.25);
        assert_eq!(by_name("Fourth"), 1.0);
        assert_eq!(by_name("NoReaction"), 1.0);
    }

    #[test]
    fn test_quarter_multiplier_is_exact() {
        let players = vec![
            player("A", 0, 7, Some(100)),
            player("B", 1, 7, Some(200)),
            player("C", 2, 7, Some(300)),
        ];

        let frozen = freeze(players.iter());
        let third = frozen.entries.iter().find(|e| e.name == "C").unwrap();
        assert_eq!(third.score_centis, 875);
        assert_eq!(third.final_score, 8.75);
    }

    #[test]
    fn test_final_score_tie_breaks_by_join_order() {
        let players = vec![player("Late", 1, 30, None), player("Early", 0, 30, None)];

        let frozen = freeze(players.iter());
        assert_eq!(frozen.entries[0].name, "Early");
        assert_eq!(frozen.entries[1].name, "Late");
    }

    #[test]
    fn test_zero_taps_means_no_winner() {
        let players = vec![player("A", 0, 0, Some(100)), player("B", 1, 0, None)];

        let frozen = freeze(players.iter());
        assert_eq!(frozen.entries.len(), 2);
        assert!(frozen.winner.is_none());
    }

    #[test]
    fn test_empty_table_freezes_empty() {
        let frozen = freeze(std::iter::empty());
        assert!(frozen.entries.is_empty());
        assert!(frozen.winner.is_none());
    }

    #[test]
    fn test_reaction_tie_breaks_by_join_order() {
        let players = vec![
            player("Late", 1, 10, Some(150)),
            player("Early", 0, 10, Some(150)),
        ];

        let frozen = freeze(players.iter());
        let early = frozen.entries.iter().find(|e| e.name == "Early").unwrap();
        let late = frozen.entries.iter().find(|e| e.name == "Late").unwrap();
        assert_eq!(early.multiplier, 2.0);
        assert_eq!(late.multiplier, 1.5);
    }
}
