//! # Taprace Game Library
//!
//! This library provides the core engine for the Taprace tapping
//! competition. It handles timed multi-round sessions, player registration
//! and reconnection, click-rate limiting, timing anomaly detection, live
//! and frozen leaderboards, and identical-state broadcast to every
//! connected console.
//!
//! The engine owns no transport and no clock: the embedder delivers
//! inbound messages, disconnect notifications, and due alarms, and provides
//! a scheduler callback for arming future alarms.

#![cfg_attr(all(coverage_nightly, test), feature(coverage_attribute))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::ignored_unit_patterns)]
#![allow(clippy::struct_field_names)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::wildcard_imports)]
use derive_where::derive_where;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

pub mod constants;

pub mod anomaly;
pub mod game;
pub mod leaderboard;
mod names;
pub mod player;
pub mod rate_limit;
pub mod reconnect;
pub mod session;
pub mod stats;
pub mod watcher;

/// Messages sent to synchronize state between consoles
///
/// Sent once on (re)connect so a console can render the full current state
/// before incremental updates resume.
#[derive(Debug, Serialize, Clone, derive_more::From)]
pub enum SyncMessage {
    /// Full game state synchronization
    Game(game::SyncMessage),
}

impl SyncMessage {
    /// Converts the sync message to a JSON string for transmission
    ///
    /// # Panics
    ///
    /// This method panics if serialization fails, which should never happen
    /// with the default JSON serializer for well-formed data.
    pub fn to_message(&self) -> String {
        serde_json::to_string(self).expect("default serializer cannot fail")
    }
}

/// Messages sent to update consoles about state changes
///
/// Most updates are the shared snapshot broadcast identically to every
/// console; session messages are the personalized exception.
#[derive(Debug, Serialize, Clone, derive_more::From)]
pub enum UpdateMessage {
    /// General game update messages
    Game(game::UpdateMessage),
    /// Session lifecycle messages (welcome tokens, reconnect denials)
    Session(reconnect::UpdateMessage),
}

/// Alarm messages for timed events
///
/// Armed through the embedder's scheduler and delivered back when due.
/// Handlers validate each alarm against current state, so a stale alarm is
/// harmless.
#[derive(Debug, Clone, derive_more::From, Serialize, Deserialize)]
pub enum AlarmMessage {
    /// Round countdown ticks
    Game(game::AlarmMessage),
    /// Session expiry and sweep alarms
    Session(reconnect::AlarmMessage),
}

impl UpdateMessage {
    /// Converts the update message to a JSON string for transmission
    ///
    /// # Panics
    ///
    /// This method panics if serialization fails, which should never happen
    /// with the default JSON serializer for well-formed data.
    pub fn to_message(&self) -> String {
        serde_json::to_string(self).expect("default serializer cannot fail")
    }
}

/// A truncated vector that maintains the exact count while limiting displayed items
///
/// Broadcast leaderboards are capped to keep payloads bounded on large
/// rounds, but the total count still reaches the display ("137 players",
/// first 50 names).
#[derive(Debug, Clone, Serialize)]
#[derive_where(Default)]
pub struct TruncatedVec<T> {
    /// The exact total count of items
    exact_count: usize,
    /// The truncated list of items (up to the limit)
    items: Vec<T>,
}

impl<T: Clone> TruncatedVec<T> {
    /// Creates a new truncated vector from an iterator
    ///
    /// # Arguments
    ///
    /// * `list` - An iterator over items to include
    /// * `limit` - Maximum number of items to include in the truncated vector
    /// * `exact_count` - The exact total count of items (may be larger than limit)
    pub fn new<I: Iterator<Item = T>>(list: I, limit: usize, exact_count: usize) -> Self {
        let items = list.take(limit).collect_vec();
        Self { exact_count, items }
    }

    /// Maps a function over the items in the truncated vector
    pub fn map<F, U>(self, f: F) -> TruncatedVec<U>
    where
        F: Fn(T) -> U,
    {
        TruncatedVec {
            exact_count: self.exact_count,
            items: self.items.into_iter().map(f).collect_vec(),
        }
    }

    /// Returns the exact count of items
    pub fn exact_count(&self) -> usize {
        self.exact_count
    }

    /// Returns the truncated items
    pub fn items(&self) -> &[T] {
        &self.items
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_vec_new() {
        let data = vec![1, 2, 3, 4, 5];
        let truncated = TruncatedVec::new(data.into_iter(), 3, 5);

        assert_eq!(truncated.exact_count(), 5);
        assert_eq!(truncated.items(), &[1, 2, 3]);
    }

    #[test]
    fn test_truncated_vec_new_limit_larger_than_items() {
        let data = vec![1, 2, 3];
        let truncated = TruncatedVec::new(data.into_iter(), 5, 3);

        assert_eq!(truncated.exact_count(), 3);
        assert_eq!(truncated.items(), &[1, 2, 3]);
    }

    #[test]
    fn test_truncated_vec_map() {
        let data = vec![1, 2, 3];
        let truncated = TruncatedVec::new(data.into_iter(), 3, 5);
        let mapped = truncated.map(|x| x * 2);

        assert_eq!(mapped.exact_count(), 5);
        assert_eq!(mapped.items(), &[2, 4, 6]);
    }

    #[test]
    fn test_update_message_to_message() {
        let update_msg = UpdateMessage::Game(crate::game::UpdateMessage::JoinRejected(
            crate::game::JoinError::Full,
        ));
        let json_str = update_msg.to_message();

        assert!(json_str.contains("Game"));
        assert!(json_str.contains("JoinRejected"));
        assert!(json_str.contains("Full"));
    }

    #[test]
    fn test_alarm_message_round_trip() {
        let alarm = AlarmMessage::Game(crate::game::AlarmMessage::Tick {
            round_number: 3,
            phase: crate::game::Phase::Stage1Active,
        });
        let json_str = serde_json::to_string(&alarm).expect("serialization works");
        let back: AlarmMessage = serde_json::from_str(&json_str).expect("deserialization works");

        assert!(matches!(
            back,
            AlarmMessage::Game(crate::game::AlarmMessage::Tick {
                round_number: 3,
                phase: crate::game::Phase::Stage1Active,
            })
        ));
    }
}
