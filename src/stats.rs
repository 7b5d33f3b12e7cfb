//! All-time historical standings and their persistence contract
//!
//! Records are keyed by display name, created on first appearance, updated
//! once per round per participant at round finish, and reset only by an
//! explicit administrative action. The engine does not care whether the
//! backing store is a local file or a remote key-value service; it only
//! talks to the injected [`RecordStore`], and store failures are logged and
//! non-fatal — in-memory state stays authoritative.

use std::collections::HashMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use thiserror::Error;
use web_time::SystemTime;

use crate::{TruncatedVec, constants, leaderboard::FrozenLeaderboard};

/// Lifetime statistics for one display name
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllTimeRecord {
    /// Rounds won
    pub wins: u64,
    /// Stage-1 taps across all rounds
    pub total_taps: u64,
    /// Rounds participated in
    pub rounds_played: u64,
    /// Best single-round stage-1 tap count
    pub best_round_taps: u32,
    /// When the name last finished a round
    pub last_played_at: Option<SystemTime>,
}

/// One row of the all-time standings broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Standing {
    /// Display name the record is keyed by
    pub name: String,
    /// Rounds won
    pub wins: u64,
    /// Stage-1 taps across all rounds
    pub total_taps: u64,
    /// Rounds participated in
    pub rounds_played: u64,
    /// Best single-round stage-1 tap count
    pub best_round_taps: u32,
}

/// Errors surfaced by a [`RecordStore`]
#[derive(Error, Debug)]
pub enum Error {
    /// Loading the record map failed
    #[error("failed to load all-time records: {0}")]
    Load(String),
    /// Saving the record map failed
    #[error("failed to save all-time records: {0}")]
    Save(String),
}

/// Contract with the durable storage collaborator
///
/// Exactly two operations: `load` is called once at startup, `save` once
/// per round finish and on administrative reset. A corrupt stored record
/// should be treated by implementations as empty rather than fatal.
pub trait RecordStore {
    /// Loads the full record map
    ///
    /// # Errors
    ///
    /// Returns [`Error::Load`] when the backing store cannot be read.
    fn load(&self) -> Result<HashMap<String, AllTimeRecord>, Error>;

    /// Persists the full record map
    ///
    /// # Errors
    ///
    /// Returns [`Error::Save`] when the backing store cannot be written.
    fn save(&self, records: &HashMap<String, AllTimeRecord>) -> Result<(), Error>;
}

/// Loads records from a store, falling back to empty on failure
///
/// The failure is logged; a missing or corrupt store never prevents a game
/// from starting.
pub fn load_or_empty<P: RecordStore>(store: &P) -> HashMap<String, AllTimeRecord> {
    match store.load() {
        Ok(records) => records,
        Err(e) => {
            log::warn!("{e}; starting with empty all-time records");
            HashMap::new()
        }
    }
}

/// In-memory all-time record table
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AllTimeRecords {
    /// Records keyed by display name
    records: HashMap<String, AllTimeRecord>,
}

impl AllTimeRecords {
    /// Wraps a record map loaded from the store
    pub fn new(records: HashMap<String, AllTimeRecord>) -> Self {
        Self { records }
    }

    /// Applies one finished round to the records
    ///
    /// Every participant in the frozen leaderboard gets their round
    /// counted; the winner (if any) additionally gets a win.
    pub fn apply_round(&mut self, frozen: &FrozenLeaderboard, now: SystemTime) {
        for entry in &frozen.entries {
            let record = self.records.entry(entry.name.clone()).or_default();
            record.rounds_played += 1;
            record.total_taps += u64::from(entry.taps);
            record.best_round_taps = record.best_round_taps.max(entry.taps);
            record.last_played_at = Some(now);
        }

        if let Some(winner) = &frozen.winner
            && let Some(record) = self.records.get_mut(&winner.name)
        {
            record.wins += 1;
        }
    }

    /// Clears all records (administrative reset)
    pub fn reset(&mut self) {
        self.records.clear();
    }

    /// The capped standings view included in every broadcast
    ///
    /// Ordered by wins, then total taps, then name for determinism.
    pub fn top(&self) -> TruncatedVec<Standing> {
        let standings = self
            .records
            .iter()
            .sorted_by(|(name_a, a), (name_b, b)| {
                (b.wins, b.total_taps)
                    .cmp(&(a.wins, a.total_taps))
                    .then_with(|| name_a.cmp(name_b))
            })
            .map(|(name, record)| Standing {
                name: name.clone(),
                wins: record.wins,
                total_taps: record.total_taps,
                rounds_played: record.rounds_played,
                best_round_taps: record.best_round_taps,
            });

        TruncatedVec::new(
            standings,
            constants::records::TOP_LIMIT,
            self.records.len(),
        )
    }

    /// Saves the records through the injected store, logging on failure
    ///
    /// Fire-and-forget relative to round progression: a slow or failed
    /// write never stalls the game.
    pub fn persist<P: RecordStore>(&self, store: &P) {
        if let Err(e) = store.save(&self.records) {
            log::warn!("{e}; keeping in-memory records authoritative");
        }
    }
}
