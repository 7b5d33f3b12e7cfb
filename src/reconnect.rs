//! Session store and reconnection lifecycle
//!
//! A player who drops their connection keeps their identity and progress
//! for a bounded grace period. On join the player receives an opaque token
//! which their client persists locally; presenting the token on a new
//! connection within the grace period restores the preserved player record
//! under the new connection id.
//!
//! Expiry is belt-and-braces: each disconnect arms an expiry alarm for its
//! token, and a recurring sweep deletes any session whose grace period has
//! elapsed even if the individual alarm never fired.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use thiserror::Error;
use uuid::Uuid;
use web_time::{Duration, SystemTime};

use crate::{constants, player::Player, watcher::Id};

/// Opaque reconnection token handed to the client at join time
///
/// Built from a timestamp component plus two independent random sources so
/// tokens cannot be casually guessed or replayed across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
pub struct SessionToken(String);

impl SessionToken {
    /// Generates a fresh unguessable token
    pub fn generate(now: SystemTime) -> Self {
        let millis = now
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self(format!(
            "{millis:x}-{:08x}-{}",
            fastrand::u32(..),
            Uuid::new_v4().simple()
        ))
    }
}

impl From<&str> for SessionToken {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// A player identity surviving a bounded disconnect window
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Session {
    /// The connection currently allowed to claim this session, or `None`
    /// while disconnected
    owner: Option<Id>,
    /// Last-known player record, copied in on disconnect
    snapshot: Player,
    /// When the owner disconnected, or `None` while connected
    disconnected_at: Option<SystemTime>,
}

/// Why a reconnection attempt was refused
///
/// Each case is distinct so the client can decide whether to retry or fall
/// back to a fresh join.
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreError {
    /// The token does not match any live session
    #[error("unknown session token")]
    Unknown,
    /// The session's grace period has elapsed
    #[error("session expired")]
    Expired,
    /// Another connection currently owns this session
    #[error("session already claimed")]
    AlreadyClaimed,
}

/// Session-protocol messages sent to an individual client
///
/// These are the only personalized messages in the system; everything else
/// is the shared broadcast snapshot.
#[skip_serializing_none]
#[derive(Debug, Serialize, Clone)]
pub enum UpdateMessage {
    /// A session was created or reclaimed; the client must persist the
    /// token and replay it on reconnect
    Welcome {
        /// The reconnection token to persist
        token: SessionToken,
        /// The resolved display name
        name: String,
        /// The assigned palette color
        color: String,
    },
    /// A reconnection attempt was refused, with the reason
    Denied(RestoreError),
}

/// Alarm messages for session lifecycle timers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AlarmMessage {
    /// A disconnected session's grace period may have elapsed
    Expiry {
        /// The token armed at disconnect time
        token: SessionToken,
    },
    /// Recurring defensive sweep of expired sessions
    Sweep,
}

/// Token-keyed store of reclaimable player sessions
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionStore {
    /// Live sessions keyed by token
    sessions: HashMap<SessionToken, Session>,
    /// How long a disconnected session stays reclaimable
    grace_period: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(
            constants::session::GRACE_PERIOD_SECONDS,
        ))
    }
}

impl SessionStore {
    /// Creates a store with the given grace period
    pub fn new(grace_period: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            grace_period,
        }
    }

    /// Creates a session for a freshly joined player
    ///
    /// # Arguments
    ///
    /// * `connection` - The connection that owns the session
    /// * `snapshot` - The player record at join time
    /// * `now` - Current time, used for the token's timestamp component
    ///
    /// # Returns
    ///
    /// The token the client must persist and replay on reconnect
    pub fn create(&mut self, connection: Id, snapshot: Player, now: SystemTime) -> SessionToken {
        let token = SessionToken::generate(now);
        self.sessions.insert(
            token.clone(),
            Session {
                owner: Some(connection),
                snapshot,
                disconnected_at: None,
            },
        );
        token
    }

    /// Marks the session owned by a connection as disconnected
    ///
    /// The session's snapshot is replaced with the player's state at the
    /// moment of disconnect so counters survive into a reconnect.
    ///
    /// # Returns
    ///
    /// The session's token if the connection owned one, for arming the
    /// expiry alarm
    pub fn mark_disconnected(
        &mut self,
        connection: Id,
        snapshot: Player,
        now: SystemTime,
    ) -> Option<SessionToken> {
        let (token, session) = self
            .sessions
            .iter_mut()
            .find(|(_, s)| s.owner == Some(connection))?;

        session.owner = None;
        session.snapshot = snapshot;
        session.disconnected_at = Some(now);
        Some(token.clone())
    }

    /// Attempts to reclaim a session under a new connection id
    ///
    /// # Errors
    ///
    /// * [`RestoreError::Unknown`] - no session matches the token
    /// * [`RestoreError::Expired`] - the grace period has elapsed (the
    ///   session is deleted as a side effect)
    /// * [`RestoreError::AlreadyClaimed`] - a different connection owns the
    ///   session
    pub fn restore(
        &mut self,
        token: &SessionToken,
        new_connection: Id,
        now: SystemTime,
    ) -> Result<Player, RestoreError> {
        let session = self.sessions.get_mut(token).ok_or(RestoreError::Unknown)?;

        if let Some(owner) = session.owner
            && owner != new_connection
        {
            return Err(RestoreError::AlreadyClaimed);
        }

        if self.is_overdue(token, now) {
            self.sessions.remove(token);
            return Err(RestoreError::Expired);
        }

        let session = self
            .sessions
            .get_mut(token)
            .ok_or(RestoreError::Unknown)?;
        session.owner = Some(new_connection);
        session.disconnected_at = None;

        let mut snapshot = session.snapshot.clone();
        snapshot.connection = new_connection;
        session.snapshot = snapshot.clone();
        Ok(snapshot)
    }

    /// Zeroes the per-round counters in every preserved snapshot
    ///
    /// Called when a new round starts or the game returns to the lobby, so
    /// a player reclaiming a session across a round boundary starts the new
    /// round from zero like everyone else.
    pub fn reset_round_state(&mut self) {
        for session in self.sessions.values_mut() {
            session.snapshot.reset_round_state();
        }
    }

    /// Deletes a session if its grace period has elapsed
    ///
    /// Handler for the per-token expiry alarm. A session that was reclaimed
    /// in the meantime is left alone.
    ///
    /// # Returns
    ///
    /// The expired snapshot, so the caller can release derived state such
    /// as the name reservation
    pub fn expire_if_due(&mut self, token: &SessionToken, now: SystemTime) -> Option<Player> {
        if self.is_overdue(token, now) {
            return self.sessions.remove(token).map(|s| s.snapshot);
        }
        None
    }

    /// Deletes every session whose grace period has elapsed
    ///
    /// Defensive double-check against timer drift or process restart; runs
    /// on a fixed interval independent of the per-token alarms.
    pub fn sweep(&mut self, now: SystemTime) -> Vec<Player> {
        let overdue: Vec<SessionToken> = self
            .sessions
            .keys()
            .filter(|token| self.is_overdue(token, now))
            .cloned()
            .collect();

        overdue
            .into_iter()
            .filter_map(|token| self.sessions.remove(&token).map(|s| s.snapshot))
            .collect()
    }

    /// Deletes the session owned by a connection outright
    ///
    /// Used when identity must not survive, e.g. an administrative reset.
    pub fn drop_owned_by(&mut self, connection: Id) -> Option<Player> {
        let token = self
            .sessions
            .iter()
            .find(|(_, s)| s.owner == Some(connection))
            .map(|(token, _)| token.clone())?;
        self.sessions.remove(&token).map(|s| s.snapshot)
    }

    /// Whether a session exists and its grace period has elapsed
    fn is_overdue(&self, token: &SessionToken, now: SystemTime) -> bool {
        self.sessions.get(token).is_some_and(|session| {
            session.disconnected_at.is_some_and(|at| {
                now.duration_since(at)
                    .is_ok_and(|elapsed| elapsed >= self.grace_period)
            })
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::player::color_for_join;

    fn sample_player(connection: Id) -> Player {
        let mut player = Player::new(
            connection,
            "Ada".to_owned(),
            color_for_join(0),
            "buy rust".to_owned(),
            0,
        );
        player.tap_count_stage1 = 12;
        player.reaction_time_ms = Some(150);
        player
    }

    #[test]
    fn test_tokens_are_unique() {
        let now = SystemTime::now();
        assert_ne!(SessionToken::generate(now), SessionToken::generate(now));
    }

    #[test]
    fn test_restore_preserves_counters() {
        let mut store = SessionStore::default();
        let old = Id::new();
        let new = Id::new();
        let now = SystemTime::now();

        let token = store.create(old, sample_player(old), now);
        store.mark_disconnected(old, sample_player(old), now);

        let restored = store
            .restore(&token, new, now + Duration::from_secs(5))
            .unwrap();
        assert_eq!(restored.connection, new);
        assert_eq!(restored.tap_count_stage1, 12);
        assert_eq!(restored.reaction_time_ms, Some(150));
    }

    #[test]
    fn test_reset_round_state_zeroes_preserved_counters() {
        let mut store = SessionStore::default();
        let old = Id::new();
        let new = Id::new();
        let now = SystemTime::now();

        let token = store.create(old, sample_player(old), now);
        store.mark_disconnected(old, sample_player(old), now);

        store.reset_round_state();

        let restored = store
            .restore(&token, new, now + Duration::from_secs(5))
            .unwrap();
        assert_eq!(restored.tap_count_stage1, 0);
        assert_eq!(restored.reaction_time_ms, None);
        assert_eq!(restored.name, "Ada");
    }

    #[test]
    fn test_restore_unknown_token() {
        let mut store = SessionStore::default();

        assert_eq!(
            store.restore(&SessionToken::from("nope"), Id::new(), SystemTime::now()),
            Err(RestoreError::Unknown)
        );
    }

    #[test]
    fn test_restore_after_grace_period_fails() {
        let mut store = SessionStore::default();
        let old = Id::new();
        let now = SystemTime::now();

        let token = store.create(old, sample_player(old), now);
        store.mark_disconnected(old, sample_player(old), now);

        assert_eq!(
            store.restore(&token, Id::new(), now + Duration::from_secs(31)),
            Err(RestoreError::Expired)
        );
        // The expired session is gone for good
        assert_eq!(
            store.restore(&token, Id::new(), now + Duration::from_secs(32)),
            Err(RestoreError::Unknown)
        );
    }

    #[test]
    fn test_restore_while_claimed_fails() {
        let mut store = SessionStore::default();
        let owner = Id::new();
        let now = SystemTime::now();

        let token = store.create(owner, sample_player(owner), now);

        assert_eq!(
            store.restore(&token, Id::new(), now),
            Err(RestoreError::AlreadyClaimed)
        );
    }

    #[test]
    fn test_expiry_alarm_skips_reclaimed_session() {
        let mut store = SessionStore::default();
        let old = Id::new();
        let new = Id::new();
        let now = SystemTime::now();

        let token = store.create(old, sample_player(old), now);
        store.mark_disconnected(old, sample_player(old), now);
        store.restore(&token, new, now + Duration::from_secs(5)).unwrap();

        // The alarm armed at disconnect fires anyway; it must be a no-op
        assert!(store
            .expire_if_due(&token, now + Duration::from_secs(30))
            .is_none());
    }

    #[test]
    fn test_sweep_removes_only_overdue_sessions() {
        let mut store = SessionStore::default();
        let now = SystemTime::now();

        let gone = Id::new();
        store.create(gone, sample_player(gone), now);
        store.mark_disconnected(gone, sample_player(gone), now);

        let fresh = Id::new();
        store.create(fresh, sample_player(fresh), now);
        store.mark_disconnected(
            fresh,
            sample_player(fresh),
            now + Duration::from_secs(20),
        );

        let expired = store.sweep(now + Duration::from_secs(35));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].connection, gone);
    }

    #[test]
    fn test_disconnect_snapshot_wins_over_join_snapshot() {
        let mut store = SessionStore::default();
        let old = Id::new();
        let now = SystemTime::now();

        let joined = Player::new(old, "Ada".to_owned(), color_for_join(0), String::new(), 0);
        let token = store.create(old, joined, now);

        let mut at_disconnect = sample_player(old);
        at_disconnect.tap_count_stage1 = 99;
        store.mark_disconnected(old, at_disconnect, now);

        let restored = store.restore(&token, Id::new(), now).unwrap();
        assert_eq!(restored.tap_count_stage1, 99);
    }
}
