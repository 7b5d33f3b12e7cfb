//! Connection registry for all consoles attached to a game
//!
//! This module tracks every live transport connection and its role: phone
//! players, the host control console, leaderboard displays, and connections
//! that have not joined yet. It provides the fan-out primitives used by the
//! broadcast gateway to push identical state to every console.

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    str::FromStr,
};

use enum_map::{Enum, EnumMap};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;
use uuid::Uuid;

use super::{SyncMessage, UpdateMessage, session::Tunnel};

/// A unique identifier for a transport connection
///
/// Every console gets a fresh id when its connection is accepted. A player
/// who disconnects and reconnects gets a *new* id; continuity of identity
/// across reconnects is the session store's job, not the registry's.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, DeserializeFromStr, SerializeDisplay,
)]
pub struct Id(Uuid);

impl Id {
    /// Creates a new random connection id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Id {
    type Err = uuid::Error;

    /// Parses an id from a UUID string
    ///
    /// # Errors
    ///
    /// Returns a `uuid::Error` if the string is not a valid UUID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

/// The role and state of a connection in the game
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    /// A connection that has not joined as a player yet
    Unassigned,
    /// The host console driving the round
    Host,
    /// A read-only leaderboard display console
    Display,
    /// A phone player competing in the round
    Player(PlayerValue),
}

/// The kind of connection without associated data
///
/// This is the discriminant of [`Value`], used for filtering connections by
/// role without needing the associated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum, Serialize, Deserialize)]
pub enum ValueKind {
    /// An unassigned connection
    Unassigned,
    /// The host console
    Host,
    /// A display console
    Display,
    /// A player
    Player,
}

impl Value {
    /// Returns the kind of this value without the associated data
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Unassigned => ValueKind::Unassigned,
            Value::Host => ValueKind::Host,
            Value::Display => ValueKind::Display,
            Value::Player(_) => ValueKind::Player,
        }
    }
}

/// Identity data kept in the registry for a player connection
///
/// The live gameplay counters (taps, reaction time) live in the round's
/// player table; the registry only holds what is needed to address and
/// label the connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerValue {
    /// The player's sanitized display name
    pub name: String,
}

/// Serialization helper for the registry
#[derive(Deserialize)]
struct WatchersSerde {
    mapping: HashMap<Id, Value>,
}

/// Registry of all consoles attached to a game session
///
/// Tracks every connection and its role, and provides message fan-out used
/// by the broadcast gateway. The reverse index by role is rebuilt on
/// deserialization rather than stored.
#[derive(Default, Serialize, Deserialize)]
#[serde(from = "WatchersSerde")]
pub struct Watchers {
    /// Primary mapping from connection id to role
    mapping: HashMap<Id, Value>,

    /// Reverse mapping organized by role for efficient filtering
    #[serde(skip_serializing)]
    reverse_mapping: EnumMap<ValueKind, HashSet<Id>>,
}

impl From<WatchersSerde> for Watchers {
    fn from(serde: WatchersSerde) -> Self {
        let WatchersSerde { mapping } = serde;
        let mut reverse_mapping: EnumMap<ValueKind, HashSet<Id>> = EnumMap::default();
        for (id, value) in &mapping {
            reverse_mapping[value.kind()].insert(*id);
        }
        Self {
            mapping,
            reverse_mapping,
        }
    }
}

/// Errors that can occur when registering connections
#[derive(Error, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The process-wide connection ceiling was reached
    #[error("maximum number of connections reached")]
    MaximumConnections,
}

impl Watchers {
    /// Creates a registry with the host console already attached
    ///
    /// # Arguments
    ///
    /// * `host_id` - The connection id of the host console
    pub fn with_host_id(host_id: Id) -> Self {
        Self {
            mapping: {
                let mut map = HashMap::default();
                map.insert(host_id, Value::Host);
                map
            },
            reverse_mapping: {
                let mut map: EnumMap<ValueKind, HashSet<Id>> = EnumMap::default();
                map[ValueKind::Host].insert(host_id);
                map
            },
        }
    }

    /// Gets all connections with their tunnels and roles
    ///
    /// Connections whose tunnel has gone away are skipped.
    ///
    /// # Arguments
    ///
    /// * `tunnel_finder` - Function to retrieve the tunnel for a given id
    pub fn vec<T: Tunnel, F: Fn(Id) -> Option<T>>(&self, tunnel_finder: F) -> Vec<(Id, T, Value)> {
        self.reverse_mapping
            .values()
            .flat_map(|v| v.iter())
            .filter_map(|x| match (tunnel_finder(*x), self.mapping.get(x)) {
                (Some(t), Some(v)) => Some((*x, t, v.to_owned())),
                _ => None,
            })
            .collect_vec()
    }

    /// Gets connections of a specific role with their tunnels and roles
    ///
    /// # Arguments
    ///
    /// * `filter` - The role to include
    /// * `tunnel_finder` - Function to retrieve the tunnel for a given id
    pub fn specific_vec<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        filter: ValueKind,
        tunnel_finder: F,
    ) -> Vec<(Id, T, Value)> {
        self.reverse_mapping[filter]
            .iter()
            .filter_map(|x| match (tunnel_finder(*x), self.mapping.get(x)) {
                (Some(t), Some(v)) => Some((*x, t, v.to_owned())),
                _ => None,
            })
            .collect_vec()
    }

    /// Gets the number of connections of a specific role
    pub fn specific_count(&self, filter: ValueKind) -> usize {
        self.reverse_mapping[filter].len()
    }

    /// Registers a new connection
    ///
    /// # Arguments
    ///
    /// * `watcher_id` - The unique id of the connection
    /// * `watcher_value` - The role of the connection
    ///
    /// # Errors
    ///
    /// Returns [`Error::MaximumConnections`] if the process-wide ceiling on
    /// simultaneous connections was reached.
    pub fn add_watcher(&mut self, watcher_id: Id, watcher_value: Value) -> Result<(), Error> {
        let kind = watcher_value.kind();

        if self.mapping.len() >= crate::constants::game::MAX_WATCHER_COUNT {
            return Err(Error::MaximumConnections);
        }

        self.mapping.insert(watcher_id, watcher_value);
        self.reverse_mapping[kind].insert(watcher_id);

        Ok(())
    }

    /// Updates the role of an existing connection
    ///
    /// Handles moving the connection between role categories if the role
    /// kind changes (e.g. unassigned becoming a player on join).
    pub fn update_watcher_value(&mut self, watcher_id: Id, watcher_value: Value) {
        let old_kind = match self.mapping.get(&watcher_id) {
            Some(v) => v.kind(),
            _ => return,
        };
        let new_kind = watcher_value.kind();
        if old_kind != new_kind {
            self.reverse_mapping[old_kind].remove(&watcher_id);
            self.reverse_mapping[new_kind].insert(watcher_id);
        }
        self.mapping.insert(watcher_id, watcher_value);
    }

    /// Removes a connection from the registry
    ///
    /// Called when the transport reports a disconnect. Any session-store
    /// bookkeeping for the player happens in the game, not here.
    pub fn remove_watcher(&mut self, watcher_id: Id) {
        if let Some(value) = self.mapping.remove(&watcher_id) {
            self.reverse_mapping[value.kind()].remove(&watcher_id);
        }
    }

    /// Gets the role of a specific connection
    pub fn get_watcher_value(&self, watcher_id: Id) -> Option<Value> {
        self.mapping.get(&watcher_id).map(|v| v.to_owned())
    }

    /// Checks if a connection is known to the registry
    pub fn has_watcher(&self, watcher_id: Id) -> bool {
        self.mapping.contains_key(&watcher_id)
    }

    /// Gets the display name of a player connection
    ///
    /// Only player connections have names; hosts and displays yield `None`.
    pub fn get_name(&self, watcher_id: Id) -> Option<String> {
        self.get_watcher_value(watcher_id).and_then(|v| match v {
            Value::Player(player_value) => Some(player_value.name),
            _ => None,
        })
    }

    /// Sends an update message to a specific connection
    ///
    /// # Arguments
    ///
    /// * `message` - The update message to send
    /// * `watcher_id` - The connection to send to
    /// * `tunnel_finder` - Function to retrieve the tunnel for the connection
    pub fn send_message<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        message: &UpdateMessage,
        watcher_id: Id,
        tunnel_finder: F,
    ) {
        let Some(session) = tunnel_finder(watcher_id) else {
            return;
        };

        session.send_message(message);
    }

    /// Sends a state synchronization message to a specific connection
    pub fn send_state<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        message: &SyncMessage,
        watcher_id: Id,
        tunnel_finder: F,
    ) {
        let Some(session) = tunnel_finder(watcher_id) else {
            return;
        };

        session.send_state(message);
    }

    /// Sends personalized messages to all connections using a sender function
    ///
    /// The sender function is called for each connection and can return
    /// different messages based on the connection's id and role, or `None`
    /// to skip sending.
    pub fn announce_with<S, T: Tunnel, F: Fn(Id) -> Option<T>>(&self, sender: S, tunnel_finder: F)
    where
        S: Fn(Id, ValueKind) -> Option<super::UpdateMessage>,
    {
        for (watcher, session, v) in self.vec(tunnel_finder) {
            let Some(message) = sender(watcher, v.kind()) else {
                continue;
            };

            session.send_message(&message);
        }
    }

    /// Broadcasts an update message to every connection, all roles included
    ///
    /// The broadcast gateway pushes one identical payload to players, hosts,
    /// displays, and not-yet-joined connections alike; personalization is
    /// derived client-side.
    pub fn announce<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        message: &super::UpdateMessage,
        tunnel_finder: F,
    ) {
        self.announce_with(|_, _| Some(message.to_owned()), tunnel_finder);
    }

    /// Sends an update message to all connections of a specific role
    pub fn announce_specific<T: Tunnel, F: Fn(Id) -> Option<T>>(
        &self,
        filter: ValueKind,
        message: &super::UpdateMessage,
        tunnel_finder: F,
    ) {
        for (_, session, _) in self.specific_vec(filter, tunnel_finder) {
            session.send_message(message);
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct NullTunnel;

    impl Tunnel for NullTunnel {
        fn send_message(&self, _: &UpdateMessage) {}
        fn send_state(&self, _: &SyncMessage) {}
        fn close(self) {}
    }

    #[test]
    fn test_with_host_id_registers_host() {
        let host = Id::new();
        let watchers = Watchers::with_host_id(host);

        assert_eq!(watchers.specific_count(ValueKind::Host), 1);
        assert_eq!(watchers.get_watcher_value(host), Some(Value::Host));
    }

    #[test]
    fn test_add_and_promote_watcher() {
        let mut watchers = Watchers::default();
        let id = Id::new();

        watchers.add_watcher(id, Value::Unassigned).unwrap();
        assert_eq!(watchers.specific_count(ValueKind::Unassigned), 1);

        watchers.update_watcher_value(
            id,
            Value::Player(PlayerValue {
                name: "Swift Otter".to_owned(),
            }),
        );
        assert_eq!(watchers.specific_count(ValueKind::Unassigned), 0);
        assert_eq!(watchers.specific_count(ValueKind::Player), 1);
        assert_eq!(watchers.get_name(id), Some("Swift Otter".to_owned()));
    }

    #[test]
    fn test_remove_watcher_clears_reverse_mapping() {
        let mut watchers = Watchers::default();
        let id = Id::new();

        watchers.add_watcher(id, Value::Display).unwrap();
        watchers.remove_watcher(id);

        assert!(!watchers.has_watcher(id));
        assert_eq!(watchers.specific_count(ValueKind::Display), 0);
    }

    #[test]
    fn test_get_name_for_non_player() {
        let host = Id::new();
        let watchers = Watchers::with_host_id(host);

        assert_eq!(watchers.get_name(host), None);
    }

    #[test]
    fn test_vec_skips_dead_tunnels() {
        let mut watchers = Watchers::default();
        let alive = Id::new();
        let dead = Id::new();

        watchers.add_watcher(alive, Value::Unassigned).unwrap();
        watchers.add_watcher(dead, Value::Unassigned).unwrap();

        let found = watchers.vec(|id| if id == alive { Some(NullTunnel) } else { None });
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, alive);
    }
}
