//! Display-name sanitization and uniqueness
//!
//! This module resolves the raw name string from a join request into a
//! bounded, censored, unique display name. Unlike a registration flow there
//! is no rejection path: empty or inappropriate names fall back to a
//! generated pet-style name, and collisions are resolved with a numeric
//! suffix. The resolved name is what all-time records are keyed by.
//!
//! A name reservation outlives its connection: on disconnect the id mapping
//! is detached but the reservation is held until the owning session expires,
//! so a reconnecting player cannot lose their name to a newcomer during the
//! grace period.

use std::collections::{HashMap, HashSet};

use heck::ToTitleCase;
use rustrict::CensorStr;
use serde::{Deserialize, Serialize};

use crate::constants;

use super::watcher::Id;

/// Serialization helper for the name registry
#[derive(Deserialize)]
struct NamesSerde {
    mapping: HashMap<Id, String>,
    reserved: HashSet<String>,
}

/// Registry of display names in use within one game
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(from = "NamesSerde")]
pub struct Names {
    /// Mapping from live connection id to resolved name
    mapping: HashMap<Id, String>,
    /// Names currently reserved, including those held by disconnected
    /// sessions in their grace period
    reserved: HashSet<String>,
}

impl From<NamesSerde> for Names {
    fn from(serde: NamesSerde) -> Self {
        let NamesSerde { mapping, reserved } = serde;
        let mut reserved = reserved;
        reserved.extend(mapping.values().cloned());
        Self { mapping, reserved }
    }
}

/// Generates a fallback pet-style display name
fn generated_name() -> String {
    petname::petname(2, " ").unwrap_or_default().to_title_case()
}

impl Names {
    /// Retrieves the resolved name for a connection
    pub fn get_name(&self, id: &Id) -> Option<String> {
        self.mapping.get(id).cloned()
    }

    /// Resolves a requested name into a unique, sanitized display name
    ///
    /// The request is trimmed and truncated to the maximum length. An empty
    /// or inappropriate request falls back to a generated name. If the
    /// sanitized name is already reserved, a numeric suffix is appended
    /// (`"Ada 2"`, `"Ada 3"`, ...) until a free name is found.
    ///
    /// # Arguments
    ///
    /// * `id` - The connection claiming the name
    /// * `requested` - The raw name string from the join request
    ///
    /// # Returns
    ///
    /// The resolved name, now reserved for `id`
    pub fn resolve(&mut self, id: Id, requested: &str) -> String {
        let trimmed = rustrict::trim_whitespace(requested);
        let bounded: String = trimmed
            .chars()
            .take(constants::player::MAX_NAME_LENGTH)
            .collect();

        let base = if bounded.is_empty() || bounded.as_str().is_inappropriate() {
            generated_name()
        } else {
            bounded
        };

        let mut candidate = base.clone();
        let mut suffix = 2usize;
        while self.reserved.contains(&candidate) {
            candidate = format!("{base} {suffix}");
            suffix += 1;
        }

        self.reserved.insert(candidate.clone());
        self.mapping.insert(id, candidate.clone());
        candidate
    }

    /// Detaches a connection from its name, keeping the reservation
    ///
    /// Called on disconnect; the reservation is held for the session's
    /// grace period.
    pub fn detach(&mut self, id: Id) {
        self.mapping.remove(&id);
    }

    /// Attaches an already-reserved name to a new connection id
    ///
    /// Called when a session is reclaimed under a fresh connection.
    pub fn adopt(&mut self, id: Id, name: &str) {
        self.reserved.insert(name.to_owned());
        self.mapping.insert(id, name.to_owned());
    }

    /// Releases a name reservation for good
    ///
    /// Called when the owning session expires.
    pub fn release_name(&mut self, name: &str) {
        self.reserved.remove(name);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_plain_name() {
        let mut names = Names::default();
        let id = Id::new();

        assert_eq!(names.resolve(id, "Ada"), "Ada");
        assert_eq!(names.get_name(&id), Some("Ada".to_owned()));
    }

    #[test]
    fn test_resolve_trims_whitespace() {
        let mut names = Names::default();

        assert_eq!(names.resolve(Id::new(), "  Ada  "), "Ada");
    }

    #[test]
    fn test_resolve_truncates_long_names() {
        let mut names = Names::default();
        let long = "Turbo".repeat(constants::player::MAX_NAME_LENGTH);

        let resolved = names.resolve(Id::new(), &long);
        assert_eq!(resolved.chars().count(), constants::player::MAX_NAME_LENGTH);
        assert!(
            long.starts_with(resolved.as_str()),
            "truncation must keep the prefix"
        );
    }

    #[test]
    fn test_empty_name_is_defaulted() {
        let mut names = Names::default();

        let resolved = names.resolve(Id::new(), "   ");
        assert!(!resolved.is_empty());
    }

    #[test]
    fn test_collision_gets_numeric_suffix() {
        let mut names = Names::default();

        assert_eq!(names.resolve(Id::new(), "Ada"), "Ada");
        assert_eq!(names.resolve(Id::new(), "Ada"), "Ada 2");
        assert_eq!(names.resolve(Id::new(), "Ada"), "Ada 3");
    }

    #[test]
    fn test_detach_keeps_reservation() {
        let mut names = Names::default();
        let id = Id::new();

        names.resolve(id, "Ada");
        names.detach(id);

        assert_eq!(names.get_name(&id), None);
        // Still reserved for the disconnected session
        assert_eq!(names.resolve(Id::new(), "Ada"), "Ada 2");
    }

    #[test]
    fn test_adopt_attaches_reserved_name() {
        let mut names = Names::default();
        let old = Id::new();
        let new = Id::new();

        names.resolve(old, "Ada");
        names.detach(old);
        names.adopt(new, "Ada");

        assert_eq!(names.get_name(&new), Some("Ada".to_owned()));
        assert_eq!(names.resolve(Id::new(), "Ada"), "Ada 2");
    }

    #[test]
    fn test_release_name_frees_the_reservation() {
        let mut names = Names::default();
        let id = Id::new();

        names.resolve(id, "Ada");
        names.detach(id);
        names.release_name("Ada");

        assert_eq!(names.resolve(Id::new(), "Ada"), "Ada");
    }
}
