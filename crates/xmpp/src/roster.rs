use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::jid;

/// A room occupant currently present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// Full occupant address, `room@service/nick`.
    pub address: String,
    pub nick: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterChange {
    Joined,
    Left,
    /// Repeated presence for an occupant that is already tracked.
    Unchanged,
}

/// Occupants of the joined room, keyed by full address.
#[derive(Debug, Default)]
pub struct ParticipantRoster {
    present: HashMap<String, Participant>,
}

impl ParticipantRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a presence from `address`.
    ///
    /// Any available presence for an unknown address counts as a join,
    /// including status-only updates. Unavailable presence always reports a
    /// leave, even for an address that was never seen.
    pub fn apply(&mut self, address: &str, unavailable: bool) -> RosterChange {
        if unavailable {
            if self.present.remove(address).is_none() {
                debug!(address, "leave for an occupant that was not tracked");
            }
            return RosterChange::Left;
        }

        if self.present.contains_key(address) {
            return RosterChange::Unchanged;
        }

        let participant = Participant {
            address: address.to_string(),
            nick: jid::resource(address).unwrap_or_default().to_string(),
            joined_at: Utc::now(),
        };
        self.present.insert(address.to_string(), participant);
        RosterChange::Joined
    }

    pub fn contains(&self, address: &str) -> bool {
        self.present.contains_key(address)
    }

    pub fn get(&self, address: &str) -> Option<&Participant> {
        self.present.get(address)
    }

    /// Nicks of everyone present, sorted.
    pub fn nicks(&self) -> Vec<String> {
        let mut nicks: Vec<String> = self.present.values().map(|p| p.nick.clone()).collect();
        nicks.sort();
        nicks
    }

    pub fn len(&self) -> usize {
        self.present.len()
    }

    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }

    pub fn clear(&mut self) {
        self.present.clear();
    }
}
