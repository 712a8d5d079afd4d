//! Progress of the initial node-list download

use std::collections::{HashMap, HashSet};

use super::PeerId;
use crate::crypto::Hash;

/// Quiet period after the last new entry before the list counts as synced
pub const LIST_SYNC_TIMEOUT: i64 = 10;
/// Peers asked before the list may count as synced
pub const LIST_SYNC_THRESHOLD: usize = 2;

#[derive(Debug, Default)]
pub struct ListSync {
    seen_entries: HashSet<Hash>,
    last_entry_time: i64,
    requested_from: HashSet<u64>,
    /// Entry counts announced by peers in their sync-status message
    reported: HashMap<u64, u32>,
}

impl ListSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// A list entry (announcement) arrived
    pub fn added_list_entry(&mut self, hash: Hash, now: i64) {
        if self.seen_entries.insert(hash) {
            self.last_entry_time = now;
        }
    }

    pub fn requested_list(&mut self, peer: &PeerId) {
        self.requested_from.insert(peer.id);
    }

    pub fn record_status(&mut self, peer: &PeerId, count: u32) {
        self.reported.insert(peer.id, count);
    }

    pub fn entries_received(&self) -> usize {
        self.seen_entries.len()
    }

    /// Largest entry count any peer reported
    pub fn best_reported(&self) -> Option<u32> {
        self.reported.values().copied().max()
    }

    pub fn is_synced(&self, now: i64) -> bool {
        self.requested_from.len() >= LIST_SYNC_THRESHOLD
            && self.last_entry_time > 0
            && now - self.last_entry_time > LIST_SYNC_TIMEOUT
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
