//! Authoritative player-state store
//!
//! Holds one record per session slot, the record it replaced, and freshness metadata.
//! Conflicting updates are settled by sender timestamp, not by arrival order: an
//! update never replaces a record carrying a newer timestamp, and within one tick a
//! duplicate timestamp does not replace the record either.

use log::debug;
use shared::{PlayerRecord, SessionId, MAX_PLAYERS};

/// Result of offering an update to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// Normal policy outcome, not an error: the stored record is at least as fresh
    RejectedStale,
}

#[derive(Debug, Clone)]
pub struct PlayerStateStore {
    records: [PlayerRecord; MAX_PLAYERS],
    /// Value each record had before its latest update
    previous: [PlayerRecord; MAX_PLAYERS],
    updated_this_tick: [bool; MAX_PLAYERS],
    last_timestamp: [u64; MAX_PLAYERS],
}

impl PlayerStateStore {
    pub fn new() -> Self {
        Self {
            records: [PlayerRecord::FILLER; MAX_PLAYERS],
            previous: [PlayerRecord::FILLER; MAX_PLAYERS],
            updated_this_tick: [false; MAX_PLAYERS],
            last_timestamp: [0; MAX_PLAYERS],
        }
    }

    /// Clears every updated-this-tick flag; called at the start of each dispatch cycle
    pub fn begin_tick(&mut self) {
        self.updated_this_tick = [false; MAX_PLAYERS];
    }

    /// Resets a slot to the spawn record for a newly onboarded session
    pub fn occupy(&mut self, id: SessionId) {
        self.reset(id, PlayerRecord::spawn(id));
    }

    /// Returns a slot to the filler record once its session is gone
    pub fn vacate(&mut self, id: SessionId) {
        self.reset(id, PlayerRecord::FILLER);
    }

    fn reset(&mut self, id: SessionId, record: PlayerRecord) {
        let index = id as usize;
        if index >= MAX_PLAYERS {
            return;
        }
        self.records[index] = record;
        self.previous[index] = record;
        self.updated_this_tick[index] = false;
        self.last_timestamp[index] = 0;
    }

    /// Offers `record` with sender timestamp `timestamp` for slot `id`
    pub fn apply_update(
        &mut self,
        id: SessionId,
        record: PlayerRecord,
        timestamp: u64,
    ) -> UpdateOutcome {
        let index = id as usize;
        if index >= MAX_PLAYERS {
            return UpdateOutcome::RejectedStale;
        }

        let stored = self.last_timestamp[index];
        let stale = timestamp < stored || (self.updated_this_tick[index] && timestamp == stored);
        if stale {
            debug!(
                "Rejected update for {} at {} (stored {})",
                id, timestamp, stored
            );
            return UpdateOutcome::RejectedStale;
        }

        self.previous[index] = self.records[index];
        self.records[index] = PlayerRecord::new(id, record.transform);
        self.last_timestamp[index] = timestamp;
        self.updated_this_tick[index] = true;
        UpdateOutcome::Applied
    }

    /// Copy of all records, filler included, in slot order
    pub fn snapshot(&self) -> [PlayerRecord; MAX_PLAYERS] {
        self.records
    }

    pub fn record(&self, id: SessionId) -> PlayerRecord {
        self.records
            .get(id as usize)
            .copied()
            .unwrap_or(PlayerRecord::FILLER)
    }

    pub fn previous(&self, id: SessionId) -> PlayerRecord {
        self.previous
            .get(id as usize)
            .copied()
            .unwrap_or(PlayerRecord::FILLER)
    }

    pub fn last_timestamp(&self, id: SessionId) -> u64 {
        self.last_timestamp.get(id as usize).copied().unwrap_or(0)
    }

    pub fn updated_this_tick(&self, id: SessionId) -> bool {
        self.updated_this_tick
            .get(id as usize)
            .copied()
            .unwrap_or(false)
    }
}

impl Default for PlayerStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::seq::SliceRandom;
    use shared::Transform;

    fn at(id: SessionId, x: f32) -> PlayerRecord {
        PlayerRecord::new(id, Transform::at(x, 0.0, 0.0))
    }

    #[test]
    fn test_new_store_is_all_filler() {
        let store = PlayerStateStore::new();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), MAX_PLAYERS);
        assert!(snapshot.iter().all(PlayerRecord::is_filler));
    }

    #[test]
    fn test_occupy_and_vacate() {
        let mut store = PlayerStateStore::new();
        store.occupy(4);
        assert_eq!(store.record(4), PlayerRecord::spawn(4));

        store.apply_update(4, at(4, 9.0), 100);
        store.vacate(4);
        assert!(store.record(4).is_filler());
        assert_eq!(store.last_timestamp(4), 0);
    }

    #[test]
    fn test_newer_update_applies_and_keeps_previous() {
        let mut store = PlayerStateStore::new();
        store.occupy(1);

        assert_eq!(store.apply_update(1, at(1, 1.0), 10), UpdateOutcome::Applied);
        assert_eq!(store.apply_update(1, at(1, 2.0), 20), UpdateOutcome::Applied);

        assert_approx_eq!(store.record(1).transform.position[0], 2.0);
        assert_approx_eq!(store.previous(1).transform.position[0], 1.0);
        assert_eq!(store.last_timestamp(1), 20);
        assert!(store.updated_this_tick(1));
    }

    #[test]
    fn test_older_update_rejected_within_tick() {
        let mut store = PlayerStateStore::new();
        store.occupy(0);

        store.apply_update(0, at(0, 2.0), 20);
        assert_eq!(
            store.apply_update(0, at(0, 1.0), 10),
            UpdateOutcome::RejectedStale
        );
        assert_approx_eq!(store.record(0).transform.position[0], 2.0);
    }

    #[test]
    fn test_older_update_rejected_across_ticks() {
        let mut store = PlayerStateStore::new();
        store.occupy(0);
        store.apply_update(0, at(0, 2.0), 20);

        store.begin_tick();
        assert!(!store.updated_this_tick(0));
        assert_eq!(
            store.apply_update(0, at(0, 1.0), 10),
            UpdateOutcome::RejectedStale
        );
    }

    #[test]
    fn test_equal_timestamp_only_rejected_within_same_tick() {
        let mut store = PlayerStateStore::new();
        store.occupy(2);
        store.apply_update(2, at(2, 1.0), 50);

        assert_eq!(
            store.apply_update(2, at(2, 3.0), 50),
            UpdateOutcome::RejectedStale
        );

        store.begin_tick();
        assert_eq!(store.apply_update(2, at(2, 3.0), 50), UpdateOutcome::Applied);
        assert_approx_eq!(store.record(2).transform.position[0], 3.0);
    }

    #[test]
    fn test_record_id_follows_slot() {
        let mut store = PlayerStateStore::new();
        store.occupy(3);
        // A record claiming another id is stored under the slot it was applied to.
        store.apply_update(3, at(7, 1.0), 1);
        assert_eq!(store.record(3).session_id(), Some(3));
    }

    #[test]
    fn test_out_of_range_id_rejected() {
        let mut store = PlayerStateStore::new();
        assert_eq!(
            store.apply_update(MAX_PLAYERS as SessionId, at(0, 1.0), 1),
            UpdateOutcome::RejectedStale
        );
        assert!(store.record(200).is_filler());
    }

    #[test]
    fn test_final_state_independent_of_order() {
        let mut rng = rand::thread_rng();
        let mut updates: Vec<(u64, f32)> = (1..=20).map(|t| (t * 10, t as f32)).collect();

        for _ in 0..50 {
            updates.shuffle(&mut rng);
            let mut store = PlayerStateStore::new();
            store.occupy(5);
            store.begin_tick();

            for (timestamp, x) in &updates {
                store.apply_update(5, at(5, *x), *timestamp);
            }

            assert_eq!(store.last_timestamp(5), 200);
            assert_approx_eq!(store.record(5).transform.position[0], 20.0);
        }
    }
}
