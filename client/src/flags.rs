//! Client-side mirror of flag state with optimistic writes
//!
//! The store holds two kinds of records side by side: authoritative flags
//! exactly as the server last described them, and this player's provisional
//! placements that the server has not confirmed yet. A confirmation replaces
//! one provisional record, chosen by position (within the reconcile
//! tolerance) and recency; the server gives us no correlation id to match on.
//!
//! Nothing here talks to the network. Callers decide what to send based on
//! the values returned.

use crate::error::FlagError;
use log::debug;
use shared::geo::{self, distance};
use shared::{Flag, PlaceOptions, Position, PROVISIONAL_PREFIX};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Entry {
    flag: Flag,
    /// Local insertion counter; breaks recency ties and orders queries
    seq: u64,
}

/// Outcome of applying a placement confirmation
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// Provisional record that was replaced, if one matched
    pub replaced: Option<String>,
    pub flag: Flag,
}

pub struct FlagStore {
    flags: HashMap<String, Entry>,
    next_seq: u64,
    local_player: Option<String>,
    territory_radius_m: f64,
    reconcile_tolerance_m: f64,
}

impl FlagStore {
    pub fn new(territory_radius_m: f64, reconcile_tolerance_m: f64) -> Self {
        Self {
            flags: HashMap::new(),
            next_seq: 0,
            local_player: None,
            territory_radius_m,
            reconcile_tolerance_m,
        }
    }

    pub fn set_local_player(&mut self, player_id: Option<String>) {
        self.local_player = player_id;
    }

    pub fn local_player(&self) -> Option<&str> {
        self.local_player.as_deref()
    }

    pub fn territory_radius_m(&self) -> f64 {
        self.territory_radius_m
    }

    fn insert(&mut self, flag: Flag) {
        self.next_seq += 1;
        let entry = Entry {
            flag,
            seq: self.next_seq,
        };
        self.flags.insert(entry.flag.id.clone(), entry);
    }

    /// Replaces an existing record in place, keeping its position in query order
    fn upsert(&mut self, flag: Flag) {
        match self.flags.get_mut(&flag.id) {
            Some(entry) => entry.flag = flag,
            None => self.insert(flag),
        }
    }

    fn owned_local(&self, flag_id: &str) -> Result<&Flag, FlagError> {
        let player = self.local_player.as_deref().ok_or(FlagError::NoIdentity)?;
        let flag = self
            .get(flag_id)
            .ok_or_else(|| FlagError::NotFound(flag_id.to_string()))?;

        if flag.is_system() {
            return Err(FlagError::SystemOwned(flag_id.to_string()));
        }
        if !flag.is_owned_by(player) {
            return Err(FlagError::NotOwner(flag_id.to_string()));
        }
        Ok(flag)
    }

    /// Closest flag of another owner whose territory covers `candidate`
    pub fn territory_conflict(&self, candidate: &Position, owner_id: &str) -> Option<(&Flag, f64)> {
        geo::nearest_conflict(
            candidate,
            self.flags.values().map(|entry| &entry.flag),
            self.territory_radius_m,
            owner_id,
        )
    }

    /// Optimistically records a placement by the local player
    ///
    /// Fails without touching the store if the position lies inside another
    /// owner's territory.
    pub fn place_provisional(
        &mut self,
        position: Position,
        options: PlaceOptions,
        now: u64,
    ) -> Result<Flag, FlagError> {
        let owner = self
            .local_player
            .clone()
            .ok_or(FlagError::NoIdentity)?;

        if let Some((conflict, distance_m)) = self.territory_conflict(&position, &owner) {
            return Err(FlagError::TerritoryViolation {
                flag_id: conflict.id.clone(),
                distance_m,
            });
        }

        let options = options.normalized();
        let flag = Flag {
            id: format!(
                "{}{}-{:06x}",
                PROVISIONAL_PREFIX,
                self.next_seq + 1,
                rand::random::<u32>() & 0x00ff_ffff
            ),
            owner_id: owner,
            name: options.name,
            position,
            is_public: options.is_public,
            toll: options.toll,
            is_hardened: false,
            is_provisional: true,
            created_at: now,
        };

        debug!("Provisional flag {} at {:?}", flag.id, flag.position);
        self.insert(flag.clone());
        Ok(flag)
    }

    /// Applies the server's confirmation of one of our placements
    ///
    /// At most one provisional record is replaced: the most recent one of the
    /// same owner within the reconcile tolerance. With no match the
    /// authoritative flag is inserted anyway.
    pub fn confirm_placement(&mut self, mut flag: Flag) -> Reconciliation {
        flag.is_provisional = false;

        let tolerance = self.reconcile_tolerance_m;
        let replaced = self
            .flags
            .values()
            .filter(|entry| entry.flag.is_provisional && entry.flag.owner_id == flag.owner_id)
            .filter(|entry| geo::is_same_position(&entry.flag.position, &flag.position, tolerance))
            .max_by_key(|entry| (entry.flag.created_at, entry.seq))
            .map(|entry| entry.flag.id.clone());

        match &replaced {
            Some(provisional_id) => {
                debug!("Reconciled {} -> {}", provisional_id, flag.id);
                self.flags.remove(provisional_id);
            }
            None => debug!("No provisional match for {}; inserting", flag.id),
        }

        self.upsert(flag.clone());
        Reconciliation { replaced, flag }
    }

    /// Removes one of the local player's flags
    ///
    /// Returns the removed record. Provisional records have no server id, so
    /// the caller only needs to notify the server for authoritative ones.
    pub fn remove_local(&mut self, flag_id: &str) -> Result<Flag, FlagError> {
        self.owned_local(flag_id)?;
        let entry = self
            .flags
            .remove(flag_id)
            .ok_or_else(|| FlagError::NotFound(flag_id.to_string()))?;
        Ok(entry.flag)
    }

    /// Checks that the local player may ask the server to harden `flag_id`
    pub fn check_hardenable(&self, flag_id: &str) -> Result<&Flag, FlagError> {
        let flag = self.owned_local(flag_id)?;
        if flag.is_provisional {
            return Err(FlagError::Provisional(flag_id.to_string()));
        }
        if flag.is_hardened {
            return Err(FlagError::AlreadyHardened(flag_id.to_string()));
        }
        Ok(flag)
    }

    /// Checks that `flag_id` can be named in a teleport request
    ///
    /// Ownership is not required. Flags unknown locally are left for the
    /// server to judge.
    pub fn check_teleport_target(&self, flag_id: &str) -> Result<(), FlagError> {
        match self.get(flag_id) {
            Some(flag) if flag.is_provisional => Err(FlagError::Provisional(flag_id.to_string())),
            _ => Ok(()),
        }
    }

    /// Another player's placement; replace-or-insert
    pub fn apply_remote_flag(&mut self, mut flag: Flag) {
        flag.is_provisional = false;
        self.upsert(flag);
    }

    /// A removal broadcast by the server; a no-op when already gone
    pub fn apply_remote_removal(&mut self, flag_id: &str) -> Option<Flag> {
        self.flags.remove(flag_id).map(|entry| entry.flag)
    }

    /// An authoritative update; replace-or-insert, hardening never reverts
    pub fn apply_remote_update(&mut self, mut flag: Flag) -> Flag {
        flag.is_provisional = false;
        if let Some(existing) = self.flags.get(&flag.id) {
            if existing.flag.is_hardened && !flag.is_hardened {
                debug!("Ignoring un-hardening of {}", flag.id);
                flag.is_hardened = true;
            }
        }
        self.upsert(flag.clone());
        flag
    }

    /// Clears everything, provisional records included, and loads a snapshot
    ///
    /// Returns how many provisional records were discarded.
    pub fn bulk_replace(&mut self, flags: Vec<Flag>) -> usize {
        let discarded = self.provisional_count();
        self.flags.clear();
        for mut flag in flags {
            flag.is_provisional = false;
            self.insert(flag);
        }
        debug!(
            "Loaded {} flags, discarded {} provisional",
            self.flags.len(),
            discarded
        );
        discarded
    }

    /// Drops every unconfirmed placement, returning their ids
    pub fn discard_provisional(&mut self) -> Vec<String> {
        let ids: Vec<String> = self
            .flags
            .values()
            .filter(|entry| entry.flag.is_provisional)
            .map(|entry| entry.flag.id.clone())
            .collect();
        for id in &ids {
            self.flags.remove(id);
        }
        ids
    }

    pub fn get(&self, flag_id: &str) -> Option<&Flag> {
        self.flags.get(flag_id).map(|entry| &entry.flag)
    }

    /// Every known flag in insertion order
    pub fn all_flags(&self) -> Vec<&Flag> {
        let mut entries: Vec<&Entry> = self.flags.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| &entry.flag).collect()
    }

    /// The local player's flags, provisional ones included
    pub fn own_flags(&self) -> Vec<&Flag> {
        let Some(player) = self.local_player.as_deref() else {
            return Vec::new();
        };
        self.all_flags()
            .into_iter()
            .filter(|flag| flag.is_owned_by(player))
            .collect()
    }

    /// Flags within `radius_m` of `position`, nearest first
    pub fn flags_within_radius(&self, position: &Position, radius_m: f64) -> Vec<&Flag> {
        let mut hits: Vec<(&Flag, f64)> = self
            .flags
            .values()
            .map(|entry| (&entry.flag, distance(position, &entry.flag.position)))
            .filter(|(_, d)| *d <= radius_m)
            .collect();
        hits.sort_by(|(_, a), (_, b)| a.total_cmp(b));
        hits.into_iter().map(|(flag, _)| flag).collect()
    }

    pub fn provisional_count(&self) -> usize {
        self.flags
            .values()
            .filter(|entry| entry.flag.is_provisional)
            .count()
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{RECONCILE_TOLERANCE_M, SYSTEM_OWNER, TERRITORY_RADIUS_M};

    fn store_for(player: &str) -> FlagStore {
        let mut store = FlagStore::new(TERRITORY_RADIUS_M, RECONCILE_TOLERANCE_M);
        store.set_local_player(Some(player.to_string()));
        store
    }

    fn authoritative(id: &str, owner: &str, lat: f64, lng: f64) -> Flag {
        Flag {
            id: id.to_string(),
            owner_id: owner.to_string(),
            name: None,
            position: Position::new(lat, lng),
            is_public: false,
            toll: 0,
            is_hardened: false,
            is_provisional: false,
            created_at: 1_000,
        }
    }

    #[test]
    fn test_place_requires_identity() {
        let mut store = FlagStore::new(TERRITORY_RADIUS_M, RECONCILE_TOLERANCE_M);
        let result = store.place_provisional(Position::new(0.0, 0.0), PlaceOptions::default(), 1);
        assert_eq!(result, Err(FlagError::NoIdentity));
        assert!(store.is_empty());
    }

    #[test]
    fn test_place_creates_provisional_flag() {
        let mut store = store_for("alice");
        let flag = store
            .place_provisional(
                Position::new(1.0, 1.0),
                PlaceOptions::public(Some("Camp".to_string()), 15),
                42,
            )
            .unwrap();

        assert!(flag.id.starts_with(PROVISIONAL_PREFIX));
        assert!(flag.is_provisional);
        assert_eq!(flag.owner_id, "alice");
        assert_eq!(flag.toll, 15);
        assert_eq!(flag.created_at, 42);
        assert_eq!(store.provisional_count(), 1);
    }

    #[test]
    fn test_private_placement_has_no_toll() {
        let mut store = store_for("alice");
        let options = PlaceOptions {
            name: None,
            is_public: false,
            toll: 99,
        };
        let flag = store
            .place_provisional(Position::new(1.0, 1.0), options, 1)
            .unwrap();
        assert_eq!(flag.toll, 0);
    }

    #[test]
    fn test_place_inside_foreign_territory_is_rejected_locally() {
        let mut store = store_for("bob");
        store.apply_remote_flag(authoritative("flag-1", "alice", 0.0, 0.0));

        // ~100m north of alice's flag
        let result = store.place_provisional(Position::new(0.0009, 0.0), PlaceOptions::default(), 1);

        match result {
            Err(FlagError::TerritoryViolation { flag_id, distance_m }) => {
                assert_eq!(flag_id, "flag-1");
                assert!(distance_m < 101.0 && distance_m > 99.0);
            }
            other => panic!("Expected territory violation, got {:?}", other),
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_place_inside_own_territory_is_allowed() {
        let mut store = store_for("alice");
        store.apply_remote_flag(authoritative("flag-1", "alice", 0.0, 0.0));

        assert!(store
            .place_provisional(Position::new(0.0009, 0.0), PlaceOptions::default(), 1)
            .is_ok());
    }

    #[test]
    fn test_confirmation_replaces_matching_provisional() {
        let mut store = store_for("alice");
        let provisional = store
            .place_provisional(Position::new(0.0, 0.0), PlaceOptions::default(), 1)
            .unwrap();

        let outcome = store.confirm_placement(authoritative("flag-7", "alice", 0.00002, 0.0));

        assert_eq!(outcome.replaced, Some(provisional.id.clone()));
        assert_eq!(store.len(), 1);
        assert_eq!(store.provisional_count(), 0);
        assert!(store.get(&provisional.id).is_none());
        assert!(!store.get("flag-7").unwrap().is_provisional);
    }

    #[test]
    fn test_confirmations_in_reverse_order_match_their_own_flags() {
        let mut store = store_for("alice");
        let first = store
            .place_provisional(Position::new(0.0, 0.0), PlaceOptions::default(), 1)
            .unwrap();
        let second = store
            .place_provisional(Position::new(0.01, 0.01), PlaceOptions::default(), 2)
            .unwrap();

        let late = store.confirm_placement(authoritative("flag-2", "alice", 0.01, 0.01));
        let early = store.confirm_placement(authoritative("flag-1", "alice", 0.0, 0.0));

        assert_eq!(late.replaced, Some(second.id));
        assert_eq!(early.replaced, Some(first.id));
        assert_eq!(store.len(), 2);
        assert_eq!(store.provisional_count(), 0);
    }

    #[test]
    fn test_most_recent_provisional_wins_and_only_one_is_replaced() {
        let mut store = store_for("alice");
        let older = store
            .place_provisional(Position::new(5.0, 5.0), PlaceOptions::default(), 10)
            .unwrap();
        let newer = store
            .place_provisional(Position::new(5.00001, 5.0), PlaceOptions::default(), 20)
            .unwrap();

        let outcome = store.confirm_placement(authoritative("flag-1", "alice", 5.0, 5.0));

        assert_eq!(outcome.replaced, Some(newer.id));
        assert!(store.get(&older.id).is_some());
        assert_eq!(store.provisional_count(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_confirmation_without_match_still_inserts() {
        let mut store = store_for("alice");
        let provisional = store
            .place_provisional(Position::new(0.0, 0.0), PlaceOptions::default(), 1)
            .unwrap();
        store.remove_local(&provisional.id).unwrap();

        let outcome = store.confirm_placement(authoritative("flag-1", "alice", 0.0, 0.0));

        assert_eq!(outcome.replaced, None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_confirmation_outside_tolerance_does_not_reconcile() {
        let mut store = store_for("alice");
        store
            .place_provisional(Position::new(0.0, 0.0), PlaceOptions::default(), 1)
            .unwrap();

        // ~55m away, well past the tolerance
        let outcome = store.confirm_placement(authoritative("flag-1", "alice", 0.0005, 0.0));

        assert_eq!(outcome.replaced, None);
        assert_eq!(store.len(), 2);
        assert_eq!(store.provisional_count(), 1);
    }

    #[test]
    fn test_duplicate_confirmation_does_not_duplicate() {
        let mut store = store_for("alice");
        store
            .place_provisional(Position::new(0.0, 0.0), PlaceOptions::default(), 1)
            .unwrap();

        store.confirm_placement(authoritative("flag-1", "alice", 0.0, 0.0));
        store.confirm_placement(authoritative("flag-1", "alice", 0.0, 0.0));

        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_local_checks_ownership() {
        let mut store = store_for("bob");
        store.apply_remote_flag(authoritative("theirs", "alice", 0.0, 0.0));
        store.apply_remote_flag(authoritative("mine", "bob", 1.0, 1.0));
        store.apply_remote_flag(authoritative("fixed", SYSTEM_OWNER, 2.0, 2.0));

        assert_eq!(
            store.remove_local("theirs"),
            Err(FlagError::NotOwner("theirs".to_string()))
        );
        assert_eq!(
            store.remove_local("fixed"),
            Err(FlagError::SystemOwned("fixed".to_string()))
        );
        assert_eq!(
            store.remove_local("missing"),
            Err(FlagError::NotFound("missing".to_string()))
        );

        let removed = store.remove_local("mine").unwrap();
        assert_eq!(removed.id, "mine");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_harden_checks() {
        let mut store = store_for("bob");
        store.apply_remote_flag(authoritative("theirs", "alice", 0.0, 0.0));
        let mut hardened = authoritative("done", "bob", 1.0, 1.0);
        hardened.is_hardened = true;
        store.apply_remote_flag(hardened);
        store.apply_remote_flag(authoritative("mine", "bob", 2.0, 2.0));
        let provisional = store
            .place_provisional(Position::new(3.0, 3.0), PlaceOptions::default(), 1)
            .unwrap();

        assert_eq!(
            store.check_hardenable("theirs").unwrap_err(),
            FlagError::NotOwner("theirs".to_string())
        );
        assert_eq!(
            store.check_hardenable("done").unwrap_err(),
            FlagError::AlreadyHardened("done".to_string())
        );
        assert_eq!(
            store.check_hardenable(&provisional.id).unwrap_err(),
            FlagError::Provisional(provisional.id.clone())
        );
        assert!(store.check_hardenable("mine").is_ok());
        // No optimistic change
        assert!(!store.get("mine").unwrap().is_hardened);
    }

    #[test]
    fn test_teleport_target_needs_no_ownership() {
        let mut store = store_for("bob");
        store.apply_remote_flag(authoritative("theirs", "alice", 0.0, 0.0));
        let provisional = store
            .place_provisional(Position::new(3.0, 3.0), PlaceOptions::default(), 1)
            .unwrap();

        assert!(store.check_teleport_target("theirs").is_ok());
        assert!(store.check_teleport_target("unknown").is_ok());
        assert!(store.check_teleport_target(&provisional.id).is_err());
    }

    #[test]
    fn test_remote_operations_replace_or_insert() {
        let mut store = store_for("bob");
        store.apply_remote_flag(authoritative("flag-1", "alice", 0.0, 0.0));
        store.apply_remote_flag(authoritative("flag-1", "alice", 0.0, 0.0));
        assert_eq!(store.len(), 1);

        let mut renamed = authoritative("flag-1", "alice", 0.0, 0.0);
        renamed.name = Some("Renamed".to_string());
        store.apply_remote_update(renamed);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("flag-1").unwrap().name.as_deref(), Some("Renamed"));

        store.apply_remote_update(authoritative("flag-2", "carol", 5.0, 5.0));
        assert_eq!(store.len(), 2);

        assert!(store.apply_remote_removal("flag-1").is_some());
        assert!(store.apply_remote_removal("flag-1").is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_hardening_never_reverts() {
        let mut store = store_for("bob");
        let mut hardened = authoritative("flag-1", "alice", 0.0, 0.0);
        hardened.is_hardened = true;
        store.apply_remote_update(hardened);

        let stale = store.apply_remote_update(authoritative("flag-1", "alice", 0.0, 0.0));

        assert!(stale.is_hardened);
        assert!(store.get("flag-1").unwrap().is_hardened);
    }

    #[test]
    fn test_bulk_replace_discards_provisional() {
        let mut store = store_for("alice");
        store
            .place_provisional(Position::new(10.0, 10.0), PlaceOptions::default(), 1)
            .unwrap();
        store
            .place_provisional(Position::new(20.0, 20.0), PlaceOptions::default(), 2)
            .unwrap();

        let snapshot: Vec<Flag> = (0..10)
            .map(|i| authoritative(&format!("flag-{}", i), "carol", i as f64, 0.0))
            .collect();
        let discarded = store.bulk_replace(snapshot);

        assert_eq!(discarded, 2);
        assert_eq!(store.len(), 10);
        assert_eq!(store.provisional_count(), 0);
    }

    #[test]
    fn test_discard_provisional_keeps_authoritative() {
        let mut store = store_for("alice");
        store.apply_remote_flag(authoritative("flag-1", "alice", 0.0, 0.0));
        let provisional = store
            .place_provisional(Position::new(1.0, 1.0), PlaceOptions::default(), 1)
            .unwrap();

        let dropped = store.discard_provisional();

        assert_eq!(dropped, vec![provisional.id]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_queries() {
        let mut store = store_for("alice");
        store.apply_remote_flag(authoritative("far", "carol", 0.01, 0.0));
        store.apply_remote_flag(authoritative("near", "carol", 0.001, 0.0));
        store.apply_remote_flag(authoritative("mine", "alice", 0.0, 0.0));

        let all: Vec<&str> = store.all_flags().iter().map(|f| f.id.as_str()).collect();
        assert_eq!(all, vec!["far", "near", "mine"]);

        let own: Vec<&str> = store.own_flags().iter().map(|f| f.id.as_str()).collect();
        assert_eq!(own, vec!["mine"]);

        let nearby: Vec<&str> = store
            .flags_within_radius(&Position::new(0.0, 0.0), 500.0)
            .iter()
            .map(|f| f.id.as_str())
            .collect();
        assert_eq!(nearby, vec!["mine", "near"]);
    }
}
