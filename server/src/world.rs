//! Authoritative flag and player state
//!
//! The world owns every flag and player record and enforces the rules the
//! clients only pre-check: territory spacing, ownership, hardening cost and
//! teleport tolls. It knows nothing about connections; the network layer
//! maps connections to player ids and turns results into messages.

use log::{debug, info};
use rand::Rng;
use shared::geo;
use shared::{
    AreaFilter, Flag, PlaceOptions, PlayerData, PlayerSummary, Position, SYSTEM_OWNER,
    TERRITORY_RADIUS_M,
};
use std::collections::HashMap;
use thiserror::Error;

/// Rule violations reported back to the requesting player
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorldError {
    #[error("Too close to flag {flag_id} ({distance_m:.0} m away)")]
    TerritoryViolation { flag_id: String, distance_m: f64 },

    #[error("Flag {0} not found")]
    FlagNotFound(String),

    #[error("Flag {0} is owned by another player")]
    NotOwner(String),

    #[error("Flag {0} belongs to the system")]
    SystemFlag(String),

    #[error("Flag {0} is already hardened")]
    AlreadyHardened(String),

    #[error("Flag {0} is private")]
    PrivateFlag(String),

    #[error("Not enough resources: need {needed}, have {available}")]
    InsufficientResources { needed: u64, available: u64 },

    #[error("Unknown player {0}")]
    UnknownPlayer(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorldConfig {
    /// Minimum spacing between flags of different owners
    pub territory_radius_m: f64,
    pub harden_cost: u64,
    pub starting_resources: u64,
    /// Where new players appear
    pub spawn: Position,
    /// Random offset applied to the spawn point, in degrees
    pub spawn_jitter_deg: f64,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            territory_radius_m: TERRITORY_RADIUS_M,
            harden_cost: 50,
            starting_resources: 100,
            spawn: Position::new(0.0, 0.0),
            spawn_jitter_deg: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerRecord {
    pub player_id: String,
    pub username: String,
    pub position: Option<Position>,
    pub resources: u64,
}

impl PlayerRecord {
    pub fn data(&self) -> PlayerData {
        PlayerData {
            username: self.username.clone(),
            position: self.position,
            resources: self.resources,
        }
    }

    pub fn summary(&self) -> PlayerSummary {
        PlayerSummary {
            player_id: self.player_id.clone(),
            username: self.username.clone(),
            position: self.position,
        }
    }
}

/// Outcome of a successful teleport
#[derive(Debug, Clone, PartialEq)]
pub struct Teleport {
    pub position: Position,
    /// Toll paid to the flag's owner, if any
    pub toll_paid: u64,
    pub resources: u64,
}

pub struct World {
    config: WorldConfig,
    /// Flags by id, with a sequence number for stable ordering
    flags: HashMap<String, (u64, Flag)>,
    players: HashMap<String, PlayerRecord>,
    next_flag_id: u64,
}

impl World {
    pub fn new(config: WorldConfig) -> Self {
        Self {
            config,
            flags: HashMap::new(),
            players: HashMap::new(),
            next_flag_id: 1,
        }
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    fn insert_flag(&mut self, mut build: impl FnMut(String) -> Flag) -> Flag {
        let seq = self.next_flag_id;
        self.next_flag_id += 1;
        let flag = build(format!("flag-{}", seq));
        self.flags.insert(flag.id.clone(), (seq, flag.clone()));
        flag
    }

    /// Adds a server-owned flag that nobody can remove
    pub fn seed_system_flag(&mut self, position: Position, name: Option<String>, now: u64) -> Flag {
        let flag = self.insert_flag(|id| Flag {
            id,
            owner_id: SYSTEM_OWNER.to_string(),
            name: name.clone(),
            position,
            is_public: true,
            toll: 0,
            is_hardened: true,
            is_provisional: false,
            created_at: now,
        });
        info!("Seeded system flag {} at {:?}", flag.id, position);
        flag
    }

    /// Registers a player, or refreshes the username of a returning one
    pub fn join(&mut self, player_id: &str, username: &str) -> PlayerRecord {
        if let Some(player) = self.players.get_mut(player_id) {
            if !username.is_empty() {
                player.username = username.to_string();
            }
            return player.clone();
        }

        let jitter = self.config.spawn_jitter_deg;
        let spawn = if jitter > 0.0 {
            let mut rng = rand::thread_rng();
            Position::new(
                self.config.spawn.lat + rng.gen_range(-jitter..=jitter),
                self.config.spawn.lng + rng.gen_range(-jitter..=jitter),
            )
        } else {
            self.config.spawn
        };

        let player = PlayerRecord {
            player_id: player_id.to_string(),
            username: username.to_string(),
            position: Some(spawn),
            resources: self.config.starting_resources,
        };
        info!("Player {} joined at {:?}", player_id, spawn);
        self.players.insert(player_id.to_string(), player.clone());
        player
    }

    pub fn player(&self, player_id: &str) -> Option<&PlayerRecord> {
        self.players.get(player_id)
    }

    fn player_mut(&mut self, player_id: &str) -> Result<&mut PlayerRecord, WorldError> {
        self.players
            .get_mut(player_id)
            .ok_or_else(|| WorldError::UnknownPlayer(player_id.to_string()))
    }

    pub fn flag(&self, flag_id: &str) -> Option<&Flag> {
        self.flags.get(flag_id).map(|(_, flag)| flag)
    }

    pub fn flag_count(&self) -> usize {
        self.flags.len()
    }

    pub fn move_player(&mut self, player_id: &str, position: Position) -> Result<(), WorldError> {
        self.player_mut(player_id)?.position = Some(position);
        Ok(())
    }

    pub fn place_flag(
        &mut self,
        owner_id: &str,
        position: Position,
        options: PlaceOptions,
        now: u64,
    ) -> Result<Flag, WorldError> {
        if !self.players.contains_key(owner_id) {
            return Err(WorldError::UnknownPlayer(owner_id.to_string()));
        }

        if let Some((conflict, distance_m)) = geo::nearest_conflict(
            &position,
            self.flags.values().map(|(_, flag)| flag),
            self.config.territory_radius_m,
            owner_id,
        ) {
            return Err(WorldError::TerritoryViolation {
                flag_id: conflict.id.clone(),
                distance_m,
            });
        }

        let options = options.normalized();
        let flag = self.insert_flag(|id| Flag {
            id,
            owner_id: owner_id.to_string(),
            name: options.name.clone(),
            position,
            is_public: options.is_public,
            toll: options.toll,
            is_hardened: false,
            is_provisional: false,
            created_at: now,
        });
        debug!("Player {} placed {} at {:?}", owner_id, flag.id, position);
        Ok(flag)
    }

    fn owned_flag(&self, player_id: &str, flag_id: &str) -> Result<&Flag, WorldError> {
        let flag = self
            .flag(flag_id)
            .ok_or_else(|| WorldError::FlagNotFound(flag_id.to_string()))?;
        if flag.is_system() {
            return Err(WorldError::SystemFlag(flag_id.to_string()));
        }
        if !flag.is_owned_by(player_id) {
            return Err(WorldError::NotOwner(flag_id.to_string()));
        }
        Ok(flag)
    }

    /// Removes an owned flag; hardened flags refund half their cost
    ///
    /// Returns the removed flag and the owner's resulting balance.
    pub fn remove_flag(&mut self, player_id: &str, flag_id: &str) -> Result<(Flag, u64), WorldError> {
        let refund = if self.owned_flag(player_id, flag_id)?.is_hardened {
            self.config.harden_cost / 2
        } else {
            0
        };

        let (_, flag) = self
            .flags
            .remove(flag_id)
            .ok_or_else(|| WorldError::FlagNotFound(flag_id.to_string()))?;

        let player = self.player_mut(player_id)?;
        player.resources += refund;
        Ok((flag, player.resources))
    }

    /// Hardens an owned flag for `harden_cost` resources; one-way
    pub fn harden_flag(&mut self, player_id: &str, flag_id: &str) -> Result<Flag, WorldError> {
        if self.owned_flag(player_id, flag_id)?.is_hardened {
            return Err(WorldError::AlreadyHardened(flag_id.to_string()));
        }

        let cost = self.config.harden_cost;
        let player = self.player_mut(player_id)?;
        if player.resources < cost {
            return Err(WorldError::InsufficientResources {
                needed: cost,
                available: player.resources,
            });
        }
        player.resources -= cost;

        let (_, flag) = self
            .flags
            .get_mut(flag_id)
            .ok_or_else(|| WorldError::FlagNotFound(flag_id.to_string()))?;
        flag.is_hardened = true;
        Ok(flag.clone())
    }

    /// Moves a player onto a flag they may use
    ///
    /// Own flags, system flags and public flags qualify. Another player's
    /// public toll is paid to its owner.
    pub fn teleport_to_flag(&mut self, player_id: &str, flag_id: &str) -> Result<Teleport, WorldError> {
        let flag = self
            .flag(flag_id)
            .ok_or_else(|| WorldError::FlagNotFound(flag_id.to_string()))?
            .clone();

        let foreign = !flag.is_owned_by(player_id) && !flag.is_system();
        if foreign && !flag.is_public {
            return Err(WorldError::PrivateFlag(flag_id.to_string()));
        }
        let toll = if foreign {
            u64::from(flag.effective_toll())
        } else {
            0
        };

        let player = self.player_mut(player_id)?;
        if player.resources < toll {
            return Err(WorldError::InsufficientResources {
                needed: toll,
                available: player.resources,
            });
        }
        player.resources -= toll;
        player.position = Some(flag.position);
        let resources = player.resources;

        if toll > 0 {
            if let Some(owner) = self.players.get_mut(&flag.owner_id) {
                owner.resources += toll;
            }
        }

        Ok(Teleport {
            position: flag.position,
            toll_paid: toll,
            resources,
        })
    }

    /// Flags matching `filter` in placement order
    pub fn flags_in(&self, filter: &AreaFilter) -> Vec<Flag> {
        let mut flags: Vec<&(u64, Flag)> = self
            .flags
            .values()
            .filter(|(_, flag)| filter.matches(&flag.position))
            .collect();
        flags.sort_by_key(|(seq, _)| *seq);
        flags.into_iter().map(|(_, flag)| flag.clone()).collect()
    }

    /// Players with a known position matching `filter`, ordered by id
    pub fn players_in(&self, filter: &AreaFilter) -> Vec<PlayerSummary> {
        let mut players: Vec<PlayerSummary> = self
            .players
            .values()
            .filter(|player| player.position.map_or(false, |p| filter.matches(&p)))
            .map(PlayerRecord::summary)
            .collect();
        players.sort_by(|a, b| a.player_id.cmp(&b.player_id));
        players
    }
}
