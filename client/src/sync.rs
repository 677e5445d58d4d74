//! Public facade over session, router and flag store
//!
//! [`SyncClient`] is what presentation code talks to. Mutations apply
//! optimistically and return at once; everything the server later says
//! about them arrives as [`SyncEvent`]s through the observers registered
//! with [`SyncClient::subscribe`].
//!
//! The facade is synchronous and owns all of its state. Whoever drives it
//! (the tokio driver in `runtime`, or a test) feeds it connection outcomes
//! and raw frames and calls the command methods, all from one logical
//! thread.

use crate::config::{ClientConfig, Credentials};
use crate::error::{FlagError, SessionError};
use crate::events::{EventBus, EventKind, SyncEvent};
use crate::flags::FlagStore;
use crate::router::{Dispatch, MessageRouter};
use crate::session::{
    is_already_authenticated, CloseReason, ConnectionSession, ConnectionState, ReconnectPlan,
    Transport,
};
use log::{debug, info, warn};
use shared::message_types;
use shared::{
    now_millis, AreaFilter, AuthenticatedPayload, ClientMessage, ErrorPayload, Flag, FlagIdPayload,
    FlagPayload, FlagPlacedPayload, FlagRemovedPayload, ForceDisconnectPayload,
    InitialFlagsPayload, PlaceFlagPayload, PlaceOptions, PlayerMovePayload, PlayerMovedPayload,
    PlayerSummary, PlayersListPayload, Position, TeleportResultPayload,
};
use std::collections::HashMap;

/// Result of [`SyncClient::connect`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectOutcome {
    Connected,
    /// A connection was already open or being opened
    AlreadyActive,
    Failed(ReconnectPlan),
}

/// Everything the inbound handlers operate on
struct ClientCore<T: Transport> {
    session: ConnectionSession<T>,
    flags: FlagStore,
    events: EventBus,
    local_position: Option<Position>,
    players: HashMap<String, PlayerSummary>,
    resources: Option<u64>,
    /// Set by `authenticated`; the next `initial-flags` is the session snapshot
    snapshot_pending: bool,
}

impl<T: Transport> ClientCore<T> {
    fn new(config: &ClientConfig) -> Self {
        Self {
            session: ConnectionSession::new(config.backoff),
            flags: FlagStore::new(config.territory_radius_m, config.reconcile_tolerance_m),
            events: EventBus::new(),
            local_position: None,
            players: HashMap::new(),
            resources: None,
            snapshot_pending: false,
        }
    }

    /// Turns recorded session transitions into events
    fn publish_state_changes(&mut self) {
        for change in self.session.take_state_changes() {
            self.events.publish(SyncEvent::ConnectionStateChanged {
                from: change.from,
                to: change.to,
            });
        }
    }

    fn reject(&mut self, command: &'static str, flag_id: Option<String>, reason: String) {
        warn!("{} rejected: {}", command, reason);
        self.events.publish(SyncEvent::CommandRejected {
            command,
            flag_id,
            reason,
        });
    }

    fn set_resources(&mut self, resources: u64) {
        if self.resources != Some(resources) {
            self.resources = Some(resources);
            self.events.publish(SyncEvent::ResourcesChanged { resources });
        }
    }

    /// Unconfirmed placements do not outlive the session they were made in
    fn settle(&mut self, plan: ReconnectPlan) -> ReconnectPlan {
        if plan.is_teardown()
            && self.session.state() == ConnectionState::Disconnected
            && !self.session.retry_pending()
        {
            self.discard_provisional();
        }
        self.publish_state_changes();
        plan
    }

    fn discard_provisional(&mut self) {
        let dropped = self.flags.discard_provisional();
        if !dropped.is_empty() {
            debug!("Discarded {} unconfirmed flags on teardown", dropped.len());
        }
    }

    fn confirmed_player_id(&self) -> Option<String> {
        self.session
            .player_id()
            .or_else(|| self.flags.local_player())
            .map(str::to_string)
    }

    fn on_authenticated(&mut self, payload: AuthenticatedPayload) {
        let AuthenticatedPayload {
            player_id,
            player_data,
        } = payload;
        info!("Authenticated as {} ({})", player_id, player_data.username);

        self.flags.set_local_player(Some(player_id.clone()));
        self.snapshot_pending = true;
        self.session.mark_authenticated(player_id.clone());
        self.publish_state_changes();
        self.events.publish(SyncEvent::Authenticated { player_id });

        if let Some(position) = player_data.position {
            self.local_position = Some(position);
        }
        self.set_resources(player_data.resources);
    }

    fn on_error(&mut self, payload: ErrorPayload) {
        if is_already_authenticated(&payload.message) {
            // The server already knows us; same outcome as a fresh handshake
            if self.session.state().is_open() && !self.session.is_authenticated() {
                if let Some(player_id) = self
                    .session
                    .credentials()
                    .map(|credentials| credentials.player_id.clone())
                {
                    info!("Server reports existing authentication for {}", player_id);
                    self.flags.set_local_player(Some(player_id.clone()));
                    self.session.mark_authenticated(player_id.clone());
                    self.publish_state_changes();
                    self.events.publish(SyncEvent::Authenticated { player_id });
                }
            }
            return;
        }

        if self.session.state() == ConnectionState::Authenticating {
            self.session.authentication_rejected(&payload.message);
            self.publish_state_changes();
        }
        warn!("Server error: {}", payload.message);
        self.events.publish(SyncEvent::ServerError {
            message: payload.message,
        });
    }

    fn on_flag_placed(&mut self, payload: FlagPlacedPayload) {
        match (payload.success, payload.flag) {
            (true, Some(flag)) => {
                let outcome = self.flags.confirm_placement(flag);
                self.events.publish(SyncEvent::FlagConfirmed {
                    provisional_id: outcome.replaced,
                    flag: outcome.flag,
                });
            }
            (true, None) => warn!("Placement confirmed without a flag record"),
            (false, _) => {
                // The provisional record stays; removing it is up to the caller
                let reason = payload
                    .error
                    .unwrap_or_else(|| "placement rejected".to_string());
                self.reject(message_types::PLACE_FLAG, None, reason);
            }
        }
    }

    fn on_flag_placed_by_other(&mut self, payload: FlagPayload) {
        debug!("Flag {} placed by {}", payload.flag.id, payload.flag.owner_id);
        self.flags.apply_remote_flag(payload.flag.clone());
        self.events.publish(SyncEvent::FlagPlaced { flag: payload.flag });
    }

    fn on_flag_removed(&mut self, payload: FlagRemovedPayload) {
        if !payload.success {
            let reason = payload
                .error
                .unwrap_or_else(|| "removal rejected".to_string());
            self.reject(message_types::REMOVE_FLAG, Some(payload.flag_id), reason);
            return;
        }

        if self.flags.apply_remote_removal(&payload.flag_id).is_some() {
            self.events.publish(SyncEvent::FlagRemoved {
                flag_id: payload.flag_id,
            });
        }
        if let Some(resources) = payload.resources {
            self.set_resources(resources);
        }
    }

    fn on_flag_updated(&mut self, payload: FlagPayload) {
        let flag = self.flags.apply_remote_update(payload.flag);
        self.events.publish(SyncEvent::FlagUpdated { flag });
    }

    fn on_teleport_result(&mut self, payload: TeleportResultPayload) {
        match (payload.success, payload.position) {
            (true, Some(position)) => {
                self.local_position = Some(position);
                self.events.publish(SyncEvent::Teleported {
                    position,
                    visual_boundary: payload.visual_boundary,
                });
            }
            (true, None) => warn!("Teleport confirmed without a position"),
            (false, _) => {
                let reason = payload
                    .error
                    .unwrap_or_else(|| "teleport rejected".to_string());
                self.reject(message_types::TELEPORT_TO_FLAG, None, reason);
            }
        }
    }

    /// The first answer after authentication replaces the store; later
    /// answers to area queries only cover part of the world and are merged
    fn on_initial_flags(&mut self, payload: InitialFlagsPayload) {
        let count = payload.flags.len();
        let discarded_provisional = if std::mem::take(&mut self.snapshot_pending) {
            self.flags.bulk_replace(payload.flags)
        } else {
            debug!("Merging {} flags from an area query", count);
            for flag in payload.flags {
                self.flags.apply_remote_flag(flag);
            }
            0
        };
        self.events.publish(SyncEvent::FlagsLoaded {
            count,
            discarded_provisional,
        });
    }

    fn on_player_moved(&mut self, payload: PlayerMovedPayload) {
        let PlayerMovedPayload {
            player_id,
            position,
        } = payload;

        if self.confirmed_player_id().as_deref() == Some(player_id.as_str()) {
            self.local_position = Some(position);
        } else {
            self.players
                .entry(player_id.clone())
                .and_modify(|player| player.position = Some(position))
                .or_insert_with(|| PlayerSummary {
                    player_id: player_id.clone(),
                    username: String::new(),
                    position: Some(position),
                });
        }
        self.events.publish(SyncEvent::PlayerMoved {
            player_id,
            position,
        });
    }

    fn on_players_list(&mut self, payload: PlayersListPayload) {
        let local = self.confirmed_player_id();
        self.players = payload
            .players
            .iter()
            .filter(|player| local.as_deref() != Some(player.player_id.as_str()))
            .map(|player| (player.player_id.clone(), player.clone()))
            .collect();
        self.events.publish(SyncEvent::PlayersListed {
            players: payload.players,
        });
    }

    fn on_force_disconnect(&mut self, payload: ForceDisconnectPayload) {
        self.session.force_disconnect(&payload.reason);
        self.discard_provisional();
        self.publish_state_changes();
        self.events.publish(SyncEvent::ForceDisconnected {
            reason: payload.reason,
        });
    }
}

/// Client-side synchronisation of flags and players with one server
pub struct SyncClient<T: Transport + 'static> {
    router: MessageRouter<ClientCore<T>>,
    core: ClientCore<T>,
}

impl<T: Transport + 'static> SyncClient<T> {
    pub fn new(config: &ClientConfig) -> Self {
        let mut router: MessageRouter<ClientCore<T>> = MessageRouter::new();
        router.register_typed(message_types::AUTHENTICATED, ClientCore::on_authenticated);
        router.register_typed(message_types::ERROR, ClientCore::on_error);
        router.register_typed(message_types::FLAG_PLACED, ClientCore::on_flag_placed);
        router.register_typed(
            message_types::FLAG_PLACED_BY_OTHER,
            ClientCore::on_flag_placed_by_other,
        );
        router.register_typed(message_types::FLAG_REMOVED, ClientCore::on_flag_removed);
        router.register_typed(message_types::FLAG_UPDATED, ClientCore::on_flag_updated);
        router.register_typed(message_types::TELEPORT_RESULT, ClientCore::on_teleport_result);
        router.register_typed(message_types::INITIAL_FLAGS, ClientCore::on_initial_flags);
        router.register_typed(message_types::PLAYER_MOVED, ClientCore::on_player_moved);
        router.register_typed(message_types::PLAYERS_LIST, ClientCore::on_players_list);
        router.register_typed(
            message_types::FORCE_DISCONNECT,
            ClientCore::on_force_disconnect,
        );

        Self {
            router,
            core: ClientCore::new(config),
        }
    }

    pub fn subscribe<F>(&mut self, kind: EventKind, observer: F)
    where
        F: FnMut(&SyncEvent) + Send + 'static,
    {
        self.core.events.subscribe(kind, observer);
    }

    pub fn subscribe_all<F>(&mut self, observer: F)
    where
        F: FnMut(&SyncEvent) + Send + 'static,
    {
        self.core.events.subscribe_all(observer);
    }

    // Connection lifecycle

    /// Connects using an already opened (or failed) transport
    ///
    /// Shorthand for [`begin_connect`](Self::begin_connect) followed by
    /// [`connection_established`](Self::connection_established) or
    /// [`connection_failed`](Self::connection_failed).
    pub fn connect(&mut self, opened: Result<T, SessionError>) -> ConnectOutcome {
        if !self.begin_connect() {
            if let Ok(mut transport) = opened {
                transport.close(shared::CLIENT_DISCONNECT_REASON);
            }
            return ConnectOutcome::AlreadyActive;
        }

        match opened {
            Ok(transport) => {
                self.connection_established(transport);
                ConnectOutcome::Connected
            }
            Err(e) => ConnectOutcome::Failed(self.connection_failed(&e)),
        }
    }

    pub fn begin_connect(&mut self) -> bool {
        let started = self.core.session.begin_connect();
        self.core.publish_state_changes();
        started
    }

    pub fn begin_reconnect(&mut self) -> bool {
        let started = self.core.session.begin_reconnect();
        self.core.publish_state_changes();
        started
    }

    pub fn connection_established(&mut self, transport: T) -> bool {
        let accepted = self.core.session.connection_established(transport);
        self.core.publish_state_changes();
        accepted
    }

    pub fn connection_failed(&mut self, err: &SessionError) -> ReconnectPlan {
        let plan = self.core.session.connection_failed(err);
        self.core.settle(plan)
    }

    pub fn connection_lost(&mut self, reason: CloseReason) -> ReconnectPlan {
        let plan = self.core.session.connection_lost(reason);
        self.core.settle(plan)
    }

    /// Stores credentials and handshakes as soon as a connection allows it
    ///
    /// The player id doubles as the local identity for optimistic placements
    /// made before the server has answered.
    pub fn authenticate(&mut self, credentials: Credentials) -> bool {
        if self.core.flags.local_player().is_none() {
            self.core
                .flags
                .set_local_player(Some(credentials.player_id.clone()));
        }
        let sent = self.core.session.authenticate(credentials);
        self.core.publish_state_changes();
        sent
    }

    /// Clean shutdown; no reconnect follows and unconfirmed flags are dropped
    pub fn disconnect(&mut self) {
        self.core.session.disconnect();
        self.core.discard_provisional();
        self.core.publish_state_changes();
    }

    /// Routes one inbound frame; bad frames are logged and dropped
    pub fn handle_frame(&mut self, raw: &str) -> Dispatch {
        let outcome = self.router.dispatch(&mut self.core, raw);
        self.core.publish_state_changes();
        outcome
    }

    // Commands

    fn send(&mut self, message: ClientMessage) -> bool {
        let sent = self.core.session.send(message);
        self.core.publish_state_changes();
        sent
    }

    /// Places a flag optimistically and returns its provisional id
    ///
    /// Positions inside another owner's territory fail here, before any
    /// traffic. The server's verdict arrives later as `FlagConfirmed` or
    /// `CommandRejected`.
    pub fn place_flag(&mut self, position: Position, options: PlaceOptions) -> Result<String, FlagError> {
        let options = options.normalized();
        let flag = match self
            .core
            .flags
            .place_provisional(position, options.clone(), now_millis())
        {
            Ok(flag) => flag,
            Err(e) => {
                let flag_id = match &e {
                    FlagError::TerritoryViolation { flag_id, .. } => Some(flag_id.clone()),
                    _ => None,
                };
                self.core
                    .reject(message_types::PLACE_FLAG, flag_id, e.to_string());
                return Err(e);
            }
        };

        let provisional_id = flag.id.clone();
        self.core.events.publish(SyncEvent::FlagPlaced { flag });
        self.send(ClientMessage::PlaceFlag(PlaceFlagPayload { position, options }));
        Ok(provisional_id)
    }

    /// Removes one of our flags locally, then asks the server to follow
    ///
    /// Unconfirmed flags are only known locally, so nothing is sent for them.
    pub fn remove_flag(&mut self, flag_id: &str) -> Result<(), FlagError> {
        let flag = match self.core.flags.remove_local(flag_id) {
            Ok(flag) => flag,
            Err(e) => {
                self.core.reject(
                    message_types::REMOVE_FLAG,
                    Some(flag_id.to_string()),
                    e.to_string(),
                );
                return Err(e);
            }
        };

        self.core.events.publish(SyncEvent::FlagRemoved {
            flag_id: flag.id.clone(),
        });
        if !flag.is_provisional {
            self.send(ClientMessage::RemoveFlag(FlagIdPayload { flag_id: flag.id }));
        }
        Ok(())
    }

    /// Asks the server to harden one of our flags; nothing changes locally
    /// until `flag-updated` arrives
    pub fn harden_flag(&mut self, flag_id: &str) -> Result<(), FlagError> {
        if let Err(e) = self.core.flags.check_hardenable(flag_id) {
            self.core.reject(
                message_types::HARDEN_FLAG,
                Some(flag_id.to_string()),
                e.to_string(),
            );
            return Err(e);
        }
        self.send(ClientMessage::HardenFlag(FlagIdPayload {
            flag_id: flag_id.to_string(),
        }));
        Ok(())
    }

    pub fn teleport_to_flag(&mut self, flag_id: &str) -> Result<(), FlagError> {
        if let Err(e) = self.core.flags.check_teleport_target(flag_id) {
            self.core.reject(
                message_types::TELEPORT_TO_FLAG,
                Some(flag_id.to_string()),
                e.to_string(),
            );
            return Err(e);
        }
        self.send(ClientMessage::TeleportToFlag(FlagIdPayload {
            flag_id: flag_id.to_string(),
        }));
        Ok(())
    }

    /// Moves the local player; returns true if the update went out at once
    pub fn move_to(&mut self, position: Position) -> bool {
        self.core.local_position = Some(position);
        self.send(ClientMessage::PlayerMove(PlayerMovePayload { position }))
    }

    /// Requests the flags in an area; the answer is merged into the store
    pub fn request_flags(&mut self, filter: AreaFilter) -> bool {
        self.send(ClientMessage::GetFlags(filter))
    }

    pub fn request_players(&mut self, filter: AreaFilter) -> bool {
        self.send(ClientMessage::GetPlayers(filter))
    }

    // Queries

    pub fn state(&self) -> ConnectionState {
        self.core.session.state()
    }

    pub fn is_authenticated(&self) -> bool {
        self.core.session.is_authenticated()
    }

    pub fn local_player(&self) -> Option<&str> {
        self.core.flags.local_player()
    }

    pub fn queued_len(&self) -> usize {
        self.core.session.queued_len()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.core.session.reconnect_attempts()
    }

    pub fn flag(&self, flag_id: &str) -> Option<&Flag> {
        self.core.flags.get(flag_id)
    }

    pub fn all_flags(&self) -> Vec<&Flag> {
        self.core.flags.all_flags()
    }

    pub fn own_flags(&self) -> Vec<&Flag> {
        self.core.flags.own_flags()
    }

    pub fn flags_within_radius(&self, position: &Position, radius_m: f64) -> Vec<&Flag> {
        self.core.flags.flags_within_radius(position, radius_m)
    }

    pub fn provisional_count(&self) -> usize {
        self.core.flags.provisional_count()
    }

    pub fn local_position(&self) -> Option<Position> {
        self.core.local_position
    }

    pub fn player_position(&self, player_id: &str) -> Option<Position> {
        if self.local_player() == Some(player_id) {
            return self.core.local_position;
        }
        self.core
            .players
            .get(player_id)
            .and_then(|player| player.position)
    }

    /// Other players known to this client, ordered by id
    pub fn players(&self) -> Vec<&PlayerSummary> {
        let mut players: Vec<&PlayerSummary> = self.core.players.values().collect();
        players.sort_by(|a, b| a.player_id.cmp(&b.player_id));
        players
    }

    pub fn resources(&self) -> Option<u64> {
        self.core.resources
    }
}
