use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod geo;

/// Minimum distance in metres between flags of different owners
pub const TERRITORY_RADIUS_M: f64 = 500.0;
/// Maximum drift between a provisional flag and its confirmed counterpart
pub const RECONCILE_TOLERANCE_M: f64 = 10.0;
/// Owner id of server-seeded flags that nobody may remove
pub const SYSTEM_OWNER: &str = "system";
/// Close reason that marks a disconnect as intentional
pub const CLIENT_DISCONNECT_REASON: &str = "client disconnect";
/// Prefix of client-minted flag ids
pub const PROVISIONAL_PREFIX: &str = "temp-";
pub const ALREADY_AUTHENTICATED: &str = "Already authenticated";
pub const NOT_AUTHENTICATED: &str = "Not authenticated";

/// Wire names of every envelope `type`, in both directions
pub mod message_types {
    pub const AUTHENTICATE: &str = "authenticate";
    pub const PLAYER_MOVE: &str = "player-move";
    pub const PLACE_FLAG: &str = "place-flag";
    pub const REMOVE_FLAG: &str = "remove-flag";
    pub const HARDEN_FLAG: &str = "harden-flag";
    pub const TELEPORT_TO_FLAG: &str = "teleport-to-flag";
    pub const GET_FLAGS: &str = "get-flags";
    pub const GET_PLAYERS: &str = "get-players";

    pub const AUTHENTICATED: &str = "authenticated";
    pub const ERROR: &str = "error";
    pub const PLAYER_MOVED: &str = "player-moved";
    pub const PLAYERS_LIST: &str = "players-list";
    pub const FLAG_PLACED: &str = "flag-placed";
    pub const FLAG_PLACED_BY_OTHER: &str = "flag-placed-by-other";
    pub const FLAG_REMOVED: &str = "flag-removed";
    pub const FLAG_UPDATED: &str = "flag-updated";
    pub const TELEPORT_RESULT: &str = "teleport-result";
    pub const INITIAL_FLAGS: &str = "initial-flags";
    pub const FORCE_DISCONNECT: &str = "force-disconnect";
}

/// WGS84 coordinate in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
}

impl Position {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// A persistent world marker claiming the territory around it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub id: String,
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub position: Position,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub toll: u32,
    #[serde(default)]
    pub is_hardened: bool,
    /// Only ever true on this client's own unconfirmed flags
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_provisional: bool,
    #[serde(default)]
    pub created_at: u64,
}

impl Flag {
    pub fn is_system(&self) -> bool {
        self.owner_id == SYSTEM_OWNER
    }

    pub fn is_owned_by(&self, player_id: &str) -> bool {
        self.owner_id == player_id
    }

    /// Toll another player pays to use this flag
    pub fn effective_toll(&self) -> u32 {
        if self.is_public {
            self.toll
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub toll: u32,
}

impl PlaceOptions {
    pub fn private(name: Option<String>) -> Self {
        Self {
            name,
            is_public: false,
            toll: 0,
        }
    }

    pub fn public(name: Option<String>, toll: u32) -> Self {
        Self {
            name,
            is_public: true,
            toll,
        }
    }

    /// Private flags never carry a toll
    pub fn normalized(mut self) -> Self {
        if !self.is_public {
            self.toll = 0;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl Bounds {
    pub fn contains(&self, position: &Position) -> bool {
        position.lat <= self.north
            && position.lat >= self.south
            && position.lng <= self.east
            && position.lng >= self.west
    }
}

/// Optional scope of a `get-flags` / `get-players` query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
}

impl AreaFilter {
    pub fn everywhere() -> Self {
        Self::default()
    }

    pub fn within(bounds: Bounds) -> Self {
        Self {
            area_id: None,
            bounds: Some(bounds),
        }
    }

    pub fn matches(&self, position: &Position) -> bool {
        self.bounds.map_or(true, |bounds| bounds.contains(position))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatePayload {
    pub player_id: String,
    pub username: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerMovePayload {
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceFlagPayload {
    pub position: Position,
    #[serde(default)]
    pub options: PlaceOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagIdPayload {
    pub flag_id: String,
}

/// Commands sent from client to server as `{type, data}` envelopes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    Authenticate(AuthenticatePayload),
    PlayerMove(PlayerMovePayload),
    PlaceFlag(PlaceFlagPayload),
    RemoveFlag(FlagIdPayload),
    HardenFlag(FlagIdPayload),
    TeleportToFlag(FlagIdPayload),
    GetFlags(AreaFilter),
    GetPlayers(AreaFilter),
}

impl ClientMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::Authenticate(_) => message_types::AUTHENTICATE,
            ClientMessage::PlayerMove(_) => message_types::PLAYER_MOVE,
            ClientMessage::PlaceFlag(_) => message_types::PLACE_FLAG,
            ClientMessage::RemoveFlag(_) => message_types::REMOVE_FLAG,
            ClientMessage::HardenFlag(_) => message_types::HARDEN_FLAG,
            ClientMessage::TeleportToFlag(_) => message_types::TELEPORT_TO_FLAG,
            ClientMessage::GetFlags(_) => message_types::GET_FLAGS,
            ClientMessage::GetPlayers(_) => message_types::GET_PLAYERS,
        }
    }

    /// The handshake is the only command allowed before authentication
    pub fn is_handshake(&self) -> bool {
        matches!(self, ClientMessage::Authenticate(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerData {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub resources: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSummary {
    pub player_id: String,
    #[serde(default)]
    pub username: String,
    pub position: Option<Position>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedPayload {
    pub player_id: String,
    #[serde(default)]
    pub player_data: PlayerData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerMovedPayload {
    pub player_id: String,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayersListPayload {
    pub players: Vec<PlayerSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagPlacedPayload {
    pub success: bool,
    #[serde(default)]
    pub flag: Option<Flag>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagPayload {
    pub flag: Flag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRemovedPayload {
    pub success: bool,
    pub flag_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeleportResultPayload {
    pub success: bool,
    #[serde(default)]
    pub position: Option<Position>,
    /// Radius in metres of the territory drawn around the arrival point
    #[serde(default)]
    pub visual_boundary: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialFlagsPayload {
    pub flags: Vec<Flag>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceDisconnectPayload {
    pub reason: String,
}

/// Events pushed from server to client as `{type, data}` envelopes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    Authenticated(AuthenticatedPayload),
    Error(ErrorPayload),
    PlayerMoved(PlayerMovedPayload),
    PlayersList(PlayersListPayload),
    FlagPlaced(FlagPlacedPayload),
    FlagPlacedByOther(FlagPayload),
    FlagRemoved(FlagRemovedPayload),
    FlagUpdated(FlagPayload),
    TeleportResult(TeleportResultPayload),
    InitialFlags(InitialFlagsPayload),
    ForceDisconnect(ForceDisconnectPayload),
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorPayload {
            message: message.into(),
        })
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::Authenticated(_) => message_types::AUTHENTICATED,
            ServerMessage::Error(_) => message_types::ERROR,
            ServerMessage::PlayerMoved(_) => message_types::PLAYER_MOVED,
            ServerMessage::PlayersList(_) => message_types::PLAYERS_LIST,
            ServerMessage::FlagPlaced(_) => message_types::FLAG_PLACED,
            ServerMessage::FlagPlacedByOther(_) => message_types::FLAG_PLACED_BY_OTHER,
            ServerMessage::FlagRemoved(_) => message_types::FLAG_REMOVED,
            ServerMessage::FlagUpdated(_) => message_types::FLAG_UPDATED,
            ServerMessage::TeleportResult(_) => message_types::TELEPORT_RESULT,
            ServerMessage::InitialFlags(_) => message_types::INITIAL_FLAGS,
            ServerMessage::ForceDisconnect(_) => message_types::FORCE_DISCONNECT,
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
