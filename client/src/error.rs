//! Error types surfaced by the client sync core

use thiserror::Error;

/// Failures of the physical connection
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("transport is closed")]
    Closed,
}

/// Business rejections decided locally before anything reaches the server
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FlagError {
    #[error("position lies inside the territory of flag {flag_id} ({distance_m:.0} m away)")]
    TerritoryViolation { flag_id: String, distance_m: f64 },

    #[error("flag {0} not found")]
    NotFound(String),

    #[error("flag {0} is owned by another player")]
    NotOwner(String),

    #[error("flag {0} belongs to the system and cannot be changed")]
    SystemOwned(String),

    #[error("flag {0} has not been confirmed by the server yet")]
    Provisional(String),

    #[error("flag {0} is already hardened")]
    AlreadyHardened(String),

    #[error("no local player identity; authenticate first")]
    NoIdentity,
}

/// Reasons an inbound envelope could not be handled
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("invalid `{msg_type}` payload: {source}")]
    Payload {
        msg_type: String,
        #[source]
        source: serde_json::Error,
    },
}
