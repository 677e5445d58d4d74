//! Typed notifications raised by the sync core

use crate::session::ConnectionState;
use shared::{Flag, PlayerSummary, Position};

/// Closed set of notification kinds observers can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    FlagPlaced,
    FlagConfirmed,
    FlagRemoved,
    FlagUpdated,
    FlagsLoaded,
    CommandRejected,
    Teleported,
    ConnectionStateChanged,
    Authenticated,
    PlayerMoved,
    PlayersListed,
    ResourcesChanged,
    ServerError,
    ForceDisconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A flag appeared: our own provisional placement or another player's
    FlagPlaced { flag: Flag },
    /// The server confirmed one of our placements
    FlagConfirmed {
        provisional_id: Option<String>,
        flag: Flag,
    },
    FlagRemoved { flag_id: String },
    FlagUpdated { flag: Flag },
    /// A batch of flags arrived, either the session snapshot or an area query
    FlagsLoaded {
        count: usize,
        discarded_provisional: usize,
    },
    /// A command failed, either locally or on the server
    CommandRejected {
        command: &'static str,
        flag_id: Option<String>,
        reason: String,
    },
    Teleported {
        position: Position,
        visual_boundary: Option<f64>,
    },
    ConnectionStateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Authenticated { player_id: String },
    PlayerMoved { player_id: String, position: Position },
    PlayersListed { players: Vec<PlayerSummary> },
    ResourcesChanged { resources: u64 },
    ServerError { message: String },
    ForceDisconnected { reason: String },
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::FlagPlaced { .. } => EventKind::FlagPlaced,
            SyncEvent::FlagConfirmed { .. } => EventKind::FlagConfirmed,
            SyncEvent::FlagRemoved { .. } => EventKind::FlagRemoved,
            SyncEvent::FlagUpdated { .. } => EventKind::FlagUpdated,
            SyncEvent::FlagsLoaded { .. } => EventKind::FlagsLoaded,
            SyncEvent::CommandRejected { .. } => EventKind::CommandRejected,
            SyncEvent::Teleported { .. } => EventKind::Teleported,
            SyncEvent::ConnectionStateChanged { .. } => EventKind::ConnectionStateChanged,
            SyncEvent::Authenticated { .. } => EventKind::Authenticated,
            SyncEvent::PlayerMoved { .. } => EventKind::PlayerMoved,
            SyncEvent::PlayersListed { .. } => EventKind::PlayersListed,
            SyncEvent::ResourcesChanged { .. } => EventKind::ResourcesChanged,
            SyncEvent::ServerError { .. } => EventKind::ServerError,
            SyncEvent::ForceDisconnected { .. } => EventKind::ForceDisconnected,
        }
    }
}

type Observer = Box<dyn FnMut(&SyncEvent) + Send>;

/// Observer registry keyed by [`EventKind`]
///
/// Observers run synchronously inside `publish`, in registration order.
#[derive(Default)]
pub struct EventBus {
    observers: Vec<(Option<EventKind>, Observer)>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer for one kind of event
    pub fn subscribe<F>(&mut self, kind: EventKind, observer: F)
    where
        F: FnMut(&SyncEvent) + Send + 'static,
    {
        self.observers.push((Some(kind), Box::new(observer)));
    }

    /// Registers an observer for every event
    pub fn subscribe_all<F>(&mut self, observer: F)
    where
        F: FnMut(&SyncEvent) + Send + 'static,
    {
        self.observers.push((None, Box::new(observer)));
    }

    pub fn publish(&mut self, event: SyncEvent) {
        let kind = event.kind();
        for (filter, observer) in self.observers.iter_mut() {
            if filter.map_or(true, |wanted| wanted == kind) {
                observer(&event);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}
