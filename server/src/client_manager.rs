//! Connection registry for the flag server
//!
//! This module tracks every open WebSocket connection, including:
//! - Connection lifecycle (accept, authenticate, disconnect)
//! - Binding of connections to player ids, one live connection per player
//! - Per-connection outbound channels used for replies and broadcasts
//! - Capacity management
//!
//! The manager never touches sockets itself. Each connection task owns its
//! socket and drains the channel stored here.

use log::{debug, error, info};
use shared::ServerMessage;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Instructions for a connection's writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Encoded envelope to send as a text frame
    Frame(String),
    /// Send a close frame with this reason and stop
    Close(String),
}

/// Represents one open connection
///
/// Each client maintains:
/// - Connection metadata (ID, address)
/// - The player it authenticated as, if any
/// - The sending half of its outbound channel
#[derive(Debug)]
pub struct Client {
    /// Unique connection identifier assigned by the server
    pub id: u32,
    /// Remote address, for logging
    pub addr: SocketAddr,
    /// Player bound by a successful `authenticate`
    pub player_id: Option<String>,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl Client {
    /// Creates an unauthenticated client writing to `sender`
    pub fn new(id: u32, addr: SocketAddr, sender: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id,
            addr,
            player_id: None,
            sender,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.player_id.is_some()
    }

    /// Queues an already encoded frame; false if the connection is gone
    pub fn send_frame(&self, frame: String) -> bool {
        self.sender.send(Outbound::Frame(frame)).is_ok()
    }

    /// Queues a close frame; the writer stops after sending it
    pub fn close(&self, reason: &str) -> bool {
        self.sender.send(Outbound::Close(reason.to_string())).is_ok()
    }
}

fn encode(message: &ServerMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!("Failed to encode {}: {}", message.message_type(), e);
            None
        }
    }
}

/// Manages all open connections and their player bindings
///
/// The ClientManager enforces the server's capacity limit and guarantees
/// that a player id is bound to at most one connection at a time.
pub struct ClientManager {
    /// Open connections indexed by their unique ID
    clients: HashMap<u32, Client>,
    /// Player id to the connection currently bound to it
    players: HashMap<String, u32>,
    /// Next available connection ID
    next_client_id: u32,
    /// Maximum number of concurrent connections allowed
    max_clients: usize,
}

impl ClientManager {
    /// Creates a new client manager with a capacity limit
    ///
    /// Client IDs start from 1 and increment for each new connection.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            players: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Attempts to register a new connection
    ///
    /// Returns Some(client_id) if successful, None if the server is at
    /// capacity.
    pub fn add_client(
        &mut self,
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> Option<u32> {
        // Enforce server capacity limits
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        let client = Client::new(client_id, addr, sender);
        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, client);

        Some(client_id)
    }

    /// Removes a connection and releases its player binding
    ///
    /// Returns the removed client, or None if it was already gone.
    pub fn remove_client(&mut self, client_id: &u32) -> Option<Client> {
        let client = self.clients.remove(client_id)?;
        if let Some(player_id) = &client.player_id {
            if self.players.get(player_id) == Some(client_id) {
                self.players.remove(player_id);
            }
        }
        info!("Client {} ({}) disconnected", client.id, client.addr);
        Some(client)
    }

    /// Binds `player_id` to `client_id`
    ///
    /// Returns the connection that held the player before, which is now
    /// unbound and should be told to go away. None if the client is unknown
    /// or nobody else held the player.
    pub fn bind_player(&mut self, client_id: u32, player_id: &str) -> Option<u32> {
        let client = self.clients.get_mut(&client_id)?;
        client.player_id = Some(player_id.to_string());

        let previous = self
            .players
            .insert(player_id.to_string(), client_id)
            .filter(|previous| *previous != client_id)?;

        if let Some(old) = self.clients.get_mut(&previous) {
            old.player_id = None;
        }
        debug!(
            "Player {} moved from client {} to client {}",
            player_id, previous, client_id
        );
        Some(previous)
    }

    pub fn player_of(&self, client_id: u32) -> Option<&str> {
        self.clients.get(&client_id)?.player_id.as_deref()
    }

    pub fn client_for_player(&self, player_id: &str) -> Option<u32> {
        self.players.get(player_id).copied()
    }

    /// Sends one message to one connection
    pub fn send_to(&self, client_id: u32, message: &ServerMessage) -> bool {
        let Some(client) = self.clients.get(&client_id) else {
            return false;
        };
        encode(message).map_or(false, |frame| client.send_frame(frame))
    }

    /// Sends a message to every authenticated connection except `exclude`
    ///
    /// Returns how many connections the message was queued for.
    pub fn broadcast(&self, message: &ServerMessage, exclude: Option<u32>) -> usize {
        let Some(frame) = encode(message) else {
            return 0;
        };

        self.clients
            .values()
            .filter(|client| client.is_authenticated() && Some(client.id) != exclude)
            .filter(|client| client.send_frame(frame.clone()))
            .count()
    }

    /// Sends `message` and then closes the connection
    pub fn disconnect_with(&self, client_id: u32, message: &ServerMessage, reason: &str) -> bool {
        let Some(client) = self.clients.get(&client_id) else {
            return false;
        };
        if let Some(frame) = encode(message) {
            client.send_frame(frame);
        }
        client.close(reason)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
