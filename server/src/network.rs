//! Server network layer handling WebSocket connections and message dispatch

use crate::client_manager::{ClientManager, Outbound};
use crate::world::{World, WorldConfig};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{
    now_millis, AreaFilter, AuthenticatePayload, AuthenticatedPayload, ClientMessage,
    FlagIdPayload, FlagPayload, FlagPlacedPayload, FlagRemovedPayload, ForceDisconnectPayload,
    InitialFlagsPayload, PlaceFlagPayload, PlayerMovedPayload, PlayersListPayload, ServerMessage,
    TeleportResultPayload, ALREADY_AUTHENTICATED, NOT_AUTHENTICATED,
};
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Reason sent to a connection whose player logged in elsewhere
pub const SESSION_REPLACED: &str = "Logged in from another session";
/// Reason sent to connections refused at capacity
pub const SERVER_FULL: &str = "Server full";

/// Messages sent from connection tasks to the main server loop
#[derive(Debug)]
pub enum ServerEvent {
    Accepted {
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<Outbound>,
        /// Assigned client id, or None when refused
        reply: oneshot::Sender<Option<u32>>,
    },
    Frame {
        client_id: u32,
        text: String,
    },
    Disconnected {
        client_id: u32,
    },
}

/// Connection registry and world, touched only by the main loop
pub struct ServerState {
    clients: ClientManager,
    world: World,
}

impl ServerState {
    pub fn new(config: WorldConfig, max_clients: usize) -> Self {
        Self {
            clients: ClientManager::new(max_clients),
            world: World::new(config),
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    pub fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Accepted {
                addr,
                sender,
                reply,
            } => {
                let client_id = self.clients.add_client(addr, sender.clone());
                if client_id.is_none() {
                    warn!("Server full, refusing connection from {}", addr);
                    let refusal = ServerMessage::ForceDisconnect(ForceDisconnectPayload {
                        reason: SERVER_FULL.to_string(),
                    });
                    if let Ok(frame) = serde_json::to_string(&refusal) {
                        let _ = sender.send(Outbound::Frame(frame));
                    }
                    let _ = sender.send(Outbound::Close(SERVER_FULL.to_string()));
                }
                if reply.send(client_id).is_err() {
                    debug!("Connection from {} went away during accept", addr);
                }
            }
            ServerEvent::Frame { client_id, text } => self.handle_frame(client_id, &text),
            ServerEvent::Disconnected { client_id } => {
                self.clients.remove_client(&client_id);
            }
        }
    }

    fn reply(&self, client_id: u32, message: ServerMessage) {
        if !self.clients.send_to(client_id, &message) {
            debug!("Dropped {} for client {}", message.message_type(), client_id);
        }
    }

    /// Parses and applies one text frame from `client_id`
    pub fn handle_frame(&mut self, client_id: u32, text: &str) {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Invalid message from client {}: {}", client_id, e);
                self.reply(client_id, ServerMessage::error(format!("Invalid message: {}", e)));
                return;
            }
        };

        if let ClientMessage::Authenticate(payload) = message {
            self.authenticate(client_id, payload);
            return;
        }

        let Some(player_id) = self.clients.player_of(client_id).map(str::to_string) else {
            self.reply(client_id, ServerMessage::error(NOT_AUTHENTICATED));
            return;
        };

        match message {
            ClientMessage::Authenticate(_) => {}
            ClientMessage::PlayerMove(payload) => {
                match self.world.move_player(&player_id, payload.position) {
                    Ok(()) => {
                        let moved = ServerMessage::PlayerMoved(PlayerMovedPayload {
                            player_id,
                            position: payload.position,
                        });
                        self.clients.broadcast(&moved, Some(client_id));
                    }
                    Err(e) => self.reply(client_id, ServerMessage::error(e.to_string())),
                }
            }
            ClientMessage::PlaceFlag(payload) => self.place_flag(client_id, &player_id, payload),
            ClientMessage::RemoveFlag(FlagIdPayload { flag_id }) => {
                self.remove_flag(client_id, &player_id, flag_id)
            }
            ClientMessage::HardenFlag(FlagIdPayload { flag_id }) => {
                match self.world.harden_flag(&player_id, &flag_id) {
                    Ok(flag) => {
                        info!("Player {} hardened {}", player_id, flag.id);
                        let updated = ServerMessage::FlagUpdated(FlagPayload { flag });
                        self.clients.broadcast(&updated, None);
                    }
                    Err(e) => self.reply(client_id, ServerMessage::error(e.to_string())),
                }
            }
            ClientMessage::TeleportToFlag(FlagIdPayload { flag_id }) => {
                self.teleport(client_id, &player_id, &flag_id)
            }
            ClientMessage::GetFlags(filter) => {
                let flags = self.world.flags_in(&filter);
                self.reply(
                    client_id,
                    ServerMessage::InitialFlags(InitialFlagsPayload { flags }),
                );
            }
            ClientMessage::GetPlayers(filter) => {
                let players = self.world.players_in(&filter);
                self.reply(
                    client_id,
                    ServerMessage::PlayersList(PlayersListPayload { players }),
                );
            }
        }
    }

    fn authenticate(&mut self, client_id: u32, payload: AuthenticatePayload) {
        if self.clients.player_of(client_id).is_some() {
            self.reply(client_id, ServerMessage::error(ALREADY_AUTHENTICATED));
            return;
        }

        let record = self.world.join(&payload.player_id, &payload.username);
        if let Some(previous) = self.clients.bind_player(client_id, &payload.player_id) {
            info!(
                "Player {} logged in again, dropping client {}",
                payload.player_id, previous
            );
            let kick = ServerMessage::ForceDisconnect(ForceDisconnectPayload {
                reason: SESSION_REPLACED.to_string(),
            });
            self.clients.disconnect_with(previous, &kick, SESSION_REPLACED);
        }
        info!("Client {} authenticated as {}", client_id, payload.player_id);

        self.reply(
            client_id,
            ServerMessage::Authenticated(AuthenticatedPayload {
                player_id: record.player_id.clone(),
                player_data: record.data(),
            }),
        );
        let flags = self.world.flags_in(&AreaFilter::everywhere());
        self.reply(
            client_id,
            ServerMessage::InitialFlags(InitialFlagsPayload { flags }),
        );
    }

    fn place_flag(&mut self, client_id: u32, player_id: &str, payload: PlaceFlagPayload) {
        let result =
            self.world
                .place_flag(player_id, payload.position, payload.options, now_millis());

        match result {
            Ok(flag) => {
                info!("Player {} placed {}", player_id, flag.id);
                self.reply(
                    client_id,
                    ServerMessage::FlagPlaced(FlagPlacedPayload {
                        success: true,
                        flag: Some(flag.clone()),
                        error: None,
                    }),
                );
                let placed = ServerMessage::FlagPlacedByOther(FlagPayload { flag });
                self.clients.broadcast(&placed, Some(client_id));
            }
            Err(e) => {
                debug!("Placement by {} refused: {}", player_id, e);
                self.reply(
                    client_id,
                    ServerMessage::FlagPlaced(FlagPlacedPayload {
                        success: false,
                        flag: None,
                        error: Some(e.to_string()),
                    }),
                );
            }
        }
    }

    fn remove_flag(&mut self, client_id: u32, player_id: &str, flag_id: String) {
        match self.world.remove_flag(player_id, &flag_id) {
            Ok((flag, resources)) => {
                info!("Player {} removed {}", player_id, flag.id);
                self.reply(
                    client_id,
                    ServerMessage::FlagRemoved(FlagRemovedPayload {
                        success: true,
                        flag_id: flag.id.clone(),
                        resources: Some(resources),
                        error: None,
                    }),
                );
                let removed = ServerMessage::FlagRemoved(FlagRemovedPayload {
                    success: true,
                    flag_id: flag.id,
                    resources: None,
                    error: None,
                });
                self.clients.broadcast(&removed, Some(client_id));
            }
            Err(e) => self.reply(
                client_id,
                ServerMessage::FlagRemoved(FlagRemovedPayload {
                    success: false,
                    flag_id,
                    resources: None,
                    error: Some(e.to_string()),
                }),
            ),
        }
    }

    fn teleport(&mut self, client_id: u32, player_id: &str, flag_id: &str) {
        match self.world.teleport_to_flag(player_id, flag_id) {
            Ok(teleport) => {
                if teleport.toll_paid > 0 {
                    debug!("Player {} paid {} toll", player_id, teleport.toll_paid);
                }
                self.reply(
                    client_id,
                    ServerMessage::TeleportResult(TeleportResultPayload {
                        success: true,
                        position: Some(teleport.position),
                        visual_boundary: Some(self.world.config().territory_radius_m),
                        error: None,
                    }),
                );
                let moved = ServerMessage::PlayerMoved(PlayerMovedPayload {
                    player_id: player_id.to_string(),
                    position: teleport.position,
                });
                self.clients.broadcast(&moved, Some(client_id));
            }
            Err(e) => self.reply(
                client_id,
                ServerMessage::TeleportResult(TeleportResultPayload {
                    success: false,
                    position: None,
                    visual_boundary: None,
                    error: Some(e.to_string()),
                }),
            ),
        }
    }
}

/// Main server coordinating connections and the authoritative world
pub struct Server {
    listener: TcpListener,
    state: ServerState,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerEvent>,
    server_rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Server {
    pub async fn bind(addr: &str, config: WorldConfig, max_clients: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(Server {
            listener,
            state: ServerState::new(config, max_clients),
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Access for seeding the world before `run`
    pub fn world_mut(&mut self) -> &mut World {
        self.state.world_mut()
    }

    /// Accepts connections and processes their messages until every sender is gone
    pub async fn run(self) -> io::Result<()> {
        let Server {
            listener,
            mut state,
            server_tx,
            mut server_rx,
        } = self;

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        tokio::spawn(handle_connection(stream, addr, server_tx.clone()));
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                }
            }
        });

        info!("Server started");
        while let Some(event) = server_rx.recv().await {
            state.handle_event(event);
        }
        Ok(())
    }
}

fn to_ws_message(outbound: Outbound) -> Message {
    match outbound {
        Outbound::Frame(text) => Message::Text(text),
        Outbound::Close(reason) => Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: reason.into(),
        })),
    }
}

/// Upgrades one TCP stream and pumps it until either side closes
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    server_tx: mpsc::UnboundedSender<ServerEvent>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let (mut sink, mut source) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

    let writer = tokio::spawn(async move {
        while let Some(outbound) = out_rx.recv().await {
            let closing = matches!(outbound, Outbound::Close(_));
            if let Err(e) = sink.send(to_ws_message(outbound)).await {
                debug!("Writer for {} stopped: {}", addr, e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    let (reply_tx, reply_rx) = oneshot::channel();
    let accepted = ServerEvent::Accepted {
        addr,
        sender: out_tx,
        reply: reply_tx,
    };
    if server_tx.send(accepted).is_err() {
        return;
    }

    let Ok(Some(client_id)) = reply_rx.await else {
        // Refused: the writer flushes the refusal and exits
        let _ = writer.await;
        return;
    };

    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if server_tx.send(ServerEvent::Frame { client_id, text }).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Client {} read error: {}", client_id, e);
                break;
            }
        }
    }

    let _ = server_tx.send(ServerEvent::Disconnected { client_id });
}
