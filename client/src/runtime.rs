//! Tokio driver connecting a [`SyncClient`] to a WebSocket server
//!
//! One task owns the client and is the only place it is touched. It
//! multiplexes three inputs with `tokio::select!`: commands from the
//! [`ClientHandle`], network events from the current connection task, and
//! the reconnect timer armed from the session's [`ReconnectPlan`]s.
//!
//! Each connection attempt gets an id. Events tagged with an older id are
//! ignored, so a socket that was abandoned (after `disconnect`, say) cannot
//! disturb the session that replaced it.

use crate::config::{ClientConfig, Credentials};
use crate::error::SessionError;
use crate::events::SyncEvent;
use crate::session::{CloseReason, ReconnectPlan, Transport};
use crate::sync::SyncClient;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{AreaFilter, Flag, PlaceOptions, Position};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Requests accepted by the driver task
#[derive(Debug)]
pub enum ClientCommand {
    Place {
        position: Position,
        options: PlaceOptions,
    },
    Remove(String),
    Harden(String),
    Teleport(String),
    Move(Position),
    RequestFlags(AreaFilter),
    RequestPlayers(AreaFilter),
    /// Snapshot of every flag currently in the store
    QueryFlags(oneshot::Sender<Vec<Flag>>),
    /// Flags within `radius_m` meters of `center`, nearest first
    QueryNear {
        center: Position,
        radius_m: f64,
        reply: oneshot::Sender<Vec<Flag>>,
    },
    Connect,
    Disconnect,
    Shutdown,
}

/// Outbound half of a WebSocket connection, fed to its writer task
pub struct WsTransport {
    tx: mpsc::UnboundedSender<Message>,
}

impl Transport for WsTransport {
    fn transmit(&mut self, frame: String) -> Result<(), SessionError> {
        self.tx
            .send(Message::Text(frame))
            .map_err(|_| SessionError::Closed)
    }

    fn close(&mut self, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_string().into(),
        };
        if self.tx.send(Message::Close(Some(frame))).is_err() {
            debug!("Close requested on a finished connection");
        }
    }
}

enum NetEvent {
    Opened { conn: u64, transport: WsTransport },
    Frame { conn: u64, text: String },
    Closed { conn: u64, reason: CloseReason },
    Failed { conn: u64, error: SessionError },
}

impl NetEvent {
    fn conn(&self) -> u64 {
        match self {
            NetEvent::Opened { conn, .. }
            | NetEvent::Frame { conn, .. }
            | NetEvent::Closed { conn, .. }
            | NetEvent::Failed { conn, .. } => *conn,
        }
    }
}

/// Opens one WebSocket and pumps it until it closes
async fn run_connection(conn: u64, url: String, events: mpsc::UnboundedSender<NetEvent>) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            let _ = events.send(NetEvent::Failed {
                conn,
                error: SessionError::Transport(e.to_string()),
            });
            return;
        }
    };

    let (mut sink, mut source) = stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    // Ends once the transport is dropped or after sending a close frame
    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                debug!("Connection {} writer stopped: {}", conn, e);
                break;
            }
            if closing {
                break;
            }
        }
    });

    let opened = NetEvent::Opened {
        conn,
        transport: WsTransport { tx: out_tx },
    };
    if events.send(opened).is_err() {
        return;
    }

    let reason = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                if events.send(NetEvent::Frame { conn, text }).is_err() {
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => CloseReason::from_close_frame(&frame.reason),
                    None => CloseReason::Abnormal("closed without reason".to_string()),
                };
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break CloseReason::Abnormal(e.to_string()),
            None => break CloseReason::Abnormal("connection reset".to_string()),
        }
    };

    let _ = events.send(NetEvent::Closed { conn, reason });
}

struct Driver {
    url: String,
    client: SyncClient<WsTransport>,
    net_tx: mpsc::UnboundedSender<NetEvent>,
    conn: u64,
}

impl Driver {
    fn spawn_connection(&mut self) {
        self.conn += 1;
        info!("Connecting to {} (connection {})", self.url, self.conn);
        tokio::spawn(run_connection(
            self.conn,
            self.url.clone(),
            self.net_tx.clone(),
        ));
    }

    fn connect(&mut self) {
        if self.client.begin_connect() {
            self.spawn_connection();
        }
    }

    fn disconnect(&mut self) {
        self.client.disconnect();
        // Anything still in flight belongs to a dead connection now
        self.conn += 1;
    }

    fn on_net_event(&mut self, event: NetEvent) -> Option<ReconnectPlan> {
        if event.conn() != self.conn {
            debug!("Ignoring event from stale connection {}", event.conn());
            if let NetEvent::Opened { mut transport, .. } = event {
                transport.close(shared::CLIENT_DISCONNECT_REASON);
            }
            return None;
        }

        match event {
            NetEvent::Opened { transport, .. } => {
                self.client.connection_established(transport);
                None
            }
            NetEvent::Frame { text, .. } => {
                self.client.handle_frame(&text);
                None
            }
            NetEvent::Closed { reason, .. } => Some(self.client.connection_lost(reason)),
            NetEvent::Failed { error, .. } => Some(self.client.connection_failed(&error)),
        }
    }

    fn on_command(&mut self, command: ClientCommand) {
        let outcome = match command {
            ClientCommand::Place { position, options } => {
                self.client.place_flag(position, options).map(|id| {
                    debug!("Placed provisional flag {}", id);
                })
            }
            ClientCommand::Remove(flag_id) => self.client.remove_flag(&flag_id),
            ClientCommand::Harden(flag_id) => self.client.harden_flag(&flag_id),
            ClientCommand::Teleport(flag_id) => self.client.teleport_to_flag(&flag_id),
            ClientCommand::Move(position) => {
                self.client.move_to(position);
                Ok(())
            }
            ClientCommand::RequestFlags(filter) => {
                self.client.request_flags(filter);
                Ok(())
            }
            ClientCommand::RequestPlayers(filter) => {
                self.client.request_players(filter);
                Ok(())
            }
            ClientCommand::QueryFlags(reply) => {
                let flags = self.client.all_flags().into_iter().cloned().collect();
                if reply.send(flags).is_err() {
                    debug!("Flag query dropped by caller");
                }
                Ok(())
            }
            ClientCommand::QueryNear {
                center,
                radius_m,
                reply,
            } => {
                let flags = self
                    .client
                    .flags_within_radius(&center, radius_m)
                    .into_iter()
                    .cloned()
                    .collect();
                if reply.send(flags).is_err() {
                    debug!("Radius query dropped by caller");
                }
                Ok(())
            }
            ClientCommand::Connect => {
                self.connect();
                Ok(())
            }
            ClientCommand::Disconnect => {
                self.disconnect();
                Ok(())
            }
            ClientCommand::Shutdown => Ok(()),
        };

        if let Err(e) = outcome {
            debug!("Command not sent: {}", e);
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ClientCommand>,
        mut net_rx: mpsc::UnboundedReceiver<NetEvent>,
    ) {
        self.connect();

        let retry = sleep(Duration::ZERO);
        tokio::pin!(retry);
        let mut armed = false;

        loop {
            tokio::select! {
                Some(event) = net_rx.recv() => {
                    match self.on_net_event(event) {
                        Some(ReconnectPlan::RetryIn { attempt, delay }) => {
                            debug!("Reconnect attempt {} armed for {:?}", attempt, delay);
                            retry.as_mut().reset(Instant::now() + delay);
                            armed = true;
                        }
                        Some(ReconnectPlan::GaveUp) => {
                            error!("Server unreachable; waiting for an explicit connect");
                            armed = false;
                        }
                        Some(ReconnectPlan::Stopped) | None => {}
                    }
                }

                command = commands.recv() => {
                    match command {
                        None | Some(ClientCommand::Shutdown) => {
                            info!("Client shutting down");
                            self.disconnect();
                            break;
                        }
                        Some(command) => {
                            // An explicit connect or disconnect supersedes a pending retry
                            if matches!(command, ClientCommand::Connect | ClientCommand::Disconnect) {
                                armed = false;
                            }
                            self.on_command(command);
                        }
                    }
                }

                _ = &mut retry, if armed => {
                    armed = false;
                    if self.client.begin_reconnect() {
                        self.spawn_connection();
                    }
                }
            }
        }
    }
}

/// Handle to a client running on its own task
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<ClientCommand>,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    /// Queues a command; false if the driver has stopped
    pub fn send(&self, command: ClientCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    /// Current contents of the flag store
    pub async fn flags(&self) -> Option<Vec<Flag>> {
        let (reply, response) = oneshot::channel();
        if !self.send(ClientCommand::QueryFlags(reply)) {
            return None;
        }
        response.await.ok()
    }

    /// Flags within `radius_m` meters of `center`, nearest first
    pub async fn flags_near(&self, center: Position, radius_m: f64) -> Option<Vec<Flag>> {
        let (reply, response) = oneshot::channel();
        if !self.send(ClientCommand::QueryNear {
            center,
            radius_m,
            reply,
        }) {
            return None;
        }
        response.await.ok()
    }

    /// Disconnects cleanly and waits for the driver task to finish
    pub async fn shutdown(self) {
        if !self.send(ClientCommand::Shutdown) {
            warn!("Client task already stopped");
        }
        if let Err(e) = self.task.await {
            error!("Client task failed: {}", e);
        }
    }
}

/// Spawns the driver task and connects immediately
///
/// Must be called from within a tokio runtime.
pub fn spawn_client(config: ClientConfig, credentials: Credentials) -> ClientHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (net_tx, net_rx) = mpsc::unbounded_channel();

    let mut client = SyncClient::new(&config);
    client.subscribe_all(move |event| {
        let _ = event_tx.send(event.clone());
    });
    client.authenticate(credentials);

    let driver = Driver {
        url: config.server_url.clone(),
        client,
        net_tx,
        conn: 0,
    };
    let task = tokio::spawn(driver.run(command_rx, net_rx));

    ClientHandle {
        commands: command_tx,
        events: event_rx,
        task,
    }
}
