//! Connection lifecycle: handshake, outbound buffering and reconnect backoff
//!
//! The session never performs I/O on its own. A driver (see `runtime`) opens
//! the physical connection and reports the outcome back; the session decides
//! what state that puts us in, what gets transmitted and whether, and when,
//! a reconnect should be attempted. Everything it wants to send goes through
//! the [`Transport`] handed to it once the connection is open.

use crate::config::{BackoffPolicy, Credentials};
use crate::error::SessionError;
use log::{debug, error, info, warn};
use shared::{AuthenticatePayload, ClientMessage, ALREADY_AUTHENTICATED, CLIENT_DISCONNECT_REASON};
use std::collections::VecDeque;
use std::time::Duration;

/// Outbound half of an open connection
pub trait Transport: Send {
    /// Hands one encoded envelope to the wire
    fn transmit(&mut self, frame: String) -> Result<(), SessionError>;

    /// Closes the connection with the given reason
    fn close(&mut self, reason: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
}

impl ConnectionState {
    /// True while a physical connection is up
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::Authenticating
                | ConnectionState::Authenticated
        )
    }
}

/// Why a connection went away
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// We asked for it; never retried
    ClientRequested,
    /// The server kicked us; not retried without an explicit `connect`
    Forced(String),
    /// Anything else: dropped sockets, server restarts, protocol errors
    Abnormal(String),
}

impl CloseReason {
    /// Classifies the reason text of a close frame
    pub fn from_close_frame(reason: &str) -> Self {
        if reason == CLIENT_DISCONNECT_REASON {
            CloseReason::ClientRequested
        } else if reason.is_empty() {
            CloseReason::Abnormal("closed by peer".to_string())
        } else {
            CloseReason::Abnormal(reason.to_string())
        }
    }
}

/// What happens after a connection attempt failed or a connection was lost
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconnectPlan {
    RetryIn { attempt: u32, delay: Duration },
    /// Intentional teardown; nothing scheduled
    Stopped,
    /// `max_attempts` consecutive failures
    GaveUp,
}

impl ReconnectPlan {
    /// True when the session is finished rather than waiting to retry
    pub fn is_teardown(&self) -> bool {
        !matches!(self, ReconnectPlan::RetryIn { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// True for the server's "already authenticated" rejection
pub fn is_already_authenticated(message: &str) -> bool {
    message
        .to_ascii_lowercase()
        .contains(&ALREADY_AUTHENTICATED.to_ascii_lowercase())
}

/// Owns one physical connection and the commands waiting to go out on it
pub struct ConnectionSession<T: Transport> {
    backoff: BackoffPolicy,
    state: ConnectionState,
    transport: Option<T>,
    outbound: VecDeque<ClientMessage>,
    credentials: Option<Credentials>,
    player_id: Option<String>,
    attempts: u32,
    retry_pending: bool,
    changes: Vec<StateChange>,
}

impl<T: Transport> ConnectionSession<T> {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            backoff,
            state: ConnectionState::Disconnected,
            transport: None,
            outbound: VecDeque::new(),
            credentials: None,
            player_id: None,
            attempts: 0,
            retry_pending: false,
            changes: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Authenticated
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// Server-confirmed player id of the current (or last) session
    pub fn player_id(&self) -> Option<&str> {
        self.player_id.as_deref()
    }

    pub fn queued_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    /// Drains the transitions recorded since the last call
    pub fn take_state_changes(&mut self) -> Vec<StateChange> {
        std::mem::take(&mut self.changes)
    }

    fn set_state(&mut self, to: ConnectionState) {
        if self.state == to {
            return;
        }
        info!("Connection state: {:?} -> {:?}", self.state, to);
        self.changes.push(StateChange {
            from: self.state,
            to,
        });
        self.state = to;
    }

    /// Starts an explicit connection attempt, clearing any earlier retry budget
    ///
    /// Returns false if a connection is already open or being opened.
    pub fn begin_connect(&mut self) -> bool {
        if self.state != ConnectionState::Disconnected {
            debug!("Connect ignored while {:?}", self.state);
            return false;
        }
        self.attempts = 0;
        self.retry_pending = false;
        self.set_state(ConnectionState::Connecting);
        true
    }

    /// Starts the reconnect attempt scheduled by the last [`ReconnectPlan`]
    pub fn begin_reconnect(&mut self) -> bool {
        if !self.retry_pending || self.state != ConnectionState::Disconnected {
            debug!("No reconnect pending");
            return false;
        }
        self.retry_pending = false;
        info!("Reconnect attempt {}/{}", self.attempts, self.backoff.max_attempts);
        self.set_state(ConnectionState::Connecting);
        true
    }

    /// The driver opened the physical connection
    ///
    /// Resets the backoff and, if credentials are stored, starts the
    /// handshake. A transport arriving after the attempt was abandoned is
    /// closed again and rejected.
    pub fn connection_established(&mut self, mut transport: T) -> bool {
        if self.state != ConnectionState::Connecting {
            warn!("Discarding connection opened while {:?}", self.state);
            transport.close(CLIENT_DISCONNECT_REASON);
            return false;
        }

        self.transport = Some(transport);
        self.attempts = 0;
        self.retry_pending = false;
        self.set_state(ConnectionState::Connected);

        if self.credentials.is_some() {
            self.send_handshake();
        }
        true
    }

    /// The driver could not open the connection
    pub fn connection_failed(&mut self, err: &SessionError) -> ReconnectPlan {
        if self.state != ConnectionState::Connecting {
            debug!("Ignoring connect failure while {:?}: {}", self.state, err);
            return ReconnectPlan::Stopped;
        }
        warn!("Connection attempt failed: {}", err);
        self.set_state(ConnectionState::Disconnected);
        self.plan_retry()
    }

    /// The open connection went away
    pub fn connection_lost(&mut self, reason: CloseReason) -> ReconnectPlan {
        if self.transport.is_none() && self.state == ConnectionState::Disconnected {
            debug!("Close after teardown ignored: {:?}", reason);
            return ReconnectPlan::Stopped;
        }

        self.transport = None;
        self.set_state(ConnectionState::Disconnected);

        match reason {
            CloseReason::ClientRequested => {
                info!("Connection closed by client");
                self.teardown();
                ReconnectPlan::Stopped
            }
            CloseReason::Forced(reason) => {
                warn!("Connection closed by server: {}", reason);
                self.teardown();
                ReconnectPlan::Stopped
            }
            CloseReason::Abnormal(reason) => {
                warn!("Connection lost: {}", reason);
                self.plan_retry()
            }
        }
    }

    fn plan_retry(&mut self) -> ReconnectPlan {
        self.attempts += 1;
        if self.attempts > self.backoff.max_attempts {
            error!(
                "Giving up after {} reconnect attempts",
                self.backoff.max_attempts
            );
            self.teardown();
            return ReconnectPlan::GaveUp;
        }

        let delay = self.backoff.delay_for(self.attempts);
        self.retry_pending = true;
        info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay, self.attempts, self.backoff.max_attempts
        );
        ReconnectPlan::RetryIn {
            attempt: self.attempts,
            delay,
        }
    }

    fn teardown(&mut self) {
        self.retry_pending = false;
        if !self.outbound.is_empty() {
            debug!("Dropping {} queued commands", self.outbound.len());
            self.outbound.clear();
        }
    }

    /// Stores credentials and starts the handshake if the connection is open
    ///
    /// A no-op while a handshake is in flight or already done, so calling it
    /// twice never sends two handshakes. Returns true if a handshake was sent.
    pub fn authenticate(&mut self, credentials: Credentials) -> bool {
        match self.state {
            ConnectionState::Authenticating | ConnectionState::Authenticated => {
                info!(
                    "Authenticate for {} ignored while {:?}",
                    credentials.player_id, self.state
                );
                false
            }
            ConnectionState::Connected => {
                self.credentials = Some(credentials);
                self.send_handshake()
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                debug!(
                    "Stored credentials for {}; handshake follows connect",
                    credentials.player_id
                );
                self.credentials = Some(credentials);
                false
            }
        }
    }

    fn send_handshake(&mut self) -> bool {
        let Some(credentials) = self.credentials.clone() else {
            return false;
        };

        self.set_state(ConnectionState::Authenticating);
        let handshake = ClientMessage::Authenticate(AuthenticatePayload {
            player_id: credentials.player_id,
            username: credentials.username,
            token: credentials.token,
        });

        match self.transmit(&handshake) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to send handshake: {}", e);
                false
            }
        }
    }

    /// The server accepted the handshake; flushes everything queued so far
    pub fn mark_authenticated(&mut self, player_id: impl Into<String>) {
        if !self.state.is_open() {
            warn!("Authentication confirmed without an open connection");
            return;
        }
        self.player_id = Some(player_id.into());
        if self.state == ConnectionState::Authenticated {
            return;
        }
        self.set_state(ConnectionState::Authenticated);
        self.drain_outbound();
    }

    /// The server refused the handshake for a reason other than "already
    /// authenticated"; stored credentials are dropped
    pub fn authentication_rejected(&mut self, message: &str) {
        if self.state != ConnectionState::Authenticating {
            return;
        }
        error!("Authentication rejected: {}", message);
        self.credentials = None;
        self.set_state(ConnectionState::Connected);
    }

    /// Transmits `message` now if the session allows it, otherwise queues it
    ///
    /// Returns true only when the message went out immediately.
    pub fn send(&mut self, message: ClientMessage) -> bool {
        if let ClientMessage::Authenticate(payload) = message {
            let credentials = Credentials {
                player_id: payload.player_id,
                username: payload.username,
                token: payload.token,
            };
            return self.authenticate(credentials);
        }

        if self.state != ConnectionState::Authenticated {
            debug!(
                "Queued {} while {:?} ({} waiting)",
                message.message_type(),
                self.state,
                self.outbound.len() + 1
            );
            self.outbound.push_back(message);
            return false;
        }

        match self.transmit(&message) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to send {}: {}", message.message_type(), e);
                self.outbound.push_back(message);
                false
            }
        }
    }

    fn transmit(&mut self, message: &ClientMessage) -> Result<(), SessionError> {
        let transport = self.transport.as_mut().ok_or(SessionError::Closed)?;
        let frame = serde_json::to_string(message)?;
        transport.transmit(frame)
    }

    fn drain_outbound(&mut self) {
        if self.outbound.is_empty() {
            return;
        }
        info!("Flushing {} queued commands", self.outbound.len());

        while let Some(message) = self.outbound.pop_front() {
            if let Err(e) = self.transmit(&message) {
                error!("Flush stopped at {}: {}", message.message_type(), e);
                self.outbound.push_front(message);
                break;
            }
        }
    }

    /// Clean shutdown; never followed by a reconnect
    pub fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close(CLIENT_DISCONNECT_REASON);
        }
        self.teardown();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Server-initiated shutdown; terminal until the next explicit connect
    pub fn force_disconnect(&mut self, reason: &str) {
        warn!("Forced disconnect: {}", reason);
        if let Some(mut transport) = self.transport.take() {
            transport.close(reason);
        }
        self.teardown();
        self.set_state(ConnectionState::Disconnected);
    }
}
