//! # Flag Sync Client Library
//!
//! This library provides the client-side synchronisation core for the shared
//! flag world. It keeps a local mirror of every known flag and player, lets
//! the local player act on it immediately, and reconciles those optimistic
//! changes with what the authoritative server later reports.
//!
//! ## Architecture Overview
//!
//! Presentation code calls the [`SyncClient`] facade. The facade mutates the
//! flag store optimistically and hands a command to the connection session,
//! which transmits it or queues it until the handshake completes. Server
//! responses arrive as `{type, data}` envelopes, are dispatched by the
//! message router and reconciled into the store, and every resulting change
//! is published as a [`SyncEvent`].
//!
//! ### Optimistic Placement
//! A new flag enters the store as *provisional* the moment it is placed. When
//! the server confirms, the matching provisional record (same owner, within
//! the reconcile tolerance, most recent first) is swapped for the
//! authoritative one. Placements inside another owner's territory are
//! rejected locally without a round trip.
//!
//! ### Connection Lifecycle
//! The session walks `Disconnected → Connecting → Connected → Authenticating
//! → Authenticated`. Abnormal closes are retried with bounded exponential
//! backoff; a clean `disconnect()` or a server-forced disconnect is final.
//!
//! ## Module Organization
//!
//! ### Session Module (`session`)
//! - Connection state machine and handshake
//! - Ordered outbound queue flushed on authentication
//! - Reconnect planning with [`BackoffPolicy`]
//!
//! ### Flags Module (`flags`)
//! - Provisional and authoritative flag records
//! - Territory pre-checks and ownership gates
//! - Reconciliation of confirmations and remote broadcasts
//!
//! ### Router and Events (`router`, `events`)
//! - Envelope parsing and typed handler dispatch
//! - Closed set of event kinds with observer registration
//!
//! ### Runtime Module (`runtime`)
//! - Tokio task driving a [`SyncClient`] over a WebSocket
//! - Command channel in, event channel out
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::{spawn_client, ClientCommand, ClientConfig, Credentials};
//! use shared::{PlaceOptions, Position};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ClientConfig::new("ws://127.0.0.1:8080");
//!     let mut handle = spawn_client(config, Credentials::new("alice", "Alice"));
//!
//!     handle.send(ClientCommand::Place {
//!         position: Position::new(59.3293, 18.0686),
//!         options: PlaceOptions::default(),
//!     });
//!
//!     while let Some(event) = handle.next_event().await {
//!         println!("{:?}", event);
//!     }
//! }
//! ```
//!
//! ## Design Philosophy
//!
//! ### Single Logical Thread
//! All state lives in one [`SyncClient`] value driven from one task. Handlers
//! run to completion and never interleave, so no locks are needed.
//!
//! ### Bad Input Never Kills the Session
//! Malformed or unknown server messages are logged and dropped. Transport
//! failures surface only as connection state changes.

pub mod config;
pub mod error;
pub mod events;
pub mod flags;
pub mod router;
pub mod runtime;
pub mod session;
pub mod sync;

pub use config::{BackoffPolicy, ClientConfig, Credentials};
pub use error::{FlagError, RouteError, SessionError};
pub use events::{EventBus, EventKind, SyncEvent};
pub use flags::FlagStore;
pub use router::{Dispatch, MessageRouter};
pub use runtime::{spawn_client, ClientCommand, ClientHandle};
pub use session::{CloseReason, ConnectionSession, ConnectionState, ReconnectPlan, Transport};
pub use sync::{ConnectOutcome, SyncClient};
