//! # Flag Server Library
//!
//! This library provides the authoritative reference server for the shared
//! flag world. It owns the canonical flags and player records, validates every
//! command clients send, and broadcasts the outcome so each client's local
//! mirror converges on the same state.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Rules
//! Clients pre-check territory and ownership to keep the interface snappy,
//! but only the server decides. Placements, removals, hardening and teleports
//! are applied here and the result is reported back as `{type, data}`
//! envelopes.
//!
//! ### Client Management
//! Handles the complete lifecycle of client connections including:
//! - Connection acceptance and capacity limits
//! - The authentication handshake and player binding
//! - Displacing an older connection when a player logs in again
//! - Disconnection handling and cleanup
//!
//! ## Architecture Design
//!
//! ### Single Event Loop
//! Each WebSocket is pumped by its own task, but all state lives in one
//! [`network::ServerState`] driven by a single loop. Connection tasks only
//! forward frames over a channel, so rule checks never race.
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! - Connection registry with per-connection outbound channels
//! - Player to connection binding
//! - Targeted sends and broadcasts
//!
//! ### World Module (`world`)
//! - Flags, players and resources
//! - Territory, ownership, hardening and toll rules
//!
//! ### Network Module (`network`)
//! - TCP accept loop and WebSocket upgrade
//! - Message parsing and dispatch into the world
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//! use server::world::WorldConfig;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let server = Server::bind("127.0.0.1:8080", WorldConfig::default(), 64).await?;
//!     server.run().await
//! }
//! ```

pub mod client_manager;
pub mod network;
pub mod world;
