//! # Lobby Server Library
//!
//! This library provides the authoritative server for a location-based
//! elimination game. It manages game lobbies, walks them through the
//! match lifecycle, resolves combat scans, and broadcasts every state
//! change to the players and spectators joined to the lobby's room.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative State
//! The server owns the definitive lobby and combat state. Clients only
//! ever send requests (join, ready, scan, forfeit) and render what the
//! server pushes back; health, scores, phases, and rankings are never
//! computed client-side.
//!
//! ### Session Management
//! Handles the complete lifecycle of client connections including:
//! - Registration and session id assignment
//! - Liveness tracking and timeout cleanup
//! - Lobby membership bookkeeping
//! - Disconnection handling with host reassignment
//!
//! ### Match Lifecycle
//! Each lobby moves through waiting, starting (a cancellable 5-second
//! countdown), tag assignment, active play, and finished. The state
//! machine is the single authority on transitions; requests that are
//! invalid for the current phase are rejected or ignored, never fatal.
//!
//! ## Architecture Design
//!
//! ### Single-Owner Event Loop
//! All lobby mutations are processed sequentially by one event loop,
//! which eliminates races on health, score, and phase fields without
//! per-field locking. Networking and timers run as separate tasks that
//! communicate with the loop over channels.
//!
//! ### UDP-Based Communication
//! Uses UDP sockets carrying bincode-serialized packets. Requests that
//! need a reply are acknowledged directly to the requester's address;
//! room events fan out to every member of the lobby through a dedicated
//! sender task.
//!
//! ### Cancellable Timers
//! Countdown and game timers are per-lobby background tasks guarded by
//! an epoch counter. Cancelling a timer bumps the epoch, so a tick that
//! was already in flight is recognized as stale and discarded instead
//! of firing a transition for a dead timer.
//!
//! ## Module Organization
//!
//! ### Session Module (`session`)
//! Tracks connected clients and their lobby membership:
//! - Session registration and address-based lookup
//! - Activity timestamps and timeout sweeps
//! - Capacity enforcement
//!
//! ### Lobby Module (`lobby`)
//! The lobby store and lifecycle state machine:
//! - Lobby creation with collision-checked six-character codes
//! - Ready aggregation, countdown, tag assignment, match window
//! - Host reassignment and empty-lobby garbage collection
//!
//! ### Combat Module (`combat`)
//! Scan resolution and scoring:
//! - Hit validation, damage application, elimination detection
//! - Score-gated power-up claims with timed effects
//! - Forfeits and final ranking computation
//!
//! ### Network Module (`network`)
//! The gateway between sockets and game state:
//! - Datagram decoding and per-request dispatch
//! - Direct acknowledgements and room broadcasts
//! - Countdown, game-timer, and power-up expiry scheduling
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Bind the lobby server with a 30 second session timeout and
//!     // room for 256 concurrent sessions.
//!     let mut server = Server::new(
//!         "127.0.0.1:8080",
//!         Duration::from_secs(30),
//!         256
//!     ).await?;
//!
//!     // Run the event loop: decode requests, mutate lobbies, and
//!     // broadcast state diffs until shutdown.
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod combat;
pub mod lobby;
pub mod network;
pub mod session;
