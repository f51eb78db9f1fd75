//! # Table Server Library
//!
//! This library provides the authoritative server for a shared tabletop. It
//! owns the canonical scene state, applies viewer edits, and pushes the
//! resulting state to every connected viewer so all screens show the same
//! table.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative State
//! The server holds the only writable copy of the table: scenes, their map
//! images, tokens and revealed areas. Viewers keep mirrors that are replaced
//! wholesale by each broadcast and never merge edits of their own.
//!
//! ### Connection Management
//! Handles the lifecycle of viewer connections:
//! - Registration on websocket upgrade, with the current state as first frame
//! - Dispatch of inbound `move_token` and `reveal_area` messages
//! - Removal on close or transport error
//!
//! ### State Broadcasting
//! After every applied change the full active-scene state is sent to every
//! viewer. Broadcasts are serialized so the last frame a viewer receives is
//! always the latest committed state.
//!
//! ## Module Organization
//!
//! ### Store Module (`store`)
//! The scene registry and its invariants, with atomic operations and
//! whole-file JSON persistence.
//!
//! ### Connections Module (`connections`)
//! The set of live connections and concurrent fan-out delivery.
//!
//! ### Broadcast Module (`broadcast`)
//! Ordered state broadcasts and initial snapshots for new connections.
//!
//! ### Network Module (`network`)
//! The axum router: the `/ws` endpoint, static `/assets` and the admin
//! routes from the `admin` module.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(ServerConfig::default()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod broadcast;
pub mod connections;
pub mod error;
pub mod network;
pub mod store;
