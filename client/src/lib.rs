//! # Table Client Library
//!
//! This library provides the viewer side of the shared tabletop. It keeps a
//! local mirror of the server's table state up to date and caches the images
//! that state refers to, so a display layer only ever reads local data.
//!
//! ## Architecture Overview
//!
//! ### Mirror, Not Replica
//! The client never edits its mirror. Every `server_state` message replaces
//! the mirrored state as a whole, and edits made by the viewer travel to the
//! server as `move_token` or `reveal_area` messages and come back through the
//! next broadcast like everyone else's.
//!
//! ### Resilient Connection
//! The sync agent reconnects after a fixed delay whenever the connection
//! fails or drops, indefinitely. The last mirrored state stays readable in
//! the meantime.
//!
//! ### Lazy Asset Cache
//! Map and token images are fetched over HTTP the first time a state
//! references them and kept on disk. Fetches run in the background and never
//! hold up state updates.
//!
//! ## Module Organization
//!
//! ### Mirror Module (`mirror`)
//! The shared, revisioned copy of the last received state and the
//! connection status.
//!
//! ### Assets Module (`assets`)
//! The on-disk image cache with per-path fetch deduplication.
//!
//! ### Network Module (`network`)
//! The background sync agent and the handle used to query and stop it.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{AgentConfig, SyncAgent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let agent = SyncAgent::spawn(AgentConfig::default())?;
//!
//!     // Read whatever the server last sent
//!     if let Some(scene) = agent.snapshot().active_scene() {
//!         println!("{} tokens on {}", scene.tokens.len(), scene.id);
//!     }
//!
//!     agent.move_token("goblin1", 120, 80)?;
//!     agent.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod assets;
pub mod mirror;
pub mod network;
