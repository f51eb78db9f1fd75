//! Ordered fan-out of the authoritative table state
//!
//! Every successful mutation ends with a call to
//! [`Broadcaster::broadcast_state`]. Broadcasts pass through a single gate and
//! read the store inside it, so each connection receives snapshots in the
//! order the gate was entered and the last one delivered always reflects the
//! latest committed state. Newly joined connections receive their first
//! snapshot through the same gate.

use crate::connections::{BroadcastReport, ConnectionId, ConnectionRegistry, SendError};
use crate::store::StateStore;
use axum::extract::ws::Message;
use futures::Sink;
use log::{debug, error};
use shared::ServerMessage;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::Mutex;

pub struct Broadcaster<S> {
    connections: ConnectionRegistry<S>,
    gate: Mutex<()>,
}

impl<S> Default for Broadcaster<S> {
    fn default() -> Self {
        Self {
            connections: ConnectionRegistry::default(),
            gate: Mutex::new(()),
        }
    }
}

impl<S> Broadcaster<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: fmt::Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections(&self) -> &ConnectionRegistry<S> {
        &self.connections
    }

    /// Registers a connection and sends it the current state as its first
    /// frame. If that send fails the connection is dropped again.
    pub async fn welcome(
        &self,
        store: &StateStore,
        addr: SocketAddr,
        sink: S,
    ) -> Result<ConnectionId, SendError> {
        let _gate = self.gate.lock().await;

        let id = self.connections.register(addr, sink).await;
        let Some(payload) = encode_state(store).await else {
            self.connections.unregister(id).await;
            return Err(SendError::Failed {
                id,
                reason: "state could not be encoded".to_string(),
            });
        };

        if let Err(e) = self.connections.send_to(id, &payload).await {
            self.connections.unregister(id).await;
            return Err(e);
        }

        debug!("Sent initial state to connection {} at {}", id, addr);
        Ok(id)
    }

    /// Sends the current state to every live connection
    pub async fn broadcast_state(&self, store: &StateStore) -> BroadcastReport {
        let _gate = self.gate.lock().await;

        match encode_state(store).await {
            Some(payload) => self.connections.broadcast(&payload).await,
            None => BroadcastReport::default(),
        }
    }

    pub async fn disconnect(&self, id: ConnectionId) -> bool {
        self.connections.unregister(id).await
    }
}

async fn encode_state(store: &StateStore) -> Option<String> {
    let message = ServerMessage::ServerState(store.server_state().await);
    match message.to_json() {
        Ok(payload) => Some(payload),
        Err(e) => {
            error!("Failed to encode server state: {}", e);
            None
        }
    }
}
