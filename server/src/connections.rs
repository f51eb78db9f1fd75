//! Live connection tracking and fan-out delivery
//!
//! This module keeps the set of connected table clients and delivers text
//! frames to them:
//! - Connection lifecycle (register on upgrade, unregister on disconnect)
//! - Concurrent delivery of one payload to every member
//! - Per-member write serialization so frames never interleave
//!
//! The registry is generic over the outbound sink so the delivery logic can be
//! exercised with in-memory channels as well as real websocket halves.

use axum::extract::ws::{Message, Utf8Bytes};
use futures::future::join_all;
use futures::{Sink, SinkExt};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Server-assigned identifier for one live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Tally of a single fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
    #[error("send to connection {id} failed: {reason}")]
    Failed { id: ConnectionId, reason: String },
}

/// One registered connection
///
/// The sink sits behind its own lock so that a broadcast and a direct send
/// to the same member are written one after the other.
struct Member<S> {
    addr: SocketAddr,
    sink: Arc<Mutex<S>>,
}

/// Set of live connections keyed by [`ConnectionId`]
///
/// Membership changes hold the map lock only briefly. Broadcasts copy the
/// member list and then send with the lock released, so a slow client never
/// blocks registration or removal of others.
pub struct ConnectionRegistry<S> {
    members: Mutex<HashMap<ConnectionId, Member<S>>>,
    next_id: AtomicU64,
}

impl<S> Default for ConnectionRegistry<S> {
    fn default() -> Self {
        Self {
            members: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<S> ConnectionRegistry<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: fmt::Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection and returns the id it is tracked under
    pub async fn register(&self, addr: SocketAddr, sink: S) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut members = self.members.lock().await;
        members.insert(
            id,
            Member {
                addr,
                sink: Arc::new(Mutex::new(sink)),
            },
        );
        info!(
            "Connection {} registered from {} ({} total)",
            id,
            addr,
            members.len()
        );
        id
    }

    /// Removes a connection. Removing an id twice is harmless.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let mut members = self.members.lock().await;
        match members.remove(&id) {
            Some(member) => {
                info!(
                    "Connection {} from {} removed ({} remaining)",
                    id,
                    member.addr,
                    members.len()
                );
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.lock().await.is_empty()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.members.lock().await.contains_key(&id)
    }

    /// Returns every live connection with its peer address
    pub async fn members(&self) -> Vec<(ConnectionId, SocketAddr)> {
        let members = self.members.lock().await;
        let mut list: Vec<_> = members.iter().map(|(id, m)| (*id, m.addr)).collect();
        list.sort_unstable_by_key(|(id, _)| *id);
        list
    }

    /// Sends a text frame to a single connection
    pub async fn send_to(&self, id: ConnectionId, payload: &str) -> Result<(), SendError> {
        let sink = {
            let members = self.members.lock().await;
            members
                .get(&id)
                .map(|m| Arc::clone(&m.sink))
                .ok_or(SendError::UnknownConnection(id))?
        };

        let mut sink = sink.lock().await;
        sink.send(Message::Text(Utf8Bytes::from(payload)))
            .await
            .map_err(|e| SendError::Failed {
                id,
                reason: e.to_string(),
            })
    }

    /// Sends a text frame to every connection concurrently
    ///
    /// Members that fail to receive are counted and logged but stay
    /// registered; their own connection task removes them once the socket
    /// reports the disconnect.
    pub async fn broadcast(&self, payload: &str) -> BroadcastReport {
        let targets: Vec<(ConnectionId, Arc<Mutex<S>>)> = {
            let members = self.members.lock().await;
            members
                .iter()
                .map(|(id, m)| (*id, Arc::clone(&m.sink)))
                .collect()
        };

        let text = Utf8Bytes::from(payload);
        let sends = targets.into_iter().map(|(id, sink)| {
            let text = text.clone();
            async move {
                let mut sink = sink.lock().await;
                let result = sink.send(Message::Text(text)).await;
                (id, result.map_err(|e| e.to_string()))
            }
        });

        let mut report = BroadcastReport::default();
        for (id, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Broadcast to connection {} failed: {}", id, e);
                    report.failed += 1;
                }
            }
        }

        debug!(
            "Broadcast {} bytes: {} delivered, {} failed",
            payload.len(),
            report.delivered,
            report.failed
        );
        report
    }
}
