//! Local read-only copy of the server's table state
//!
//! The sync agent is the only writer. Each `server_state` message replaces
//! the mirrored state as a whole and bumps a revision counter, so a reader
//! polling [`Mirror::revision`] can tell when to redraw and never observes a
//! half-applied update. The last state survives disconnects.

use shared::{SceneView, ServerState};
use std::sync::{PoisonError, RwLock};

/// Connection status of the sync agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Consistent copy of everything a viewer needs to draw one frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorSnapshot {
    /// Number of states applied so far, zero before the first one
    pub revision: u64,
    pub state: ServerState,
    pub connection: ConnectionState,
}

impl MirrorSnapshot {
    pub fn active_scene(&self) -> Option<&SceneView> {
        self.state.scene.as_ref()
    }
}

#[derive(Debug, Default)]
pub struct Mirror {
    inner: RwLock<MirrorSnapshot>,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the mirrored state and returns the new revision
    pub(crate) fn apply(&self, state: ServerState) -> u64 {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.state = state;
        inner.revision += 1;
        inner.revision
    }

    pub fn snapshot(&self) -> MirrorSnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn revision(&self) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .revision
    }

    pub fn active_scene(&self) -> Option<SceneView> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            .scene
            .clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .connection
    }

    pub(crate) fn set_connection_state(&self, connection: ConnectionState) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .connection = connection;
    }
}
