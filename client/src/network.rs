//! Websocket sync agent keeping the local mirror current
//!
//! The agent runs as a background task:
//! - Connects to the server and retries after a fixed delay, forever
//! - Replaces the mirror with every `server_state` it receives
//! - Fetches missing map and token images without blocking the connection
//! - Forwards outbound viewer messages while connected
//!
//! It stops when [`AgentHandle::shutdown`] is called or the handle is dropped.

use crate::assets::{AssetCache, AssetError, FetchOutcome};
use crate::mirror::{ConnectionState, Mirror, MirrorSnapshot};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::{ClientMessage, ServerMessage, DEFAULT_PORT, WS_PATH};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub server_url: String,
    /// Origin assets are requested from, without the `/assets` suffix
    pub asset_origin: String,
    pub cache_dir: PathBuf,
    pub reconnect_delay: Duration,
    pub fetch_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: format!("ws://127.0.0.1:{}{}", DEFAULT_PORT, WS_PATH),
            asset_origin: format!("http://127.0.0.1:{}", DEFAULT_PORT),
            cache_dir: PathBuf::from("cache"),
            reconnect_delay: Duration::from_secs(2),
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Assets(#[from] AssetError),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("sync agent has stopped")]
    Stopped,
}

enum SessionEnd {
    Lost,
    Shutdown,
}

pub struct SyncAgent {
    config: AgentConfig,
    mirror: Arc<Mirror>,
    assets: Arc<AssetCache>,
    outbound: mpsc::UnboundedReceiver<String>,
    shutdown: watch::Receiver<bool>,
}

impl SyncAgent {
    /// Starts the agent on the current tokio runtime
    pub fn spawn(config: AgentConfig) -> Result<AgentHandle, AgentError> {
        let assets = Arc::new(AssetCache::new(
            config.cache_dir.clone(),
            config.asset_origin.clone(),
            config.fetch_timeout,
        )?);
        let mirror = Arc::new(Mirror::new());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let agent = SyncAgent {
            config,
            mirror: Arc::clone(&mirror),
            assets: Arc::clone(&assets),
            outbound: outbound_rx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(agent.run());

        Ok(AgentHandle {
            mirror,
            assets,
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            task: Some(task),
        })
    }

    async fn run(mut self) {
        loop {
            self.mirror
                .set_connection_state(ConnectionState::Connecting);
            info!("Connecting to {}", self.config.server_url);

            let connected = tokio::select! {
                result = connect_async(self.config.server_url.as_str()) => result,
                _ = stopped(&mut self.shutdown) => break,
            };

            match connected {
                Ok((ws, _)) => {
                    info!("Connected to {}", self.config.server_url);
                    self.mirror
                        .set_connection_state(ConnectionState::Connected);
                    if let SessionEnd::Shutdown = self.session(ws).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", self.config.server_url, e);
                }
            }

            self.mirror
                .set_connection_state(ConnectionState::Disconnected);
            info!("Reconnecting in {:?}", self.config.reconnect_delay);

            tokio::select! {
                _ = sleep(self.config.reconnect_delay) => {}
                _ = stopped(&mut self.shutdown) => break,
            }
        }

        self.mirror
            .set_connection_state(ConnectionState::Disconnected);
        info!("Sync agent stopped");
    }

    /// Drives one connection until it drops or the agent is stopped
    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let mut fetches: JoinSet<(String, Result<FetchOutcome, AssetError>)> = JoinSet::new();

        let end = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str(), &mut fetches),
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Server closed the connection");
                        break SessionEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Connection error: {}", e);
                        break SessionEnd::Lost;
                    }
                },
                outbound = self.outbound.recv() => match outbound {
                    Some(text) => {
                        if let Err(e) = sink.send(Message::Text(text.into())).await {
                            warn!("Failed to send message: {}", e);
                            break SessionEnd::Lost;
                        }
                    }
                    None => break SessionEnd::Shutdown,
                },
                Some(joined) = fetches.join_next(), if !fetches.is_empty() => match joined {
                    Ok((_, Ok(_))) => {}
                    Ok((rel, Err(e))) => warn!("Asset {} not cached: {}", rel, e),
                    Err(e) => debug!("Asset fetch task ended early: {}", e),
                },
                _ = stopped(&mut self.shutdown) => {
                    let _ = sink.send(Message::Close(None)).await;
                    break SessionEnd::Shutdown;
                }
            }
        };

        fetches.shutdown().await;
        end
    }

    fn handle_text(
        &self,
        text: &str,
        fetches: &mut JoinSet<(String, Result<FetchOutcome, AssetError>)>,
    ) {
        let state = match ServerMessage::parse(text) {
            Ok(ServerMessage::ServerState(state)) => state,
            Err(e) => {
                debug!("Ignoring message from server: {}", e);
                return;
            }
        };

        let refs = state
            .scene
            .as_ref()
            .map(|scene| scene.asset_refs())
            .unwrap_or_default();

        let revision = self.mirror.apply(state);
        debug!("Applied server state (revision {})", revision);

        for rel in refs {
            let assets = Arc::clone(&self.assets);
            fetches.spawn(async move {
                let result = assets.fetch(&rel).await;
                (rel, result)
            });
        }
    }
}

/// Resolves once a stop was requested or the handle is gone
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Owner-side handle of a running [`SyncAgent`]
pub struct AgentHandle {
    mirror: Arc<Mirror>,
    assets: Arc<AssetCache>,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl AgentHandle {
    pub fn mirror(&self) -> Arc<Mirror> {
        Arc::clone(&self.mirror)
    }

    pub fn snapshot(&self) -> MirrorSnapshot {
        self.mirror.snapshot()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.mirror.connection_state()
    }

    pub fn assets(&self) -> &AssetCache {
        &self.assets
    }

    /// Queues a message for the server. Messages queued while disconnected
    /// are sent once a connection is up.
    pub fn send(&self, message: &ClientMessage) -> Result<(), AgentError> {
        let text = message.to_json()?;
        self.outbound.send(text).map_err(|_| AgentError::Stopped)
    }

    pub fn move_token(&self, id: &str, x: i64, y: i64) -> Result<(), AgentError> {
        self.send(&ClientMessage::move_token(id, x, y))
    }

    pub fn reveal_area(&self, x: i64, y: i64, r: u32) -> Result<(), AgentError> {
        self.send(&ClientMessage::reveal_area(x, y, r))
    }

    /// Stops the agent and waits for its task to finish
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Sync agent task failed: {}", e);
            }
        }
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
