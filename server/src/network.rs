//! Server network layer: websocket endpoint, asset serving and admin routes

use crate::admin;
use crate::broadcast::Broadcaster;
use crate::error::{ServerError, StoreError};
use crate::store::{Ignored, Outcome, StateStore};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::StreamExt;
use log::{debug, info, warn};
use shared::{ClientMessage, ProtocolError, RevealedArea, ASSETS_PATH, DEFAULT_PORT, WS_PATH};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;

/// Outbound half of an accepted websocket
pub type WsSink = SplitSink<WebSocket, Message>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// `None` keeps the table in memory only
    pub state_path: Option<PathBuf>,
    pub assets_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", DEFAULT_PORT),
            state_path: Some(PathBuf::from("table_state.json")),
            assets_dir: PathBuf::from("assets"),
        }
    }
}

/// Shared handles given to every request and socket task
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StateStore>,
    pub broadcaster: Arc<Broadcaster<WsSink>>,
}

impl AppState {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            broadcaster: Arc::new(Broadcaster::new()),
        }
    }
}

/// Table server bound to a listening socket
pub struct Server {
    listener: TcpListener,
    state: AppState,
    assets_dir: PathBuf,
}

impl Server {
    /// Loads the state file named in `config` and binds the listener.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let store = match &config.state_path {
            Some(path) => StateStore::open(path).await?,
            None => {
                info!("Running with in-memory state only");
                StateStore::in_memory()
            }
        };
        Self::with_store(config, Arc::new(store)).await
    }

    /// Binds the listener around an already loaded store.
    pub async fn with_store(config: ServerConfig, store: Arc<StateStore>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        info!(
            "Table server listening on {} (assets from {})",
            listener.local_addr()?,
            config.assets_dir.display()
        );

        Ok(Self {
            listener,
            state: AppState::new(store),
            assets_dir: config.assets_dir,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Serves until the process is stopped
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Serves until `shutdown` completes
    pub async fn run_until(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ServerError> {
        let app = router(self.state, &self.assets_dir);
        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await?;
        info!("Table server stopped");
        Ok(())
    }
}

pub fn router(state: AppState, assets_dir: &Path) -> Router {
    Router::new()
        .route(WS_PATH, get(ws_upgrade))
        .merge(admin::routes())
        .nest_service(ASSETS_PATH, ServeDir::new(assets_dir))
        .with_state(state)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
}

/// Runs one connection from upgrade to disconnect
///
/// The connection receives the current state first, then every inbound text
/// frame is applied to the store. Only applied messages trigger a broadcast.
async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: AppState) {
    let (sink, mut stream) = socket.split();

    let id = match state.broadcaster.welcome(&state.store, addr, sink).await {
        Ok(id) => id,
        Err(e) => {
            warn!("Dropping connection from {}: {}", addr, e);
            return;
        }
    };

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match dispatch(&state.store, text.as_str()).await {
                Outcome::Applied => {
                    state.broadcaster.broadcast_state(&state.store).await;
                }
                Outcome::Ignored(reason) => {
                    debug!("Ignored message from {}: {:?}", addr, reason);
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Connection {} from {} errored: {}", id, addr, e);
                break;
            }
        }
    }

    state.broadcaster.disconnect(id).await;
}

/// Applies one inbound text frame to the store
///
/// Messages without an explicit scene target the scene active at the time
/// they are processed. Nothing here is an error: anything that cannot be
/// applied is reported as [`Outcome::Ignored`].
pub async fn dispatch(store: &StateStore, text: &str) -> Outcome {
    let message = match ClientMessage::parse(text) {
        Ok(message) => message,
        Err(ProtocolError::Malformed(e)) => {
            return Outcome::Ignored(Ignored::Malformed(e.to_string()))
        }
        Err(ProtocolError::UnknownAction(action)) => {
            return Outcome::Ignored(Ignored::UnknownAction(action))
        }
        Err(e @ ProtocolError::InvalidData { .. }) => {
            return Outcome::Ignored(Ignored::InvalidData(e.to_string()))
        }
    };

    match message {
        ClientMessage::MoveToken(request) => {
            let Some(scene) = target_scene(store, request.scene).await else {
                return Outcome::Ignored(Ignored::NoActiveScene);
            };
            store
                .move_token(&scene, &request.id, request.x, request.y)
                .await
        }
        ClientMessage::RevealArea(request) => {
            let Some(scene) = target_scene(store, request.scene).await else {
                return Outcome::Ignored(Ignored::NoActiveScene);
            };
            let area = RevealedArea {
                x: request.x,
                y: request.y,
                r: request.r,
            };
            match store.append_reveal(&scene, area).await {
                Ok(()) => Outcome::Applied,
                Err(StoreError::NotFound(id)) => Outcome::Ignored(Ignored::UnknownScene(id)),
                Err(e) => {
                    warn!("Reveal in {} failed: {}", scene, e);
                    Outcome::Ignored(Ignored::UnknownScene(scene))
                }
            }
        }
    }
}

async fn target_scene(store: &StateStore, explicit: Option<String>) -> Option<String> {
    match explicit {
        Some(scene) => Some(scene),
        None => store.active().await,
    }
}
