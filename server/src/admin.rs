//! JSON routes for the game master's tooling
//!
//! Every mutating route goes through the same [`StateStore`] operations the
//! websocket endpoint uses and broadcasts the new state when it succeeds.
//! Failures come back as `{"error", "status"}` bodies via [`StoreError`].
//!
//! | Method | Path | Body |
//! |--------|------|------|
//! | GET | `/state` | |
//! | POST | `/scenes` | `{id, map_file?}` |
//! | DELETE | `/scenes/{id}` | |
//! | PUT | `/active` | `{id}` |
//! | PUT | `/scenes/{id}/map` | `{map_file?}` |
//! | PUT | `/scenes/{id}/tokens/{token_id}` | token fields |
//! | POST | `/scenes/{id}/reveal` | `{x, y, r}` |

use crate::error::StoreError;
use crate::network::AppState;
use crate::store::TokenFields;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use log::{debug, info};
use serde::Deserialize;
use shared::{RevealedArea, ServerState};

#[derive(Debug, Deserialize)]
pub struct CreateScene {
    pub id: String,
    #[serde(default)]
    pub map_file: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetActive {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct SetMap {
    #[serde(default)]
    pub map_file: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/state", get(get_state))
        .route("/scenes", post(create_scene))
        .route("/scenes/{id}", delete(delete_scene))
        .route("/active", put(set_active))
        .route("/scenes/{id}/map", put(set_map))
        .route("/scenes/{id}/tokens/{token_id}", put(upsert_token))
        .route("/scenes/{id}/reveal", post(append_reveal))
}

async fn get_state(State(state): State<AppState>) -> Json<ServerState> {
    Json(state.store.server_state().await)
}

async fn create_scene(
    State(state): State<AppState>,
    Json(body): Json<CreateScene>,
) -> Result<(StatusCode, Json<ServerState>), StoreError> {
    state.store.create_scene(&body.id, body.map_file).await?;
    Ok((StatusCode::CREATED, applied(&state).await))
}

async fn delete_scene(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServerState>, StoreError> {
    state.store.delete_scene(&id).await?;
    Ok(applied(&state).await)
}

async fn set_active(
    State(state): State<AppState>,
    Json(body): Json<SetActive>,
) -> Result<Json<ServerState>, StoreError> {
    state.store.set_active(&body.id).await?;
    Ok(applied(&state).await)
}

async fn set_map(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SetMap>,
) -> Result<Json<ServerState>, StoreError> {
    state.store.set_map(&id, body.map_file).await?;
    Ok(applied(&state).await)
}

async fn upsert_token(
    State(state): State<AppState>,
    Path((id, token_id)): Path<(String, String)>,
    Json(fields): Json<TokenFields>,
) -> Result<Json<ServerState>, StoreError> {
    state.store.upsert_token(&id, &token_id, fields).await?;
    info!("Token {} placed in scene {}", token_id, id);
    Ok(applied(&state).await)
}

async fn append_reveal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(area): Json<RevealedArea>,
) -> Result<Json<ServerState>, StoreError> {
    state.store.append_reveal(&id, area).await?;
    Ok(applied(&state).await)
}

/// Pushes the new state to every viewer and echoes it to the caller
async fn applied(state: &AppState) -> Json<ServerState> {
    let report = state.broadcaster.broadcast_state(&state.store).await;
    debug!(
        "Admin change broadcast to {} viewers ({} failed)",
        report.delivered,
        report.failed
    );
    Json(state.store.server_state().await)
}
