//! Authoritative scene registry with whole-file persistence
//!
//! The store owns every scene, token and revealed area. All access goes through
//! atomic operations on [`StateStore`] that take the single registry lock, check
//! invariants, and rewrite the state file before returning. The file write
//! itself happens after the registry lock is released, so readers and other
//! mutations never wait on the disk:
//! - Token ids are unique within a scene (tokens are keyed by id)
//! - A non-null active scene id always names an existing scene
//! - Revealed areas are only ever appended
//!
//! Persistence failures are logged and do not roll back the in-memory change,
//! so the running process stays authoritative until it restarts.

use crate::error::StoreError;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use shared::{RevealedArea, SceneMeta, SceneView, ServerState, Token};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};

/// Position given to tokens upserted without coordinates.
pub const DEFAULT_TOKEN_COORD: i64 = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    pub map_file: Option<String>,
    #[serde(default)]
    pub tokens: BTreeMap<String, Token>,
    #[serde(default)]
    pub revealed: Vec<RevealedArea>,
}

impl Scene {
    fn view(&self, id: &str) -> SceneView {
        SceneView {
            id: id.to_string(),
            map_file: self.map_file.clone(),
            tokens: self.tokens.values().cloned().collect(),
            revealed: self.revealed.clone(),
        }
    }
}

/// Persisted shape of the whole table: `{scenes: {id: Scene}, active}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    scenes: BTreeMap<String, Scene>,
    #[serde(default)]
    active: Option<String>,
}

impl Registry {
    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }

    fn first_scene_id(&self) -> Option<String> {
        self.scenes.keys().next().cloned()
    }

    /// Re-establishes the active-scene invariant on a freshly loaded file.
    fn repaired(mut self) -> Self {
        let dangling = self
            .active
            .as_ref()
            .is_some_and(|id| !self.scenes.contains_key(id));
        if dangling || (self.active.is_none() && !self.scenes.is_empty()) {
            let replacement = self.first_scene_id();
            warn!(
                "Loaded active scene {:?} is invalid, using {:?}",
                self.active, replacement
            );
            self.active = replacement;
        }
        self
    }

    fn server_state(&self) -> ServerState {
        ServerState {
            active: self.active.clone(),
            scene: self
                .active
                .as_deref()
                .and_then(|id| self.scenes.get(id).map(|scene| scene.view(id))),
            scenes: self
                .scenes
                .iter()
                .map(|(id, scene)| {
                    (
                        id.clone(),
                        SceneMeta {
                            map_file: scene.map_file.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn scene_mut(&mut self, id: &str) -> Result<&mut Scene, StoreError> {
        self.scenes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// Fields of an upserted token. The record is replaced wholesale: any optional
/// field left out here is dropped from the stored token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenFields {
    #[serde(default = "default_coord")]
    pub x: i64,
    #[serde(default = "default_coord")]
    pub y: i64,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub vision: Option<u32>,
    #[serde(default)]
    pub light_radius: Option<u32>,
}

fn default_coord() -> i64 {
    DEFAULT_TOKEN_COORD
}

impl TokenFields {
    pub fn at(x: i64, y: i64) -> Self {
        Self {
            x,
            y,
            owner: None,
            image: None,
            vision: None,
            light_radius: None,
        }
    }

    fn into_token(self, id: &str) -> Token {
        Token {
            id: id.to_string(),
            x: self.x,
            y: self.y,
            owner: self.owner,
            image: self.image,
            vision: self.vision,
            light_radius: self.light_radius,
        }
    }
}

/// Result of an operation that is allowed to do nothing without failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Ignored(Ignored),
}

/// Why a message or a permissive operation had no effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ignored {
    Malformed(String),
    UnknownAction(String),
    InvalidData(String),
    NoActiveScene,
    UnknownScene(String),
    UnknownToken { scene: String, token: String },
}

#[derive(Debug)]
pub struct StateStore {
    registry: Mutex<Registry>,
    path: Option<PathBuf>,
    /// Bumped under the registry lock on every mutation
    generation: AtomicU64,
    /// Serializes file writes; holds the newest generation on disk
    written: Mutex<u64>,
}

impl StateStore {
    /// Creates a store that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            path: None,
            generation: AtomicU64::new(0),
            written: Mutex::new(0),
        }
    }

    /// Loads the registry from `path`, replacing any in-memory state.
    ///
    /// A missing file starts an empty table. A file that exists but cannot be
    /// read or parsed is an error, so a damaged state file is never silently
    /// overwritten by the next mutation.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let registry = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Registry>(&bytes)
                .map_err(|source| StoreError::Corrupt {
                    path: path.clone(),
                    source,
                })?
                .repaired(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state file at {}, starting empty", path.display());
                Registry::default()
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        info!(
            "Loaded {} scenes from {} (active: {:?})",
            registry.len(),
            path.display(),
            registry.active()
        );

        Ok(Self {
            registry: Mutex::new(registry),
            path: Some(path),
            generation: AtomicU64::new(0),
            written: Mutex::new(0),
        })
    }

    /// Registers a new scene. The first scene on an empty table becomes active.
    pub async fn create_scene(&self, id: &str, map_file: Option<String>) -> Result<(), StoreError> {
        let mut registry = self.registry.lock().await;
        if registry.scenes.contains_key(id) {
            return Err(StoreError::AlreadyExists(id.to_string()));
        }

        registry.scenes.insert(
            id.to_string(),
            Scene {
                map_file,
                ..Scene::default()
            },
        );
        if registry.active.is_none() {
            registry.active = Some(id.to_string());
        }
        info!("Created scene {} (active: {:?})", id, registry.active);

        self.persist(registry).await;
        Ok(())
    }

    /// Removes a scene. Deleting the active scene hands the role to the
    /// smallest remaining scene id, or clears it when none are left.
    pub async fn delete_scene(&self, id: &str) -> Result<(), StoreError> {
        let mut registry = self.registry.lock().await;
        if registry.scenes.remove(id).is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }

        if registry.active.as_deref() == Some(id) {
            registry.active = registry.first_scene_id();
            info!(
                "Deleted active scene {}, active is now {:?}",
                id, registry.active
            );
        } else {
            info!("Deleted scene {}", id);
        }

        self.persist(registry).await;
        Ok(())
    }

    pub async fn set_active(&self, id: &str) -> Result<(), StoreError> {
        let mut registry = self.registry.lock().await;
        if !registry.scenes.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        registry.active = Some(id.to_string());
        info!("Active scene set to {}", id);

        self.persist(registry).await;
        Ok(())
    }

    /// Points a scene at a map asset already placed in the assets directory.
    pub async fn set_map(&self, scene: &str, map_file: Option<String>) -> Result<(), StoreError> {
        let mut registry = self.registry.lock().await;
        registry.scene_mut(scene)?.map_file = map_file;

        self.persist(registry).await;
        Ok(())
    }

    /// Creates or fully replaces a token record.
    pub async fn upsert_token(
        &self,
        scene: &str,
        token_id: &str,
        fields: TokenFields,
    ) -> Result<(), StoreError> {
        let mut registry = self.registry.lock().await;
        registry
            .scene_mut(scene)?
            .tokens
            .insert(token_id.to_string(), fields.into_token(token_id));

        self.persist(registry).await;
        Ok(())
    }

    /// Moves a token. A missing scene or token is a no-op, reported as
    /// [`Outcome::Ignored`] and not persisted.
    pub async fn move_token(&self, scene: &str, token_id: &str, x: i64, y: i64) -> Outcome {
        let mut registry = self.registry.lock().await;
        let Some(target) = registry.scenes.get_mut(scene) else {
            return Outcome::Ignored(Ignored::UnknownScene(scene.to_string()));
        };
        let Some(token) = target.tokens.get_mut(token_id) else {
            return Outcome::Ignored(Ignored::UnknownToken {
                scene: scene.to_string(),
                token: token_id.to_string(),
            });
        };
        token.x = x;
        token.y = y;

        self.persist(registry).await;
        Outcome::Applied
    }

    pub async fn append_reveal(&self, scene: &str, area: RevealedArea) -> Result<(), StoreError> {
        let mut registry = self.registry.lock().await;
        registry.scene_mut(scene)?.revealed.push(area);

        self.persist(registry).await;
        Ok(())
    }

    pub async fn snapshot(&self, scene_id: &str) -> Option<SceneView> {
        let registry = self.registry.lock().await;
        registry.scenes.get(scene_id).map(|scene| scene.view(scene_id))
    }

    pub async fn active(&self) -> Option<String> {
        self.registry.lock().await.active.clone()
    }

    pub async fn scene_ids(&self) -> Vec<String> {
        self.registry.lock().await.scenes.keys().cloned().collect()
    }

    /// Full snapshot of the active scene plus map metadata for every scene.
    pub async fn server_state(&self) -> ServerState {
        self.registry.lock().await.server_state()
    }

    pub async fn registry(&self) -> Registry {
        self.registry.lock().await.clone()
    }

    /// Serialized registry, byte-identical to what a persist would write.
    pub async fn export(&self) -> Result<Vec<u8>, serde_json::Error> {
        let registry = self.registry.lock().await;
        serde_json::to_vec_pretty(&*registry)
    }

    /// Rewrites the state file from a just-mutated registry.
    ///
    /// The bytes are taken under the registry lock, which is then released
    /// before any disk I/O. Writes queue on `written`; one that finds a newer
    /// generation already on disk is skipped, so the file never goes back in
    /// time.
    async fn persist(&self, registry: MutexGuard<'_, Registry>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(path) = &self.path else {
            return;
        };
        let bytes = match serde_json::to_vec_pretty(&*registry) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to serialize state for {}: {}", path.display(), e);
                return;
            }
        };
        drop(registry);

        let mut written = self.written.lock().await;
        if *written > generation {
            debug!("Skipping write of generation {}, {} is on disk", generation, *written);
            return;
        }
        match write_atomically(path, &bytes).await {
            Ok(()) => *written = generation,
            Err(e) => error!("Failed to persist state to {}: {}", path.display(), e),
        }
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = tmp_path(path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("state"));
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_test::{assert_err, assert_ok};

    async fn dungeon_with_goblin() -> StateStore {
        let store = StateStore::in_memory();
        assert_ok!(store.create_scene("dungeon", None).await);
        assert_ok!(
            store
                .upsert_token("dungeon", "goblin1", TokenFields::at(50, 50))
                .await
        );
        store
    }

    #[tokio::test]
    async fn test_first_scene_becomes_active() {
        let store = StateStore::in_memory();
        assert_eq!(store.active().await, None);

        assert_ok!(store.create_scene("dungeon", None).await);
        assert_eq!(store.active().await.as_deref(), Some("dungeon"));

        assert_ok!(
            store
                .create_scene("cave", Some("maps/cave.png".to_string()))
                .await
        );
        assert_eq!(store.active().await.as_deref(), Some("dungeon"));
        assert_eq!(store.scene_ids().await, vec!["cave", "dungeon"]);
    }

    #[tokio::test]
    async fn test_create_duplicate_scene_fails() {
        let store = StateStore::in_memory();
        assert_ok!(store.create_scene("dungeon", None).await);

        let err = assert_err!(store.create_scene("dungeon", None).await);
        assert!(matches!(err, StoreError::AlreadyExists(id) if id == "dungeon"));
        assert_eq!(store.scene_ids().await.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_active_scene_reassigns() {
        let store = StateStore::in_memory();
        for id in ["b", "a", "c"] {
            assert_ok!(store.create_scene(id, None).await);
        }
        assert_eq!(store.active().await.as_deref(), Some("b"));

        assert_ok!(store.delete_scene("b").await);
        let active = store.active().await;
        assert_eq!(active.as_deref(), Some("a"));
        assert!(store.scene_ids().await.contains(&"a".to_string()));

        // Deleting a non-active scene leaves the active one alone
        assert_ok!(store.delete_scene("c").await);
        assert_eq!(store.active().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_delete_last_scene_clears_active() {
        let store = dungeon_with_goblin().await;
        assert_ok!(store.delete_scene("dungeon").await);

        assert_eq!(store.active().await, None);
        let state = store.server_state().await;
        assert_eq!(state.active, None);
        assert!(state.scene.is_none());
        assert!(state.scenes.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_scene_fails() {
        let store = StateStore::in_memory();
        let err = assert_err!(store.delete_scene("nowhere").await);
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_set_active() {
        let store = StateStore::in_memory();
        assert_ok!(store.create_scene("dungeon", None).await);
        assert_ok!(store.create_scene("cave", None).await);

        assert_ok!(store.set_active("cave").await);
        assert_eq!(store.active().await.as_deref(), Some("cave"));

        let err = assert_err!(store.set_active("nowhere").await);
        assert!(matches!(err, StoreError::NotFound(id) if id == "nowhere"));
        assert_eq!(store.active().await.as_deref(), Some("cave"));
    }

    #[tokio::test]
    async fn test_set_map() {
        let store = dungeon_with_goblin().await;
        assert_ok!(
            store
                .set_map("dungeon", Some("maps/dungeon.png".to_string()))
                .await
        );

        let state = store.server_state().await;
        assert_eq!(
            state.scenes["dungeon"].map_file.as_deref(),
            Some("maps/dungeon.png")
        );
        assert_eq!(
            state.scene.and_then(|s| s.map_file).as_deref(),
            Some("maps/dungeon.png")
        );

        assert_err!(store.set_map("nowhere", None).await);
    }

    #[tokio::test]
    async fn test_upsert_into_missing_scene_fails() {
        let store = StateStore::in_memory();
        let err = assert_err!(
            store
                .upsert_token("nowhere", "goblin1", TokenFields::at(1, 1))
                .await
        );
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    /// Re-adding a token while omitting a previously set optional field clears
    /// that field. This mirrors the observed full-replace behavior; whether a
    /// field merge was intended is unconfirmed, so this test pins the current
    /// semantics rather than endorsing them.
    #[tokio::test]
    async fn test_upsert_replaces_whole_record_dropping_omitted_fields() {
        let store = StateStore::in_memory();
        assert_ok!(store.create_scene("dungeon", None).await);

        let mut fields = TokenFields::at(10, 10);
        fields.owner = Some("player".to_string());
        fields.vision = Some(150);
        fields.light_radius = Some(60);
        assert_ok!(store.upsert_token("dungeon", "hero", fields).await);

        let mut fields = TokenFields::at(20, 20);
        fields.owner = Some("player".to_string());
        assert_ok!(store.upsert_token("dungeon", "hero", fields).await);

        let scene = store.snapshot("dungeon").await.unwrap();
        let hero = scene.token("hero").unwrap();
        assert_eq!((hero.x, hero.y), (20, 20));
        assert_eq!(hero.owner.as_deref(), Some("player"));
        assert_eq!(hero.vision, None);
        assert_eq!(hero.light_radius, None);
    }

    #[tokio::test]
    async fn test_token_ids_stay_unique() {
        let store = StateStore::in_memory();
        assert_ok!(store.create_scene("dungeon", None).await);
        assert_ok!(store.create_scene("cave", None).await);

        let ids = ["goblin", "orc", "goblin", "troll", "orc", "goblin"];
        for (step, id) in ids.iter().enumerate() {
            let scene = if step % 2 == 0 { "dungeon" } else { "cave" };
            let step = step as i64;
            assert_ok!(
                store
                    .upsert_token(scene, id, TokenFields::at(step, step))
                    .await
            );
            store.move_token(scene, id, step + 1, step + 1).await;
            store.move_token("dungeon", "goblin", step, 0).await;
        }

        for scene in ["dungeon", "cave"] {
            let view = store.snapshot(scene).await.unwrap();
            let mut seen: Vec<&str> = view.tokens.iter().map(|t| t.id.as_str()).collect();
            let total = seen.len();
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len(), total, "duplicate token ids in {}", scene);
        }
        assert_eq!(store.snapshot("dungeon").await.unwrap().tokens.len(), 2);
        assert_eq!(store.snapshot("cave").await.unwrap().tokens.len(), 3);
    }

    #[tokio::test]
    async fn test_move_token() {
        let store = dungeon_with_goblin().await;
        assert_eq!(
            store.move_token("dungeon", "goblin1", 80, 80).await,
            Outcome::Applied
        );

        let goblin = store
            .snapshot("dungeon")
            .await
            .and_then(|s| s.token("goblin1").cloned())
            .unwrap();
        assert_eq!((goblin.x, goblin.y), (80, 80));
    }

    #[tokio::test]
    async fn test_move_missing_token_leaves_state_unchanged() {
        let store = dungeon_with_goblin().await;
        let before = store.export().await.unwrap();

        assert_eq!(
            store.move_token("nowhere", "goblin1", 1, 1).await,
            Outcome::Ignored(Ignored::UnknownScene("nowhere".to_string()))
        );
        assert_eq!(
            store.move_token("dungeon", "ghost", 1, 1).await,
            Outcome::Ignored(Ignored::UnknownToken {
                scene: "dungeon".to_string(),
                token: "ghost".to_string(),
            })
        );

        assert_eq!(store.export().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_append_reveal() {
        let store = dungeon_with_goblin().await;
        assert_ok!(
            store
                .append_reveal("dungeon", RevealedArea { x: 1, y: 2, r: 3 })
                .await
        );
        assert_ok!(
            store
                .append_reveal("dungeon", RevealedArea { x: 4, y: 5, r: 6 })
                .await
        );

        let revealed = store.snapshot("dungeon").await.unwrap().revealed;
        assert_eq!(
            revealed,
            vec![
                RevealedArea { x: 1, y: 2, r: 3 },
                RevealedArea { x: 4, y: 5, r: 6 }
            ]
        );

        let err = assert_err!(
            store
                .append_reveal("nowhere", RevealedArea { x: 0, y: 0, r: 1 })
                .await
        );
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let store = dungeon_with_goblin().await;
        let before = store.snapshot("dungeon").await.unwrap();

        store.move_token("dungeon", "goblin1", 99, 99).await;

        let goblin = before.token("goblin1").unwrap();
        assert_eq!((goblin.x, goblin.y), (50, 50));
        assert!(store.snapshot("nowhere").await.is_none());
    }

    #[tokio::test]
    async fn test_server_state_covers_all_scene_maps() {
        let store = dungeon_with_goblin().await;
        assert_ok!(
            store
                .create_scene("cave", Some("maps/cave.png".to_string()))
                .await
        );

        let state = store.server_state().await;
        assert_eq!(state.active.as_deref(), Some("dungeon"));
        let scene = state.scene.unwrap();
        assert_eq!(scene.id, "dungeon");
        assert_eq!(scene.tokens, vec![Token::new("goblin1", 50, 50)]);
        assert_eq!(state.scenes.len(), 2);
        assert_eq!(
            state.scenes["cave"].map_file.as_deref(),
            Some("maps/cave.png")
        );
        assert_eq!(state.scenes["dungeon"].map_file, None);
    }

    #[tokio::test]
    async fn test_persist_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table").join("state.json");

        let expected = {
            let store = assert_ok!(StateStore::open(&path).await);
            assert_ok!(store.create_scene("dungeon", None).await);
            assert_ok!(
                store
                    .create_scene("cave", Some("maps/cave.png".to_string()))
                    .await
            );
            let mut fields = TokenFields::at(5, 6);
            fields.image = Some("tokens/goblin.png".to_string());
            fields.vision = Some(40);
            assert_ok!(store.upsert_token("cave", "goblin1", fields).await);
            assert_ok!(
                store
                    .append_reveal("cave", RevealedArea { x: 7, y: 8, r: 9 })
                    .await
            );
            assert_ok!(store.set_active("cave").await);
            store.registry().await
        };

        let reloaded = assert_ok!(StateStore::open(&path).await);
        assert_eq!(reloaded.registry().await, expected);
        assert_eq!(reloaded.active().await.as_deref(), Some("cave"));
        assert!(!tmp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_persisted_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = assert_ok!(StateStore::open(&path).await);
        assert_ok!(store.create_scene("dungeon", None).await);
        assert_ok!(
            store
                .upsert_token("dungeon", "goblin1", TokenFields::at(50, 50))
                .await
        );

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, store.export().await.unwrap());

        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["active"], "dungeon");
        assert_eq!(value["scenes"]["dungeon"]["tokens"]["goblin1"]["x"], 50);
        assert!(value["scenes"]["dungeon"]["revealed"].is_array());
    }

    #[tokio::test]
    async fn test_open_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = assert_ok!(StateStore::open(dir.path().join("absent.json")).await);
        assert!(store.registry().await.is_empty());
        assert_eq!(store.active().await, None);
    }

    #[tokio::test]
    async fn test_open_corrupt_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let err = assert_err!(StateStore::open(&path).await);
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_open_repairs_dangling_active() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            br#"{"scenes":{"cave":{"map_file":null,"tokens":{},"revealed":[]}},"active":"gone"}"#,
        )
        .unwrap();

        let store = assert_ok!(StateStore::open(&path).await);
        assert_eq!(store.active().await.as_deref(), Some("cave"));
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_memory_state() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        let path = blocker.join("state.json");

        let store = assert_ok!(StateStore::open(&path).await);
        // The parent directory cannot be created once a file sits there
        std::fs::write(&blocker, b"file").unwrap();

        assert_ok!(store.create_scene("dungeon", None).await);
        assert_eq!(store.active().await.as_deref(), Some("dungeon"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_reads_and_mutations_proceed_while_a_write_is_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = Arc::new(assert_ok!(StateStore::open(&path).await));
        assert_ok!(store.create_scene("dungeon", None).await);
        assert_ok!(store.create_scene("cave", None).await);
        assert_ok!(
            store
                .upsert_token("dungeon", "goblin1", TokenFields::at(50, 50))
                .await
        );
        assert_ok!(
            store
                .upsert_token("cave", "bat", TokenFields::at(5, 5))
                .await
        );

        // Stall the disk by holding the writer slot
        let stalled = store.written.lock().await;

        let mover = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.move_token("dungeon", "goblin1", 80, 80).await })
        };
        let wait = Duration::from_secs(5);
        timeout(wait, async {
            while store.snapshot("dungeon").await.and_then(|s| s.token("goblin1").map(|t| t.x))
                != Some(80)
            {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("move was not applied in memory while its write was pending");

        // Other readers and a mutation on another scene do not queue behind the disk
        let state = assert_ok!(timeout(wait, store.server_state()).await);
        assert_eq!(state.active.as_deref(), Some("dungeon"));
        let other = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.move_token("cave", "bat", 9, 9).await })
        };
        timeout(wait, async {
            while store.snapshot("cave").await.and_then(|s| s.token("bat").map(|t| t.x)) != Some(9)
            {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("second move blocked on the pending write");
        assert!(!mover.is_finished());

        drop(stalled);
        assert_eq!(mover.await.unwrap(), Outcome::Applied);
        assert_eq!(other.await.unwrap(), Outcome::Applied);

        // The file ends at the newest state regardless of write order
        assert_eq!(std::fs::read(&path).unwrap(), store.export().await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_write_never_overwrites_newer_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = assert_ok!(StateStore::open(&path).await);
        assert_ok!(store.create_scene("dungeon", None).await);

        // Pretend a later generation already reached the disk
        *store.written.lock().await = u64::MAX;
        let before = std::fs::read(&path).unwrap();
        assert_ok!(store.create_scene("cave", None).await);

        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert_eq!(store.scene_ids().await, vec!["cave", "dungeon"]);
    }

    #[test]
    fn test_token_fields_defaults() {
        let fields: TokenFields = serde_json::from_str(r#"{"owner":"player"}"#).unwrap();
        assert_eq!(fields.x, DEFAULT_TOKEN_COORD);
        assert_eq!(fields.y, DEFAULT_TOKEN_COORD);
        assert_eq!(fields.owner.as_deref(), Some("player"));
        assert_eq!(fields.vision, None);
    }

    #[test]
    fn test_tmp_path_is_sibling() {
        let path = Path::new("/data/state.json");
        assert_eq!(tmp_path(path), PathBuf::from("/data/state.json.tmp"));
    }
}
