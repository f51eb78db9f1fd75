use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const DEFAULT_PORT: u16 = 8000;
pub const WS_PATH: &str = "/ws";
pub const ASSETS_PATH: &str = "/assets";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    pub x: i64,
    pub y: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light_radius: Option<u32>,
}

impl Token {
    pub fn new(id: impl Into<String>, x: i64, y: i64) -> Self {
        Self {
            id: id.into(),
            x,
            y,
            owner: None,
            image: None,
            vision: None,
            light_radius: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealedArea {
    pub x: i64,
    pub y: i64,
    pub r: u32,
}

/// Wire view of a single scene: tokens flattened into a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneView {
    pub id: String,
    pub map_file: Option<String>,
    pub tokens: Vec<Token>,
    pub revealed: Vec<RevealedArea>,
}

impl SceneView {
    pub fn token(&self, id: &str) -> Option<&Token> {
        self.tokens.iter().find(|token| token.id == id)
    }

    /// Relative asset paths this scene needs: the map first, then token
    /// images, without duplicates.
    pub fn asset_refs(&self) -> Vec<String> {
        let mut refs: Vec<String> = Vec::new();
        let candidates = self
            .map_file
            .iter()
            .chain(self.tokens.iter().filter_map(|token| token.image.as_ref()));
        for rel in candidates {
            if !refs.contains(rel) {
                refs.push(rel.clone());
            }
        }
        refs
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneMeta {
    pub map_file: Option<String>,
}

/// Full-state snapshot pushed on connect and after every mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    pub active: Option<String>,
    pub scene: Option<SceneView>,
    #[serde(default)]
    pub scenes: BTreeMap<String, SceneMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveToken {
    pub id: String,
    #[serde(deserialize_with = "int_like")]
    pub x: i64,
    #[serde(deserialize_with = "int_like")]
    pub y: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealArea {
    #[serde(deserialize_with = "int_like")]
    pub x: i64,
    #[serde(deserialize_with = "int_like")]
    pub y: i64,
    #[serde(deserialize_with = "radius_like")]
    pub r: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene: Option<String>,
}

/// Inbound coordinates arrive from loosely typed viewers: any JSON number or
/// numeric string is accepted and truncated toward zero.
fn int_like<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Loose {
        Int(i64),
        Float(f64),
        Text(String),
    }

    match Loose::deserialize(deserializer)? {
        Loose::Int(n) => Ok(n),
        Loose::Float(f) if f.is_finite() => Ok(f.trunc() as i64),
        Loose::Float(f) => Err(de::Error::custom(format!("coordinate {} is not finite", f))),
        Loose::Text(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| de::Error::custom(format!("`{}` is not an integer", text))),
    }
}

fn radius_like<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let r = int_like(deserializer)?;
    u32::try_from(r).map_err(|_| de::Error::custom(format!("radius {} is out of range", r)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    ServerState(ServerState),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    MoveToken(MoveToken),
    RevealArea(RevealArea),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("unknown action `{0}`")]
    UnknownAction(String),
    #[error("invalid data for `{action}`: {source}")]
    InvalidData {
        action: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    action: String,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    fn parse(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(ProtocolError::Malformed)
    }
}

fn decode_data<T: DeserializeOwned>(action: String, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidData { action, source })
}

impl ServerMessage {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let Envelope { action, data } = Envelope::parse(raw)?;
        match action.as_str() {
            "server_state" => decode_data(action, data).map(ServerMessage::ServerState),
            _ => Err(ProtocolError::UnknownAction(action)),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ClientMessage {
    pub fn move_token(id: impl Into<String>, x: i64, y: i64) -> Self {
        ClientMessage::MoveToken(MoveToken {
            id: id.into(),
            x,
            y,
            scene: None,
        })
    }

    pub fn reveal_area(x: i64, y: i64, r: u32) -> Self {
        ClientMessage::RevealArea(RevealArea {
            x,
            y,
            r,
            scene: None,
        })
    }

    /// Parses a `{"action", "data"}` envelope sent by a viewer.
    ///
    /// Distinguishes unparseable text, unknown actions and known actions
    /// whose data is missing required fields, so the server can log why a
    /// message was dropped.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let Envelope { action, data } = Envelope::parse(raw)?;
        match action.as_str() {
            "move_token" => decode_data(action, data).map(ClientMessage::MoveToken),
            "reveal_area" => decode_data(action, data).map(ClientMessage::RevealArea),
            _ => Err(ProtocolError::UnknownAction(action)),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Relative asset paths must stay inside the assets root on both ends.
pub fn is_safe_asset_path(rel: &str) -> bool {
    !rel.is_empty()
        && !rel.starts_with('/')
        && !rel.contains('\\')
        && !rel.contains(':')
        && rel
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}

pub fn asset_url(origin: &str, rel: &str) -> String {
    format!(
        "{}{}/{}",
        origin.trim_end_matches('/'),
        ASSETS_PATH,
        rel.trim_start_matches('/')
    )
}
