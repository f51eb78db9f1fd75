//! On-disk cache of map and token images
//!
//! Assets are addressed by the relative path the server uses under
//! `/assets`, and stored under the cache directory at the same relative path.
//! An asset already on disk is never fetched again, and at most one fetch per
//! path is in flight at a time. Paths that could escape the cache directory
//! are refused before any request is made.

use log::{debug, info};
use shared::{asset_url, is_safe_asset_path};
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("refusing unsafe asset path `{0}`")]
    UnsafePath(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request for {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What a call to [`AssetCache::fetch`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The file was already cached
    Cached,
    /// The file was downloaded and written
    Fetched,
    /// Another fetch for the same path is running
    InFlight,
}

pub struct AssetCache {
    root: PathBuf,
    origin: String,
    http: reqwest::Client,
    in_flight: Mutex<HashSet<String>>,
}

impl AssetCache {
    pub fn new(
        root: impl Into<PathBuf>,
        origin: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AssetError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(AssetError::Client)?;

        Ok(Self {
            root: root.into(),
            origin: origin.into(),
            http,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Where `rel` lives in the cache, or `None` for an unsafe path
    pub fn local_path(&self, rel: &str) -> Option<PathBuf> {
        is_safe_asset_path(rel).then(|| self.root.join(rel))
    }

    pub async fn contains(&self, rel: &str) -> bool {
        match self.local_path(rel) {
            Some(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            None => false,
        }
    }

    /// Downloads `rel` unless it is cached or already being fetched
    ///
    /// A failed fetch leaves no file behind, so the next state that
    /// references the asset retries it.
    pub async fn fetch(&self, rel: &str) -> Result<FetchOutcome, AssetError> {
        let path = self
            .local_path(rel)
            .ok_or_else(|| AssetError::UnsafePath(rel.to_string()))?;

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(FetchOutcome::Cached);
        }

        let Some(_claim) = self.claim(rel) else {
            return Ok(FetchOutcome::InFlight);
        };

        let url = asset_url(&self.origin, rel);
        debug!("Fetching asset {}", url);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|source| AssetError::Request {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(AssetError::Status { url, status });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|source| AssetError::Request {
                url: url.clone(),
                source,
            })?;

        write_atomically(&path, &bytes)
            .await
            .map_err(|source| AssetError::Io {
                path: path.clone(),
                source,
            })?;

        info!("Cached asset {} ({} bytes)", rel, bytes.len());
        Ok(FetchOutcome::Fetched)
    }

    fn claim(&self, rel: &str) -> Option<InFlight<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.insert(rel.to_string()).then(|| InFlight {
            cache: self,
            rel: rel.to_string(),
        })
    }
}

/// Marks a path as being fetched until dropped
struct InFlight<'a> {
    cache: &'a AssetCache,
    rel: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.cache
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.rel);
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("asset"));
    name.push(".part");
    let tmp = path.with_file_name(name);

    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}
