//! Named-blob persistence for session state, browser cookies and raw captures.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use credisnap_core::{Fingerprint, RawOffer};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "credisnap-storage";

pub const REVIEWS_STATE_BLOB: &str = "state_reviews.json";
pub const RAW_OFFERS_BLOB: &str = "microloans.json";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("io error on {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("blob {name} is corrupt: {source}")]
    Corrupt {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Load/save of whole named blobs. Backends replace a blob atomically on save.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StateError>;

    async fn save(&self, name: &str, bytes: &[u8]) -> Result<(), StateError>;

    async fn exists(&self, name: &str) -> Result<bool, StateError> {
        Ok(self.load(name).await?.is_some())
    }
}

#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

fn io_err(name: &str) -> impl FnOnce(std::io::Error) -> StateError + '_ {
    move |source| StateError::Io {
        name: name.to_string(),
        source,
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StateError> {
        match fs::read(self.path_for(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(name)(err)),
        }
    }

    /// Write through a temp file in the same directory, then rename over the target.
    async fn save(&self, name: &str, bytes: &[u8]) -> Result<(), StateError> {
        let path = self.path_for(name);
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent).await.map_err(io_err(name))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(name))?;
        file.write_all(bytes).await.map_err(io_err(name))?;
        file.flush().await.map_err(io_err(name))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(name)(err));
        }
        debug!(path = %path.display(), bytes = bytes.len(), "blob saved");
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool, StateError> {
        fs::try_exists(self.path_for(name))
            .await
            .map_err(io_err(name))
    }
}

/// Process-local blob store, used where nothing needs to outlive the process.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, name: &str, bytes: impl Into<Vec<u8>>) {
        self.blobs.lock().await.insert(name.to_string(), bytes.into());
    }

    pub async fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.blobs.lock().await.get(name).cloned()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.get(name).await)
    }

    async fn save(&self, name: &str, bytes: &[u8]) -> Result<(), StateError> {
        self.insert(name, bytes).await;
        Ok(())
    }
}

/// On-disk shape of the session state blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub seen_ids: Vec<Fingerprint>,
}

/// Fingerprints seen by the most recent successful run of one pipeline.
#[derive(Clone)]
pub struct SessionStateStore {
    blobs: Arc<dyn BlobStore>,
    name: String,
}

impl SessionStateStore {
    pub fn new(blobs: Arc<dyn BlobStore>, name: impl Into<String>) -> Self {
        Self {
            blobs,
            name: name.into(),
        }
    }

    pub fn reviews(blobs: Arc<dyn BlobStore>) -> Self {
        Self::new(blobs, REVIEWS_STATE_BLOB)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Empty set when no state exists yet. Unreadable state is an error, never "all new".
    pub async fn load(&self) -> Result<HashSet<Fingerprint>, StateError> {
        let Some(bytes) = self.blobs.load(&self.name).await? else {
            info!(blob = %self.name, "no previous session state, starting empty");
            return Ok(HashSet::new());
        };
        let state: SessionState =
            serde_json::from_slice(&bytes).map_err(|source| StateError::Corrupt {
                name: self.name.clone(),
                source,
            })?;
        Ok(state.seen_ids.into_iter().collect())
    }

    /// Replace the stored set wholesale.
    pub async fn save<'a, I>(&self, fingerprints: I) -> Result<(), StateError>
    where
        I: IntoIterator<Item = &'a Fingerprint>,
    {
        let seen_ids = fingerprints
            .into_iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        let count = seen_ids.len();
        let bytes =
            serde_json::to_vec(&SessionState { seen_ids }).map_err(|source| StateError::Encode {
                name: self.name.clone(),
                source,
            })?;
        self.blobs.save(&self.name, &bytes).await?;
        info!(blob = %self.name, fingerprints = count, "session state replaced");
        Ok(())
    }
}

/// Cookie as exported by the browser context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub same_site: Option<String>,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

/// Per-source browser cookies. Loading is best-effort; saving never overwrites.
#[derive(Clone)]
pub struct CookieStore {
    blobs: Arc<dyn BlobStore>,
}

impl CookieStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    pub fn blob_name(source: &str) -> String {
        format!("cookies_{source}.json")
    }

    pub async fn load(&self, source: &str) -> Vec<BrowserCookie> {
        let name = Self::blob_name(source);
        match self.blobs.load(&name).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<BrowserCookie>>(&bytes) {
                Ok(cookies) => {
                    info!(blob = %name, cookies = cookies.len(), "loaded cookies");
                    cookies
                }
                Err(err) => {
                    warn!(blob = %name, "failed to parse cookies: {err}");
                    Vec::new()
                }
            },
            Ok(None) => {
                info!(blob = %name, "cookie file does not exist");
                Vec::new()
            }
            Err(err) => {
                warn!(blob = %name, "failed to load cookies: {err}");
                Vec::new()
            }
        }
    }

    /// Returns whether the cookies were written. Empty input or an existing blob is a no-op.
    pub async fn save(&self, source: &str, cookies: &[BrowserCookie]) -> bool {
        if cookies.is_empty() {
            return false;
        }
        let name = Self::blob_name(source);
        match self.blobs.exists(&name).await {
            Ok(true) => {
                debug!(blob = %name, "cookie file already present, keeping it");
                return false;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(blob = %name, "failed to check cookie file: {err}");
                return false;
            }
        }
        let bytes = match serde_json::to_vec(cookies) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(blob = %name, "failed to encode cookies: {err}");
                return false;
            }
        };
        match self.blobs.save(&name, &bytes).await {
            Ok(()) => {
                info!(blob = %name, cookies = cookies.len(), "saved cookies for next sessions");
                true
            }
            Err(err) => {
                warn!(blob = %name, "failed to save cookies: {err}");
                false
            }
        }
    }
}

/// Contents of the raw offers file: payload items exactly as the site sent them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawOfferCapture {
    pub offers: Vec<JsonValue>,
}

/// Write the deduplicated raw offers for inspection. Nothing is written for an empty capture.
pub async fn save_raw_offers(
    blobs: &dyn BlobStore,
    name: &str,
    offers: &[RawOffer],
) -> Result<bool, StateError> {
    if offers.is_empty() {
        return Ok(false);
    }
    let capture = RawOfferCapture {
        offers: offers.iter().map(|offer| offer.source().clone()).collect(),
    };
    let bytes = serde_json::to_vec(&capture).map_err(|source| StateError::Encode {
        name: name.to_string(),
        source,
    })?;
    blobs.save(name, &bytes).await?;
    info!(blob = name, offers = offers.len(), "saved raw offer capture");
    Ok(true)
}

pub async fn load_raw_offers(
    blobs: &dyn BlobStore,
    name: &str,
) -> Result<Option<RawOfferCapture>, StateError> {
    let Some(bytes) = blobs.load(name).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StateError::Corrupt {
            name: name.to_string(),
            source,
        })
}
