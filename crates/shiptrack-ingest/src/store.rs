//! Durable intermediate store
//!
//! Decouples the fetch and parse stages. Payloads are addressed by
//! `(partner, stage, name)`; the fetch stage writes raw responses under
//! [`Stage::Batches`], the parse stage writes shipment event groups under
//! [`Stage::Details`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shiptrack_common::{Result, TrackError};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const PAYLOAD_EXTENSION: &str = "json";

/// Pipeline phase a payload belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Raw partner responses, one per batch
    Batches,
    /// Parsed shipment events, one group per tracking identifier
    Details,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Batches => "API_Batches",
            Stage::Details => "API_Details",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of one persisted payload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey {
    pub partner: String,
    pub stage: Stage,
    pub name: String,
}

impl StoreKey {
    pub fn new(partner: impl Into<String>, stage: Stage, name: impl Into<String>) -> Self {
        Self {
            partner: partner.into(),
            stage,
            name: name.into(),
        }
    }

    pub fn batch(partner: &str, batch_name: &str) -> Self {
        Self::new(partner, Stage::Batches, batch_name)
    }

    pub fn details(partner: &str, tracking_id: &str) -> Self {
        Self::new(partner, Stage::Details, tracking_id)
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.partner, self.stage, self.name)
    }
}

/// Key-value byte store shared by both stages
///
/// Writes to distinct keys never conflict, so implementations only need to
/// guarantee that a `get` never observes a partially written payload.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Write a payload, replacing any previous value
    async fn put(&self, key: &StoreKey, payload: &[u8]) -> Result<()>;

    /// Read a payload; `None` if nothing is stored under the key
    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>>;

    /// Remove a payload; removing a missing key is not an error
    async fn delete(&self, key: &StoreKey) -> Result<()>;

    /// Names stored for a partner and stage, sorted
    async fn list(&self, partner: &str, stage: Stage) -> Result<Vec<String>>;
}

/// Serialize a value as JSON and store it
pub async fn put_json<T: Serialize + Sync>(
    store: &dyn DurableStore,
    key: &StoreKey,
    value: &T,
) -> Result<()> {
    let payload =
        serde_json::to_vec_pretty(value).map_err(|e| TrackError::persistence(key.to_string(), e))?;
    store.put(key, &payload).await
}

/// Load and deserialize a JSON value; `None` if the key is absent
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn DurableStore,
    key: &StoreKey,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(payload) => serde_json::from_slice(&payload)
            .map(Some)
            .map_err(|e| TrackError::persistence(key.to_string(), e)),
        None => Ok(None),
    }
}

// ============================================================================
// Filesystem store
// ============================================================================

/// Store laid out as `<root>/<partner>_<stage>/<name>.json`
///
/// Partner and name are percent-encoded, so distinct keys never share a file.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stage_dir(&self, partner: &str, stage: Stage) -> PathBuf {
        self.root
            .join(format!("{}_{}", encode_segment(partner), stage.as_str()))
    }

    /// Path of the payload file for a key
    pub fn path_for(&self, key: &StoreKey) -> PathBuf {
        self.stage_dir(&key.partner, key.stage)
            .join(format!("{}.{}", encode_segment(&key.name), PAYLOAD_EXTENSION))
    }
}

#[async_trait]
impl DurableStore for FsStore {
    async fn put(&self, key: &StoreKey, payload: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        let fail = |e: std::io::Error| TrackError::persistence(key.to_string(), e);

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(fail)?;
        }

        // Write a sibling temp file and rename it so readers see all or nothing
        let tmp = path.with_extension(format!("{}.tmp-{}", PAYLOAD_EXTENSION, uuid::Uuid::new_v4()));
        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(payload).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                debug!(path = %tmp.display(), error = %cleanup, "Temp file cleanup failed");
            }
            return Err(fail(e));
        }

        debug!(key = %key, bytes = payload.len(), "Persisted payload");
        Ok(())
    }

    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(payload) => Ok(Some(payload)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TrackError::persistence(key.to_string(), e)),
        }
    }

    async fn delete(&self, key: &StoreKey) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TrackError::persistence(key.to_string(), e)),
        }
    }

    async fn list(&self, partner: &str, stage: Stage) -> Result<Vec<String>> {
        let dir = self.stage_dir(partner, stage);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let suffix = format!(".{}", PAYLOAD_EXTENSION);
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                warn!(dir = %dir.display(), "Skipping non UTF-8 file name");
                continue;
            };
            let Some(encoded) = file_name.strip_suffix(&suffix) else {
                continue;
            };
            match decode_segment(encoded) {
                Some(name) => names.push(name),
                None => warn!(file = file_name, "Skipping undecodable payload name"),
            }
        }

        names.sort();
        Ok(names)
    }
}

/// Encode a key component as a single path segment; inverse of [`decode_segment`]
pub fn encode_segment(name: &str) -> String {
    match name {
        // Left alone by percent-encoding but meaningful to the filesystem
        "." | ".." => name.replace('.', "%2E"),
        _ => urlencoding::encode(name).into_owned(),
    }
}

/// Recover a key component from its path segment
pub fn decode_segment(segment: &str) -> Option<String> {
    urlencoding::decode(segment).ok().map(|name| name.into_owned())
}
