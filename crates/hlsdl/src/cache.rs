// Result cache: remembers finished outputs so an identical request is not downloaded twice.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::DownloadError;

pub const MANIFEST_FILE_NAME: &str = ".hlsdl_cache.json";

/// Everything that determines the produced output.
#[derive(Debug, Clone, Serialize)]
pub struct RequestIdentity<'a> {
    pub url: &'a str,
    pub headers: &'a [(String, String)],
    pub skip_expression: &'a str,
    pub skip_discontinuity_wrapped: bool,
}

impl RequestIdentity<'_> {
    /// Hex SHA-256 of the JSON-serialized identity.
    pub fn fingerprint(&self) -> Result<String, DownloadError> {
        let encoded = serde_json::to_vec(self).map_err(|e| DownloadError::Cache {
            reason: format!("failed to encode request identity: {e}"),
        })?;
        Ok(hex::encode(Sha256::digest(&encoded)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub sha256: String,
    pub size: u64,
    pub file_name: String,
}

#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Path of a previously produced output that is still intact.
    async fn lookup(&self, fingerprint: &str) -> Result<Option<PathBuf>, DownloadError>;

    /// Record `output` as the result of the request with `fingerprint`.
    async fn store(&self, fingerprint: &str, output: &Path) -> Result<(), DownloadError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    entries: Vec<CacheEntry>,
}

/// JSON manifest kept in the save directory.
pub struct ManifestCache {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl ManifestCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE_NAME)
    }

    async fn load(&self) -> Result<Manifest, DownloadError> {
        let path = self.manifest_path();
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Manifest::default()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&content) {
            Ok(manifest) => Ok(manifest),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable cache manifest");
                Ok(Manifest::default())
            }
        }
    }

    async fn save(&self, manifest: &Manifest) -> Result<(), DownloadError> {
        let json = serde_json::to_vec_pretty(manifest).map_err(|e| DownloadError::Cache {
            reason: format!("failed to encode manifest: {e}"),
        })?;
        let path = self.manifest_path();
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &json).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl ResultCache for ManifestCache {
    async fn lookup(&self, fingerprint: &str) -> Result<Option<PathBuf>, DownloadError> {
        let _guard = self.lock.lock().await;
        let manifest = self.load().await?;
        let Some(entry) = manifest
            .entries
            .iter()
            .find(|entry| entry.fingerprint == fingerprint)
        else {
            return Ok(None);
        };

        let path = self.dir.join(&entry.file_name);
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() && metadata.len() == entry.size => {}
            _ => {
                debug!(path = %path.display(), "Cached output missing or resized");
                return Ok(None);
            }
        }

        let (sha256, _) = hash_file(&path).await?;
        if sha256 != entry.sha256 {
            debug!(path = %path.display(), "Cached output content changed");
            return Ok(None);
        }
        Ok(Some(path))
    }

    async fn store(&self, fingerprint: &str, output: &Path) -> Result<(), DownloadError> {
        let file_name = output
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| DownloadError::Cache {
                reason: format!("output path {} has no file name", output.display()),
            })?
            .to_string();
        let (sha256, size) = hash_file(output).await?;

        let _guard = self.lock.lock().await;
        let mut manifest = self.load().await?;
        manifest
            .entries
            .retain(|entry| entry.fingerprint != fingerprint);
        manifest.entries.push(CacheEntry {
            fingerprint: fingerprint.to_string(),
            sha256,
            size,
            file_name,
        });
        self.save(&manifest).await
    }
}

/// Hex SHA-256 and size of a file.
pub async fn hash_file(path: &Path) -> Result<(String, u64), DownloadError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> io::Result<(String, u64)> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let size = io::copy(&mut file, &mut hasher)?;
        Ok((hex::encode(hasher.finalize()), size))
    })
    .await
    .map_err(|e| DownloadError::Internal {
        reason: format!("hashing task failed: {e}"),
    })?
    .map_err(DownloadError::from)
}
