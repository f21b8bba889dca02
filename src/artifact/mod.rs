//! Staged download, verification and atomic activation of large artifacts
//! (model weights).
//!
//! On-disk layout under the models directory:
//!
//! ```text
//! <root>/<id>/<file>            active artifact ("ready")
//! <root>/<id>.partial/<file>    staging, never read by consumers
//! <root>/<id>.retired-<uuid>/   previous version, removed after activation
//! ```
//!
//! An artifact is ready iff `<root>/<id>` exists, and the only way that
//! directory comes into being is a rename of a verified staging directory.
//! Anything that goes wrong before that rename leaves `<root>/<id>` untouched.

pub mod source;

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::ArtifactEntry;
use crate::rpc::{ErrorKind, RpcError};
use crate::session::{ModelState, ModelStatus, Progress};

pub use source::{ArtifactSource, HttpSource, ProgressFn};

const STAGING_SUFFIX: &str = ".partial";
const RETIRED_MARKER: &str = ".retired-";

// ---------------------------------------------------------------------------
// ArtifactError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("unknown artifact {0}")]
    Unknown(String),

    #[error("invalid artifact id {0:?}")]
    InvalidId(String),

    #[error("invalid artifact file name {0:?}")]
    InvalidFileName(String),

    #[error("artifact {0} is in use")]
    InUse(String),

    #[error("artifact {0} is already downloading")]
    Busy(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("{id}: expected {expected} bytes, got {actual}")]
    SizeMismatch { id: String, expected: u64, actual: u64 },

    #[error("{id}: checksum mismatch (expected {expected}, got {actual})")]
    ChecksumMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ArtifactError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArtifactError::Unknown(_)
            | ArtifactError::InvalidId(_)
            | ArtifactError::InvalidFileName(_) => ErrorKind::InvalidParams,
            ArtifactError::InUse(_) | ArtifactError::Busy(_) => ErrorKind::NotReady,
            ArtifactError::Download(_) => ErrorKind::Network,
            ArtifactError::SizeMismatch { .. } | ArtifactError::ChecksumMismatch { .. } => {
                ErrorKind::CacheCorrupt
            }
            ArtifactError::Io(e) if is_disk_full(e) => ErrorKind::DiskFull,
            ArtifactError::Io(_) => ErrorKind::Internal,
        }
    }
}

fn is_disk_full(e: &io::Error) -> bool {
    // ENOSPC
    cfg!(unix) && e.raw_os_error() == Some(28)
}

impl From<ArtifactError> for RpcError {
    fn from(e: ArtifactError) -> Self {
        RpcError::new(e.kind(), e.to_string())
    }
}

// ---------------------------------------------------------------------------
// ArtifactSpec
// ---------------------------------------------------------------------------

/// What to fetch and how to check it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub id: String,
    pub url: String,
    pub file_name: String,
    /// Lower-case hex SHA-256.
    pub sha256: String,
    pub size_bytes: u64,
}

impl From<&ArtifactEntry> for ArtifactSpec {
    fn from(entry: &ArtifactEntry) -> Self {
        Self {
            id: entry.id.clone(),
            url: entry.url.clone(),
            file_name: entry.file_name.clone(),
            sha256: entry.sha256.to_ascii_lowercase(),
            size_bytes: entry.size_bytes,
        }
    }
}

// ---------------------------------------------------------------------------
// ArtifactManager
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ArtifactManager {
    root: PathBuf,
    in_use: Mutex<HashSet<String>>,
    downloading: Mutex<HashSet<String>>,
}

/// Removes the id from `downloading` however the download ends.
struct DownloadGuard<'a> {
    manager: &'a ArtifactManager,
    id: String,
}

impl Drop for DownloadGuard<'_> {
    fn drop(&mut self) {
        lock(&self.manager.downloading).remove(&self.id);
    }
}

fn lock(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}

fn validate_id(id: &str) -> Result<(), ArtifactError> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\'])
        || id.ends_with(STAGING_SUFFIX)
        || id.contains(RETIRED_MARKER);
    if bad {
        return Err(ArtifactError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// The file must land directly inside its artifact directory.
fn validate_file_name(name: &str) -> Result<(), ArtifactError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(ArtifactError::InvalidFileName(name.to_string()));
    }
    Ok(())
}

impl ArtifactManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            in_use: Mutex::new(HashSet::new()),
            downloading: Mutex::new(HashSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Canonical location of an active artifact.
    pub fn final_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn staging_dir(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}{STAGING_SUFFIX}"))
    }

    pub fn is_ready(&self, id: &str) -> bool {
        validate_id(id).is_ok() && self.final_dir(id).is_dir()
    }

    pub fn status(&self, id: &str) -> ModelStatus {
        if lock(&self.downloading).contains(id) {
            return ModelStatus {
                status: ModelState::Downloading,
                ..ModelStatus::default()
            };
        }
        if self.is_ready(id) {
            ModelStatus::ready()
        } else {
            ModelStatus::default()
        }
    }

    // ---- in-use tracking ---

    /// Mark an artifact as loaded; purge will refuse it until released.
    pub fn mark_in_use(&self, id: &str) {
        lock(&self.in_use).insert(id.to_string());
    }

    pub fn release(&self, id: &str) {
        lock(&self.in_use).remove(id);
    }

    pub fn is_in_use(&self, id: &str) -> bool {
        lock(&self.in_use).contains(id)
    }

    // ---- lifecycle ---

    /// Download into staging, verify, then activate by rename.
    ///
    /// Already-active artifacts are returned as-is.  `progress` receives
    /// byte counts against the expected size.
    pub async fn install(
        &self,
        spec: &ArtifactSpec,
        source: &dyn ArtifactSource,
        progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> Result<PathBuf, ArtifactError> {
        validate_id(&spec.id)?;
        validate_file_name(&spec.file_name)?;
        let final_dir = self.final_dir(&spec.id);
        if final_dir.is_dir() {
            log::debug!("artifact: {} already active", spec.id);
            return Ok(final_dir);
        }

        if !lock(&self.downloading).insert(spec.id.clone()) {
            return Err(ArtifactError::Busy(spec.id.clone()));
        }
        let _guard = DownloadGuard {
            manager: self,
            id: spec.id.clone(),
        };

        let staging = self.staging_dir(&spec.id);
        let result = self.stage_and_verify(spec, &staging, source, progress).await;
        if let Err(e) = result {
            log::warn!("artifact: {} failed: {e}", spec.id);
            if let Err(cleanup) = remove_dir_if_exists(&staging).await {
                log::warn!("artifact: could not remove {}: {cleanup}", staging.display());
            }
            return Err(e);
        }

        self.activate(&spec.id).await?;
        log::info!("artifact: {} ready at {}", spec.id, final_dir.display());
        Ok(final_dir)
    }

    async fn stage_and_verify(
        &self,
        spec: &ArtifactSpec,
        staging: &Path,
        source: &dyn ArtifactSource,
        progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> Result<(), ArtifactError> {
        remove_dir_if_exists(staging).await?;
        tokio::fs::create_dir_all(staging).await?;
        let file_path = staging.join(&spec.file_name);

        log::info!("artifact: downloading {} from {}", spec.id, spec.url);
        let mut file = tokio::fs::File::create(&file_path).await?;
        let total = spec.size_bytes;
        let report = |current: u64| {
            progress(Progress {
                current,
                total: Some(total),
                unit: "bytes".into(),
            })
        };
        source.fetch(&spec.url, &mut file, &report).await?;
        file.sync_all().await?;
        drop(file);

        verify(spec, &file_path).await
    }

    /// Rename staging over the canonical location.  An existing version is
    /// moved aside first and deleted afterwards.
    async fn activate(&self, id: &str) -> Result<(), ArtifactError> {
        let staging = self.staging_dir(id);
        let final_dir = self.final_dir(id);

        let retired = if final_dir.exists() {
            let aside = self
                .root
                .join(format!("{id}{RETIRED_MARKER}{}", uuid::Uuid::new_v4()));
            tokio::fs::rename(&final_dir, &aside).await?;
            Some(aside)
        } else {
            None
        };

        tokio::fs::rename(&staging, &final_dir).await?;

        if let Some(aside) = retired {
            if let Err(e) = tokio::fs::remove_dir_all(&aside).await {
                log::warn!("artifact: could not remove {}: {e}", aside.display());
            }
        }
        Ok(())
    }

    /// Remove one artifact, or every artifact when `id` is `None`.
    ///
    /// Refuses with [`ArtifactError::InUse`] (`E_NOT_READY`) while any
    /// targeted artifact is loaded.  Returns the ids removed.
    pub async fn purge(&self, id: Option<&str>) -> Result<Vec<String>, ArtifactError> {
        let targets = match id {
            Some(id) => {
                validate_id(id)?;
                vec![id.to_string()]
            }
            None => self.list().await?,
        };

        {
            let in_use = lock(&self.in_use);
            if let Some(busy) = targets.iter().find(|t| in_use.contains(*t)) {
                return Err(ArtifactError::InUse(busy.clone()));
            }
        }

        let mut removed = Vec::new();
        for target in targets {
            let existed = remove_dir_if_exists(&self.final_dir(&target)).await?;
            remove_dir_if_exists(&self.staging_dir(&target)).await?;
            if existed {
                removed.push(target);
            }
        }
        if id.is_none() {
            self.sweep_staging().await?;
        }
        log::info!("artifact: purged {removed:?}");
        Ok(removed)
    }

    /// Ids of active artifacts.
    pub async fn list(&self) -> Result<Vec<String>, ArtifactError> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() && validate_id(&name).is_ok() {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete leftover staging and retired directories (startup).
    pub async fn sweep_staging(&self) -> Result<usize, ArtifactError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut swept = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let leftover = name.ends_with(STAGING_SUFFIX) || name.contains(RETIRED_MARKER);
            if leftover && lock(&self.downloading).iter().all(|id| !name.starts_with(id.as_str())) {
                log::info!("artifact: removing stale {name}");
                tokio::fs::remove_dir_all(entry.path()).await?;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

/// Check size and SHA-256 of a staged file.
pub async fn verify(spec: &ArtifactSpec, path: &Path) -> Result<(), ArtifactError> {
    let actual_size = tokio::fs::metadata(path).await?.len();
    if actual_size != spec.size_bytes {
        return Err(ArtifactError::SizeMismatch {
            id: spec.id.clone(),
            expected: spec.size_bytes,
            actual: actual_size,
        });
    }

    let path = path.to_path_buf();
    let actual = tokio::task::spawn_blocking(move || -> io::Result<String> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

    if actual != spec.sha256 {
        return Err(ArtifactError::ChecksumMismatch {
            id: spec.id.clone(),
            expected: spec.sha256.clone(),
            actual,
        });
    }
    Ok(())
}

/// `Ok(true)` if something was removed.
async fn remove_dir_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
