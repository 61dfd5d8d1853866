//! Filesystem-backed artifact store.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::fakes::expired;
use crate::storage_traits::*;

/// Artifact store rooted at a directory.
///
/// Layout:
/// - `<root>/<run_id>/<job>/data/<path>`: artifact bytes
/// - `<root>/<run_id>/<job>/meta/<path>.json`: `ArtifactMeta` sidecar
///
/// Pruning removes the bytes but keeps the sidecar, so a later read still
/// reports `Expired` instead of `NotFound`.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Create a store rooted at `root`. Creates the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_dir(&self, run_id: &RunId, job_name: &str) -> StorageResult<PathBuf> {
        for segment in [run_id.0.as_str(), job_name] {
            if segment.is_empty()
                || segment == "."
                || segment == ".."
                || segment.contains(['/', '\\'])
            {
                return Err(StorageError::InvalidPath {
                    path: segment.to_string(),
                });
            }
        }
        Ok(self.root.join(&run_id.0).join(job_name))
    }

    fn data_path(&self, key: &ArtifactKey) -> StorageResult<PathBuf> {
        Ok(self
            .job_dir(&key.run_id, &key.job_name)?
            .join("data")
            .join(&key.path))
    }

    fn meta_path(&self, key: &ArtifactKey) -> StorageResult<PathBuf> {
        Ok(self
            .job_dir(&key.run_id, &key.job_name)?
            .join("meta")
            .join(format!("{}.json", key.path)))
    }

    fn read_meta(path: &Path) -> StorageResult<ArtifactMeta> {
        let raw = fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Write `data` to `path` atomically, failing if `path` already exists.
    fn write_once(path: &Path, data: &[u8], key: &ArtifactKey) -> StorageResult<()> {
        let dir = path.parent().ok_or_else(|| StorageError::InvalidPath {
            path: key.path.clone(),
        })?;
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.persist_noclobber(path).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                StorageError::AlreadyExists {
                    key: key.to_string(),
                }
            } else {
                StorageError::Io(e.error)
            }
        })?;
        Ok(())
    }

    /// All sidecar files below `dir`, recursively.
    fn collect_meta_files(dir: &Path, out: &mut Vec<PathBuf>) -> StorageResult<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                Self::collect_meta_files(&path, out)?;
            } else if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                out.push(path);
            }
        }
        Ok(())
    }

    fn all_meta_files(&self) -> StorageResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for run in fs::read_dir(&self.root)? {
            let run = run?.path();
            if !run.is_dir() {
                continue;
            }
            for job in fs::read_dir(&run)? {
                let job = job?.path();
                if job.is_dir() {
                    Self::collect_meta_files(&job.join("meta"), &mut files)?;
                }
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        key: &ArtifactKey,
        data: &[u8],
        retention: Retention,
    ) -> StorageResult<ArtifactMeta> {
        let meta_path = self.meta_path(key)?;
        if meta_path.exists() {
            return Err(StorageError::AlreadyExists {
                key: key.to_string(),
            });
        }

        let created_at = Utc::now();
        let meta = ArtifactMeta {
            key: key.clone(),
            digest: ContentDigest::from_bytes(data),
            size: data.len() as u64,
            created_at,
            expires_at: retention.expires_at(created_at),
        };

        // The data file is the put-once commit point; the sidecar follows.
        // A failed sidecar write rolls the data file back so the key stays free.
        let data_path = self.data_path(key)?;
        let sidecar = serde_json::to_vec_pretty(&meta)?;
        Self::write_once(&data_path, data, key)?;
        if let Err(e) = Self::write_once(&meta_path, &sidecar, key) {
            if let Err(cleanup) = fs::remove_file(&data_path) {
                warn!(artifact = %key, error = %cleanup, "failed to roll back artifact data");
            }
            return Err(e);
        }
        debug!(artifact = %key, size = meta.size, "artifact stored");
        Ok(meta)
    }

    async fn get_at(&self, key: &ArtifactKey, now: DateTime<Utc>) -> StorageResult<Vec<u8>> {
        let meta_path = self.meta_path(key)?;
        if !meta_path.exists() {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        }
        let meta = Self::read_meta(&meta_path)?;
        if meta.is_expired(now) {
            return Err(expired(&meta));
        }
        match fs::read(self.data_path(key)?) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(expired(&meta)),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, run_id: &RunId, job_name: &str) -> StorageResult<Vec<ArtifactMeta>> {
        let mut files = Vec::new();
        Self::collect_meta_files(&self.job_dir(run_id, job_name)?.join("meta"), &mut files)?;

        let mut metas = Vec::new();
        for file in files {
            let meta = Self::read_meta(&file)?;
            if self.data_path(&meta.key)?.exists() {
                metas.push(meta);
            }
        }
        metas.sort_by(|a, b| a.key.path.cmp(&b.key.path));
        Ok(metas)
    }

    async fn prune(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let mut removed = 0;
        for file in self.all_meta_files()? {
            let meta = Self::read_meta(&file)?;
            if !meta.is_expired(now) {
                continue;
            }
            match fs::remove_file(self.data_path(&meta.key)?) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}
