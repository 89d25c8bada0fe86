//! Cache storage backends (§4.5): an ordered chain of providers, first-
//! hit-wins on lookup, first-writable-wins on store. The default and
//! only provider shipped here is a local directory tree; the trait
//! boundary exists so a remote/shared backend can be added later
//! without touching the restore/store orchestration in `mod.rs`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::util::constants::LOCK_TIMEOUT;

use super::lock::{self, LockKind};

/// On-disk (or otherwise persisted) representation of a cache entry,
/// written as `<key_dir>/metadata.json` next to `output.json` and the
/// artifact blob (§4.5, §6 stable layout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// The task's declared outputs with absolute rundir paths replaced
    /// by `${{ rundir }}` placeholders, re-expanded on restore.
    pub output_template: serde_json::Value,
    pub artifacts_path: Option<String>,
    pub compression: Compression,
    pub created_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Gzip,
}

/// A cache storage backend. Implementors need not be local directories;
/// the chain in [`crate::cache::CacheLayer`] treats every provider
/// uniformly through this trait.
pub trait CacheProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this provider currently accepts writes (a read-only
    /// mirror, for instance, would return `false`).
    fn is_writable(&self) -> bool;

    fn lookup(&self, key: &str) -> Result<Option<CacheEntry>>;

    fn store(&self, entry: &CacheEntry, artifacts_dir: Option<&Path>) -> Result<()>;

    /// Absolute path to the artifact blob (directory tree or tarball)
    /// for a given key, if present, used by the restorer to extract.
    fn artifacts_location(&self, key: &str) -> Result<Option<PathBuf>>;
}

/// The default provider: `<cache-root>/<task-name>/<hash>/{output.json,
/// metadata.json, artifacts/ | artifacts.tar.gz, .lock}`.
pub struct DirCacheProvider {
    root: PathBuf,
    writable: bool,
    lock_timeout: Duration,
}

impl DirCacheProvider {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            writable: true,
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    pub fn read_only(root: PathBuf) -> Self {
        Self {
            root,
            writable: false,
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    /// `<root>/<task_name>/<hash>` for a validated `task:hash` key.
    fn key_dir(&self, key: &str) -> Result<PathBuf> {
        let (task, hash) = split_key(key)?;
        Ok(self.root.join(task).join(hash))
    }

    fn ensure_cache_root_marker(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root).map_err(FlowError::Io)?;
        let marker = self.root.join(".cache_config.yaml");
        if !marker.exists() {
            let contents = format!(
                "type: directory\nversion: 1\nshared: false\ncreated: {}\n",
                Utc::now().to_rfc3339()
            );
            std::fs::write(&marker, contents).map_err(FlowError::Io)?;
        }
        Ok(())
    }
}

/// The on-disk sidecar next to `output.json`, matching the §6 stable
/// contract's `metadata.json` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Metadata {
    key: String,
    created_at: DateTime<Utc>,
    compression: Compression,
    artifacts_path: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, String>,
}

/// Splits and validates a `task:hash`-form cache key (§4.5 malformed-key
/// guard).
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    key.split_once(':')
        .filter(|(task, hash)| !task.is_empty() && !hash.is_empty())
        .ok_or_else(|| FlowError::MalformedCacheKey { key: key.to_string() })
}

impl CacheProvider for DirCacheProvider {
    fn name(&self) -> &str {
        "dir"
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn lookup(&self, key: &str) -> Result<Option<CacheEntry>> {
        let key_dir = self.key_dir(key)?;
        let output_path = key_dir.join("output.json");
        let metadata_path = key_dir.join("metadata.json");
        if !output_path.exists() || !metadata_path.exists() {
            return Ok(None);
        }

        let _guard = lock::acquire(key, &key_dir, LockKind::Shared, self.lock_timeout)?;

        let output_raw = std::fs::read_to_string(&output_path).map_err(FlowError::Io)?;
        let output_template: serde_json::Value =
            serde_json::from_str(&output_raw).map_err(|e| FlowError::CacheCorrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        let metadata_raw = std::fs::read_to_string(&metadata_path).map_err(FlowError::Io)?;
        let metadata: Metadata = serde_json::from_str(&metadata_raw).map_err(|e| FlowError::CacheCorrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Some(CacheEntry {
            key: metadata.key,
            output_template,
            artifacts_path: metadata.artifacts_path,
            compression: metadata.compression,
            created_at: metadata.created_at,
            metadata: metadata.extra,
        }))
    }

    fn store(&self, entry: &CacheEntry, artifacts_dir: Option<&Path>) -> Result<()> {
        if !self.writable {
            return Err(FlowError::CacheStoreFailed {
                key: entry.key.clone(),
                reason: format!("provider `{}` is read-only", self.name()),
            });
        }

        self.ensure_cache_root_marker()?;
        let key_dir = self.key_dir(&entry.key)?;
        std::fs::create_dir_all(&key_dir).map_err(FlowError::Io)?;

        let _guard = lock::acquire(&entry.key, &key_dir, LockKind::Exclusive, self.lock_timeout)?;

        let output_path = key_dir.join("output.json");
        let output_serialized =
            serde_json::to_string_pretty(&entry.output_template).map_err(|e| FlowError::CacheStoreFailed {
                key: entry.key.clone(),
                reason: e.to_string(),
            })?;
        std::fs::write(&output_path, output_serialized).map_err(FlowError::Io)?;

        let metadata_path = key_dir.join("metadata.json");
        let metadata = Metadata {
            key: entry.key.clone(),
            created_at: entry.created_at,
            compression: entry.compression,
            artifacts_path: entry.artifacts_path.clone(),
            extra: entry.metadata.clone(),
        };
        let metadata_serialized = serde_json::to_string_pretty(&metadata).map_err(|e| FlowError::CacheStoreFailed {
            key: entry.key.clone(),
            reason: e.to_string(),
        })?;
        std::fs::write(&metadata_path, metadata_serialized).map_err(FlowError::Io)?;

        if let Some(src) = artifacts_dir {
            match entry.compression {
                Compression::None => {
                    let dest = key_dir.join("artifacts");
                    copy_dir_recursive(src, &dest).map_err(|e| FlowError::CacheStoreFailed {
                        key: entry.key.clone(),
                        reason: e.to_string(),
                    })?;
                }
                Compression::Gzip => {
                    let dest = key_dir.join("artifacts.tar.gz");
                    write_gzip_tarball(src, &dest).map_err(|e| FlowError::CacheStoreFailed {
                        key: entry.key.clone(),
                        reason: e.to_string(),
                    })?;
                }
            }
        }

        Ok(())
    }

    fn artifacts_location(&self, key: &str) -> Result<Option<PathBuf>> {
        let key_dir = self.key_dir(key)?;
        let dir_form = key_dir.join("artifacts");
        if dir_form.exists() {
            return Ok(Some(dir_form));
        }
        let tar_form = key_dir.join("artifacts.tar.gz");
        if tar_form.exists() {
            return Ok(Some(tar_form));
        }
        Ok(None)
    }
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry.path().strip_prefix(src).map_err(std::io::Error::other)?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn write_gzip_tarball(src: &Path, dest: &Path) -> std::io::Result<()> {
    let file = std::fs::File::create(dest)?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", src)?;
    builder.into_inner()?.finish()?;
    Ok(())
}
