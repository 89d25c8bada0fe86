//! Content-addressed cache layer (C5, §4.5): a pluggable hash provider
//! turns a task's effective inputs into a digest, an ordered chain of
//! storage providers looks the digest up or stores a fresh entry, and a
//! restorer re-expands the stored output template against a new rundir
//! on a hit.

pub mod hash;
pub mod lock;
pub mod provider;

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::{FlowError, Result};
use crate::expr::{substitute, Scope};
use crate::value::Value;

pub use hash::{compute_cache_key, HashInput, HashProvider, HashProviderRegistry, HashRecipe};
pub use provider::{split_key, CacheEntry, CacheProvider, Compression, DirCacheProvider};

/// The restored result of a cache hit: the re-expanded output records
/// (already deserialized from the template) plus where, if anywhere,
/// the cached artifacts were extracted to.
pub struct RestoredEntry {
    pub output: serde_json::Value,
    pub artifacts_dir: Option<PathBuf>,
}

/// Ties the hash registry and the provider chain together behind the
/// single `lookup`/`store` surface the scheduler (C7) calls into.
pub struct CacheLayer {
    providers: Vec<Box<dyn CacheProvider>>,
    hash_registry: HashProviderRegistry,
}

impl CacheLayer {
    pub fn new(providers: Vec<Box<dyn CacheProvider>>) -> Self {
        Self {
            providers,
            hash_registry: HashProviderRegistry::with_defaults(),
        }
    }

    /// A single local-directory provider rooted at `cache_root`, the
    /// common case driven by [`crate::config::RunConfig::cache_root`].
    pub fn local(cache_root: PathBuf) -> Self {
        Self::new(vec![Box::new(DirCacheProvider::new(cache_root))])
    }

    pub fn compute_key(&self, recipe: &HashRecipe<'_>) -> Result<String> {
        compute_cache_key(recipe, &self.hash_registry)
    }

    /// First-hit-wins lookup across the provider chain.
    pub fn lookup(&self, key: &str) -> Result<Option<(CacheEntry, &dyn CacheProvider)>> {
        for provider in &self.providers {
            if let Some(entry) = provider.lookup(key)? {
                return Ok(Some((entry, provider.as_ref())));
            }
        }
        Ok(None)
    }

    /// First-writable-wins store. `CacheStoreFailed` — whether from an
    /// empty provider chain or from the chosen provider's own write
    /// failing — is returned to the caller, who per §4.5 treats it as a
    /// warning rather than failing the task.
    pub fn store(&self, key: String, output_template: serde_json::Value, artifacts_dir: Option<&Path>) -> Result<()> {
        let provider = self.providers.iter().find(|p| p.is_writable()).ok_or_else(|| FlowError::CacheStoreFailed {
            key: key.clone(),
            reason: "no writable cache provider is configured".to_string(),
        })?;

        let entry = CacheEntry {
            key,
            output_template,
            artifacts_path: artifacts_dir.map(|p| p.display().to_string()),
            compression: if artifacts_dir.is_some() {
                Compression::Gzip
            } else {
                Compression::None
            },
            created_at: Utc::now(),
            metadata: Default::default(),
        };
        provider.store(&entry, artifacts_dir)
    }

    /// Restore a cache hit into `rundir`: extract artifacts (directory
    /// copy or tarball unpack) and re-expand `${{ rundir }}` in the
    /// stored output template.
    pub fn restore(&self, entry: &CacheEntry, provider: &dyn CacheProvider, rundir: &Path) -> Result<RestoredEntry> {
        let artifacts_dir = match provider.artifacts_location(&entry.key)? {
            Some(location) => Some(extract_artifacts(&location, rundir, &entry.key)?),
            None => None,
        };

        let scope = Scope::new().with_locals(
            [("rundir".to_string(), Value::from(rundir.display().to_string()))]
                .into_iter()
                .collect(),
        );
        let output = re_expand(&entry.output_template, &scope)?;

        Ok(RestoredEntry { output, artifacts_dir })
    }
}

/// Extracts a stored artifact blob into `rundir`, guarding against a
/// path inside the archive/tree escaping `rundir` via `..` components
/// (§4.5 path-traversal guard).
fn extract_artifacts(location: &Path, rundir: &Path, key: &str) -> Result<PathBuf> {
    let dest = rundir.join("artifacts");
    std::fs::create_dir_all(&dest).map_err(FlowError::Io)?;

    if location.is_dir() {
        for entry in walkdir::WalkDir::new(location).min_depth(1) {
            let entry = entry.map_err(|e| FlowError::CacheCorrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
            let rel = entry
                .path()
                .strip_prefix(location)
                .map_err(|_| FlowError::PathTraversal {
                    key: key.to_string(),
                    path: entry.path().display().to_string(),
                })?;
            guard_no_parent_components(rel, key)?;
            let target = dest.join(rel);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target).map_err(FlowError::Io)?;
            } else {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(FlowError::Io)?;
                }
                std::fs::copy(entry.path(), &target).map_err(FlowError::Io)?;
            }
        }
    } else {
        let file = std::fs::File::open(location).map_err(FlowError::Io)?;
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        for file in archive.entries().map_err(FlowError::Io)? {
            let mut file = file.map_err(FlowError::Io)?;
            let rel = file.path().map_err(FlowError::Io)?.into_owned();
            guard_no_parent_components(&rel, key)?;
            let target = dest.join(&rel);
            target
                .strip_prefix(&dest)
                .map_err(|_| FlowError::PathTraversal {
                    key: key.to_string(),
                    path: rel.display().to_string(),
                })?;
            file.unpack(&target).map_err(FlowError::Io)?;
        }
    }

    Ok(dest)
}

fn guard_no_parent_components(path: &Path, key: &str) -> Result<()> {
    if path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(FlowError::PathTraversal {
            key: key.to_string(),
            path: path.display().to_string(),
        });
    }
    Ok(())
}

/// Replace every occurrence of `rundir`'s absolute path with the
/// `${{ rundir }}` placeholder in every string leaf of `template` (§4.5:
/// "absolute paths replaced by `${{ rundir }}` placeholders so they can
/// be re-expanded on restore to a new rundir"). Call this on a task's
/// output before handing it to [`CacheLayer::store`]; [`CacheLayer::restore`]
/// undoes it via [`re_expand`].
pub fn templatize_rundir(template: &serde_json::Value, rundir: &Path) -> serde_json::Value {
    let rundir_str = rundir.display().to_string();
    templatize_value(template, &rundir_str)
}

fn templatize_value(value: &serde_json::Value, rundir_str: &str) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(s.replace(rundir_str, "${{ rundir }}")),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| templatize_value(v, rundir_str)).collect())
        }
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), templatize_value(v, rundir_str));
            }
            serde_json::Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Re-expand every string leaf of a JSON output template against
/// `scope`, in particular substituting `${{ rundir }}` placeholders.
fn re_expand(template: &serde_json::Value, scope: &Scope) -> Result<serde_json::Value> {
    match template {
        serde_json::Value::String(s) => {
            let value = substitute(s, scope)?;
            Ok(value.to_json())
        }
        serde_json::Value::Array(items) => {
            let expanded: Result<Vec<_>> = items.iter().map(|v| re_expand(v, scope)).collect();
            Ok(serde_json::Value::Array(expanded?))
        }
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), re_expand(v, scope)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn lookup_miss_then_store_then_hit_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheLayer::local(dir.path().to_path_buf());

        let params = BTreeMap::new();
        let env = BTreeMap::new();
        let recipe = HashRecipe {
            task_name: "pkg.build",
            params: &params,
            inputs: vec![],
            env: &env,
            shell_stamps: &[],
        };
        let key = cache.compute_key(&recipe).unwrap();
        assert!(cache.lookup(&key).unwrap().is_none());

        let template = serde_json::json!({"type": "std.FileSet", "path": "${{ rundir }}/out.bin"});
        cache.store(key.clone(), template, None).unwrap();

        let (entry, provider) = cache.lookup(&key).unwrap().unwrap();
        let rundir = dir.path().join("run1");
        std::fs::create_dir_all(&rundir).unwrap();
        let restored = cache.restore(&entry, provider, &rundir).unwrap();
        let expanded_path = restored.output["path"].as_str().unwrap();
        assert!(expanded_path.starts_with(&rundir.display().to_string()));
    }

    #[test]
    fn store_without_writable_provider_errors() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheLayer::new(vec![Box::new(DirCacheProvider::read_only(dir.path().to_path_buf()))]);
        let err = cache.store("pkg.t:abc".to_string(), serde_json::json!({}), None).unwrap_err();
        assert!(matches!(err, FlowError::CacheStoreFailed { .. }));
    }

    #[test]
    fn restore_with_directory_artifacts_copies_files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheLayer::local(dir.path().join("cache"));

        let artifacts_src = dir.path().join("build_out");
        std::fs::create_dir_all(&artifacts_src).unwrap();
        std::fs::write(artifacts_src.join("result.bin"), b"data").unwrap();

        cache
            .store("pkg.build:cafef00d".to_string(), serde_json::json!({}), Some(&artifacts_src))
            .unwrap();

        let (entry, provider) = cache.lookup("pkg.build:cafef00d").unwrap().unwrap();
        let rundir = dir.path().join("run2");
        std::fs::create_dir_all(&rundir).unwrap();
        let restored = cache.restore(&entry, provider, &rundir).unwrap();
        assert!(restored.artifacts_dir.unwrap().join("result.bin").exists());
    }
}
