//! Builder helpers shared by the crate's own unit tests and the
//! `tests/` integration suite, exposed behind the `test-fixtures`
//! feature for the self-referential `dev-dependencies` entry.

use std::fs;
use std::path::{Path, PathBuf};

use crate::event::MarkerLog;
use crate::graph::{Builder, Overrides, Registry, TaskGraph};
use crate::loader::{Loader, PackageArena};
use crate::runtime::{BodyRegistry, RunOutcome, Scheduler};
use crate::{FlowError, RunConfig};

/// Write `contents` to `<dir>/<name>` and return the full path. `name`
/// should carry a `.yaml`/`.yml`/`.toml` extension so the loader picks
/// the right encoding.
pub fn write_package(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create package parent dir");
    }
    fs::write(&path, contents).expect("write package file");
    path
}

/// Load a package tree rooted at `path` with no generators or overrides.
pub fn load(path: &Path) -> crate::error::Result<(PackageArena, crate::loader::PackageId)> {
    Loader::new().load(path)
}

/// Load and elaborate `path` into a [`TaskGraph`] rooted at `task`,
/// collecting diagnostics into a fresh [`MarkerLog`] returned alongside
/// it so a caller can assert on warnings without running anything.
pub fn build_graph(path: &Path, task: &str, rundir: &Path) -> crate::error::Result<(TaskGraph, MarkerLog)> {
    let (arena, _root_id) = load(path)?;
    let markers = MarkerLog::new();
    let registry = Registry::new();
    let overrides = Overrides::new();
    let graph = Builder::new(&arena, &registry, &overrides, rundir.to_path_buf(), &markers).build(task)?;
    Ok((graph, markers))
}

/// Load, elaborate, and run `task` from `path` end to end with the
/// standard library bodies registered and caching disabled, returning
/// the scheduler's [`RunOutcome`]. Intended for integration tests that
/// want the full pipeline without hand-wiring every collaborator.
pub async fn run_package(path: &Path, task: &str, rundir: &Path) -> crate::error::Result<RunOutcome> {
    let (arena, _root_id) = load(path)?;
    let markers = MarkerLog::new();
    let registry = Registry::new();
    let overrides = Overrides::new();
    let graph = Builder::new(&arena, &registry, &overrides, rundir.to_path_buf(), &markers).build(task)?;

    if markers.has_errors() {
        return Err(FlowError::SchemaValidation {
            file: path.display().to_string(),
            line: 0,
            column: 0,
            field: "(elaboration)".to_string(),
            suggestion: "graph elaboration produced error markers; see markers for detail".to_string(),
        });
    }

    let mut bodies = BodyRegistry::new();
    crate::stdlib::register(&mut bodies);

    let config = RunConfig::from_env(rundir.to_path_buf())?.with_cache_root(None);

    let scheduler = Scheduler::new(
        std::sync::Arc::new(arena),
        std::sync::Arc::new(bodies),
        None,
        config,
        std::sync::Arc::new(markers),
        std::sync::Arc::new(crate::event::NoopListener),
    );
    scheduler.run(graph).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_package_executes_a_minimal_single_task_package() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = write_package(
            dir.path(),
            "flow.yaml",
            "package:\n  name: proj\ntasks:\n  hello:\n    shell: \"echo hi\"\n",
        );
        let rundir = dir.path().join("run");
        let outcome = run_package(&pkg, "proj.hello", &rundir).await.unwrap();
        assert!(outcome.is_success("proj.hello"));
    }
}
