//! Up-to-date tracking (§4.8): when caching is disabled, a task's
//! *memento* — a content hash of its effective parameters plus its
//! predecessors' mementos — is compared against the one persisted from
//! the previous run. A match (and no upstream `changed`) skips the
//! task with `changed = false`.
//!
//! Uses `xxhash-rust`'s xxh3 rather than the cache layer's MD5: this is
//! a cheap non-cryptographic fingerprint on a much hotter path (every
//! task, every run) and has no on-disk interchange contract to keep
//! stable, unlike the cache key.

use std::collections::BTreeMap;
use std::path::Path;

use xxhash_rust::xxh3::Xxh3;

use crate::error::{FlowError, Result};
use crate::store::DataItem;
use crate::value::Value;

const MEMENTO_FILE: &str = ".memento";
const OUTPUT_FILE: &str = ".memento-output.json";

pub fn compute(task_name: &str, params: &BTreeMap<String, Value>, input_mementos: &[&str]) -> String {
    let mut hasher = Xxh3::new();
    hasher.update(task_name.as_bytes());
    for (k, v) in params {
        hasher.update(k.as_bytes());
        hasher.update(v.to_string().as_bytes());
    }
    let mut sorted = input_mementos.to_vec();
    sorted.sort_unstable();
    for m in sorted {
        hasher.update(m.as_bytes());
    }
    format!("{:016x}", hasher.digest())
}

pub fn read(rundir: &Path) -> Option<String> {
    std::fs::read_to_string(rundir.join(MEMENTO_FILE))
        .ok()
        .map(|s| s.trim().to_string())
}

pub fn write(rundir: &Path, memento: &str) -> Result<()> {
    std::fs::create_dir_all(rundir).map_err(FlowError::Io)?;
    std::fs::write(rundir.join(MEMENTO_FILE), memento).map_err(FlowError::Io)
}

/// Persist the output produced alongside a fresh memento, so a later
/// up-to-date hit has something to hand back without re-running the body.
pub fn write_output(rundir: &Path, output: &[DataItem]) -> Result<()> {
    std::fs::create_dir_all(rundir).map_err(FlowError::Io)?;
    let json = serde_json::to_vec(output).map_err(|e| FlowError::CacheCorrupt {
        key: rundir.display().to_string(),
        reason: e.to_string(),
    })?;
    std::fs::write(rundir.join(OUTPUT_FILE), json).map_err(FlowError::Io)
}

/// Read back the output an up-to-date hit should reuse instead of
/// re-running the body. Missing or unparseable output is treated as
/// empty rather than a hard error — the memento itself already decided
/// the task is up to date.
pub fn read_output(rundir: &Path) -> Option<Vec<DataItem>> {
    let bytes = std::fs::read(rundir.join(OUTPUT_FILE)).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_produce_identical_mementos() {
        let mut params = BTreeMap::new();
        params.insert("opt".to_string(), Value::from("O2"));
        let a = compute("pkg.build", &params, &["abc"]);
        let b = compute("pkg.build", &params, &["abc"]);
        assert_eq!(a, b);
    }

    #[test]
    fn differing_params_change_the_memento() {
        let mut params_a = BTreeMap::new();
        params_a.insert("opt".to_string(), Value::from("O2"));
        let mut params_b = BTreeMap::new();
        params_b.insert("opt".to_string(), Value::from("O0"));
        assert_ne!(compute("pkg.build", &params_a, &[]), compute("pkg.build", &params_b, &[]));
    }

    #[test]
    fn read_write_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "deadbeef1234abcd").unwrap();
        assert_eq!(read(dir.path()).as_deref(), Some("deadbeef1234abcd"));
    }

    #[test]
    fn read_missing_memento_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read(dir.path()).is_none());
    }

    #[test]
    fn output_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let output = vec![DataItem::new("std.Message").with_attr("value", "hi")];
        write_output(dir.path(), &output).unwrap();
        assert_eq!(read_output(dir.path()), Some(output));
    }

    #[test]
    fn missing_output_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_output(dir.path()).is_none());
    }
}
