//! Run configuration.
//!
//! Layered configuration: defaults → environment variables → explicit
//! overrides passed by the caller (e.g. a CLI flag). The layers here are
//! `nproc`, cache root, and scheduling toggles.

use std::path::PathBuf;

use crate::error::{FlowError, Result};

/// Effective configuration for a single run of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Bounded concurrency. Defaults to host CPU count.
    pub nproc: usize,
    /// Cache root directory, or `None` to disable caching entirely.
    pub cache_root: Option<PathBuf>,
    /// Whether `run_subgraph` schedules into the same queue (`true`) or
    /// falls back to a nested scheduler instance (`false`).
    pub dynamic_scheduling: bool,
    /// Root rundir for the run.
    pub rundir: PathBuf,
}

impl RunConfig {
    /// Build configuration from environment variables, falling back to
    /// host defaults. Explicit values passed to a CLI or test harness
    /// should be applied on top of this via the builder methods below.
    pub fn from_env(rundir: PathBuf) -> Result<Self> {
        let nproc = match std::env::var("FLOWMGR_NPROC") {
            Ok(v) if !v.is_empty() => v
                .parse::<usize>()
                .map_err(|_| FlowError::InvalidNproc {
                    nproc: v.parse::<i64>().unwrap_or(-1),
                })?,
            _ => std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        };

        let cache_root = std::env::var("FLOWMGR_CACHE").ok().map(PathBuf::from);

        Ok(Self {
            nproc,
            cache_root,
            dynamic_scheduling: true,
            rundir,
        })
    }

    pub fn with_nproc(mut self, nproc: usize) -> Self {
        self.nproc = nproc;
        self
    }

    pub fn with_cache_root(mut self, root: Option<PathBuf>) -> Self {
        self.cache_root = root;
        self
    }

    pub fn with_dynamic_scheduling(mut self, enabled: bool) -> Self {
        self.dynamic_scheduling = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.nproc < 1 {
            return Err(FlowError::InvalidNproc {
                nproc: self.nproc as i64,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_defaults_nproc_to_host_parallelism() {
        std::env::remove_var("FLOWMGR_NPROC");
        let cfg = RunConfig::from_env(PathBuf::from("/tmp/run")).unwrap();
        assert!(cfg.nproc >= 1);
        assert!(cfg.dynamic_scheduling);
    }

    #[test]
    fn from_env_honors_flowmgr_nproc() {
        std::env::set_var("FLOWMGR_NPROC", "3");
        let cfg = RunConfig::from_env(PathBuf::from("/tmp/run")).unwrap();
        assert_eq!(cfg.nproc, 3);
        std::env::remove_var("FLOWMGR_NPROC");
    }

    #[test]
    fn validate_rejects_zero_nproc() {
        let cfg = RunConfig {
            nproc: 0,
            cache_root: None,
            dynamic_scheduling: true,
            rundir: PathBuf::from("/tmp/run"),
        };
        assert!(matches!(cfg.validate(), Err(FlowError::InvalidNproc { .. })));
    }

    #[test]
    fn builder_methods_override_fields() {
        let cfg = RunConfig::from_env(PathBuf::from("/tmp/run"))
            .unwrap()
            .with_nproc(4)
            .with_cache_root(Some(PathBuf::from("/tmp/cache")))
            .with_dynamic_scheduling(false);
        assert_eq!(cfg.nproc, 4);
        assert_eq!(cfg.cache_root, Some(PathBuf::from("/tmp/cache")));
        assert!(!cfg.dynamic_scheduling);
    }
}
