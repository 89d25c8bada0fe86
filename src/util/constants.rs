//! Centralized constants for flowmgr runtime configuration
//!
//! All timeout and limit values in one place for easy tuning.

use std::time::Duration;

// ═══════════════════════════════════════════════════════════════
// Execution Timeouts
// ═══════════════════════════════════════════════════════════════

/// Timeout for shell task bodies and `exec()`/`exec_parallel()` calls.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for acquiring a cache-entry file lock.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// Default timeout for a `run_subgraph()` call when the caller does not
/// supply its own.
pub const RUN_SUBGRAPH_TIMEOUT: Duration = Duration::from_secs(600);

/// Timeout for a jobserver token acquisition when the caller supplies
/// none explicitly (tests typically pass a much shorter one).
pub const JOBSERVER_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(300);

// ═══════════════════════════════════════════════════════════════
// Expression Layer
// ═══════════════════════════════════════════════════════════════

/// Maximum recursion depth for nested `${{ ... }}` substitution.
pub const MAX_EXPANSION_DEPTH: usize = 16;

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_positive() {
        assert!(EXEC_TIMEOUT.as_secs() > 0);
        assert!(LOCK_TIMEOUT.as_secs() > 0);
        assert!(RUN_SUBGRAPH_TIMEOUT.as_secs() > 0);
        assert!(JOBSERVER_ACQUIRE_TIMEOUT.as_secs() > 0);
    }

    #[test]
    fn lock_timeout_matches_spec_default() {
        assert_eq!(LOCK_TIMEOUT, Duration::from_secs(300));
    }

    #[test]
    fn expansion_depth_is_reasonable() {
        const _: () = {
            assert!(MAX_EXPANSION_DEPTH >= 4);
            assert!(MAX_EXPANSION_DEPTH <= 64);
        };
    }
}
