//! String interning for recurring task/package names
//!
//! Ensures each unique name string is stored only once in memory. Uses
//! DashMap for lock-free concurrent access.
//!
//! Performance benefits:
//! - Memory: single allocation per unique string
//! - Comparison: pointer equality instead of string comparison
//! - Cloning: `Arc::clone` is O(1), no string copy

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

static INTERNER: Lazy<Interner> = Lazy::new(Interner::new);

/// Thread-safe string interner backed by a `DashMap`.
pub struct Interner {
    strings: DashMap<Arc<str>, ()>,
}

impl Interner {
    pub fn new() -> Self {
        Self {
            strings: DashMap::new(),
        }
    }

    /// Intern a string, returning a shared `Arc<str>`.
    pub fn intern(&self, s: &str) -> Arc<str> {
        let key: Arc<str> = Arc::from(s);
        if let Some(existing) = self.strings.get(&key) {
            return Arc::clone(existing.key());
        }
        self.strings.insert(Arc::clone(&key), ());
        key
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

/// Intern a string against the process-global interner.
pub fn intern(s: &str) -> Arc<str> {
    INTERNER.intern(s)
}
