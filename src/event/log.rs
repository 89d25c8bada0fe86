//! Append-only marker log shared by the loader, builder, cache, and
//! runner: thread-safe, monotonic IDs, carries `Marker`s.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::marker::Marker;

/// Thread-safe, append-only marker log.
pub struct MarkerLog {
    next_id: AtomicU64,
    markers: RwLock<Vec<(u64, Marker)>>,
}

impl MarkerLog {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            markers: RwLock::new(Vec::new()),
        }
    }

    /// Push a marker, returning its monotonic sequence id.
    pub fn push(&self, marker: Marker) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.markers.write().push((id, marker));
        id
    }

    pub fn has_errors(&self) -> bool {
        self.markers.read().iter().any(|(_, m)| m.is_error())
    }

    pub fn len(&self) -> usize {
        self.markers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Marker> {
        self.markers.read().iter().map(|(_, m)| m.clone()).collect()
    }

    pub fn errors(&self) -> Vec<Marker> {
        self.markers
            .read()
            .iter()
            .filter(|(_, m)| m.is_error())
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl Default for MarkerLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_ids_are_monotonic() {
        let log = MarkerLog::new();
        let a = log.push(Marker::info("X", "one"));
        let b = log.push(Marker::info("X", "two"));
        assert!(b > a);
    }

    #[test]
    fn has_errors_reflects_severity() {
        let log = MarkerLog::new();
        assert!(!log.has_errors());
        log.push(Marker::warn("DataflowMismatch", "mismatch"));
        assert!(!log.has_errors());
        log.push(Marker::error("CircularDependency", "cycle"));
        assert!(log.has_errors());
    }

    #[test]
    fn errors_filters_to_error_severity_only() {
        let log = MarkerLog::new();
        log.push(Marker::warn("UnusedTask", "unused"));
        log.push(Marker::error("OverrideTargetMissing", "missing"));
        assert_eq!(log.errors().len(), 1);
        assert_eq!(log.snapshot().len(), 2);
    }
}
