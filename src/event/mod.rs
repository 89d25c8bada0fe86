//! Diagnostics module (C9): structured markers plus the scheduler's
//! listener contract.

pub mod listener;
pub mod log;
pub mod marker;

pub use listener::{NoopListener, RecordingListener, TaskEvent, TaskListener};
pub use log::MarkerLog;
pub use marker::{Location, Marker, Severity};
