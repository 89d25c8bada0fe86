//! Typed output items and the concurrent result store.
//!
//! A `DashMap<Arc<str>, TaskResult>` keyed by node name, with
//! `is_success`/`get_output` accessors and dotted-path resolution
//! delegated to a jsonpath helper. Each `TaskResult` carries a list of
//! typed `DataItem`s plus markers and cache-hit/changed bits, rather
//! than a single JSON output blob per task.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::event::Marker;
use crate::value::Value;

/// A single output record produced by a task. Every item must carry a
/// non-empty `type` (§3 invariant); the builder/runner reject items that
/// don't.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataItem {
    #[serde(rename = "type")]
    pub type_name: String,
    pub attrs: std::collections::BTreeMap<String, Value>,
}

impl DataItem {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            attrs: Default::default(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attrs.get(key)
    }

    /// Subset-match used by the dataflow matcher (§4.6): every attr in
    /// `pattern` must exist in `self` with an equal value.
    pub fn matches_pattern(&self, pattern: &std::collections::BTreeMap<String, Value>) -> bool {
        pattern.iter().all(|(k, v)| self.attrs.get(k) == Some(v))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Success,
    Skipped,
    Cancelled,
    Failed(i32),
}

impl TaskStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            TaskStatus::Success | TaskStatus::Skipped | TaskStatus::Cancelled => 0,
            TaskStatus::Failed(code) => *code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Skipped)
    }
}

/// The result of running (or skipping, or cancelling) a single TaskNode.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub changed: bool,
    pub cache_hit: bool,
    pub output: Vec<DataItem>,
    pub markers: Vec<Marker>,
    pub duration: Duration,
}

impl TaskResult {
    pub fn success(output: Vec<DataItem>, changed: bool, duration: Duration) -> Self {
        Self {
            status: TaskStatus::Success,
            changed,
            cache_hit: false,
            output,
            markers: Vec::new(),
            duration,
        }
    }

    pub fn cache_hit(output: Vec<DataItem>) -> Self {
        Self {
            status: TaskStatus::Success,
            changed: false,
            cache_hit: true,
            output,
            markers: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: TaskStatus::Skipped,
            changed: false,
            cache_hit: false,
            output: Vec::new(),
            markers: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: TaskStatus::Cancelled,
            changed: false,
            cache_hit: false,
            output: Vec::new(),
            markers: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn failed(status: i32, marker: Marker, duration: Duration) -> Self {
        Self {
            status: TaskStatus::Failed(status),
            changed: true,
            cache_hit: false,
            output: Vec::new(),
            markers: vec![marker],
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Zero-copy string view of a single string-typed output's `value`
    /// attribute.
    pub fn output_str(&self) -> Cow<'_, str> {
        match self.output.first().and_then(|item| item.get("value")) {
            Some(Value::Str(s)) => Cow::Borrowed(s.as_ref()),
            Some(other) => Cow::Owned(other.to_string()),
            None => Cow::Borrowed(""),
        }
    }
}

/// Concurrent store of per-task results, keyed by the task's fully
/// qualified run name. Readers never block writers of a different key
/// (`DashMap` shards internally).
#[derive(Default)]
pub struct OutputStore {
    results: DashMap<Arc<str>, TaskResult>,
}

impl OutputStore {
    pub fn new() -> Self {
        Self {
            results: DashMap::new(),
        }
    }

    pub fn insert(&self, task: Arc<str>, result: TaskResult) {
        self.results.insert(task, result);
    }

    pub fn contains(&self, task: &str) -> bool {
        self.results.contains_key(task)
    }

    pub fn is_success(&self, task: &str) -> bool {
        self.results.get(task).map(|r| r.is_success()).unwrap_or(false)
    }

    pub fn get_output(&self, task: &str) -> Option<Vec<DataItem>> {
        self.results.get(task).map(|r| r.output.clone())
    }

    /// Full cloned result for a completed task, for run-outcome queries
    /// after the scheduler has finished.
    pub fn get(&self, task: &str) -> Option<TaskResult> {
        self.results.get(task).map(|r| r.clone())
    }

    pub fn changed(&self, task: &str) -> bool {
        self.results.get(task).map(|r| r.changed).unwrap_or(true)
    }

    pub fn resolve_path(&self, task: &str, path: &str) -> Option<Value> {
        let result = self.results.get(task)?;
        let item = result.output.first()?;
        if path.is_empty() {
            return Some(Value::Map(item.attrs.clone()));
        }
        let json = serde_json::to_value(&item.attrs).ok()?;
        crate::util::jsonpath::resolve(&json, path).map(Value::from_json)
    }
}
