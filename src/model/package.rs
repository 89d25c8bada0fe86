//! The elaborated `Package` model (§3): a named namespace of tasks and
//! types, produced by [`crate::loader`] and consumed by
//! [`crate::graph::builder`]. Immutable after elaboration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::value::Value;

use super::schema::ParamSchema;
use super::task::Task;
use super::typedef::TypeDef;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    /// Fully-qualified dotted name. A package's identity; loading the
    /// same path twice yields the same instance (§3, §4.2 arena).
    pub name: String,
    pub basedir: PathBuf,
    #[serde(default)]
    pub schema: ParamSchema,
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    /// Names of packages imported by this one, resolved recursively by
    /// the loader before this struct is constructed.
    #[serde(default)]
    pub imports: Vec<String>,
    /// Task table keyed by fully-qualified name.
    #[serde(default)]
    pub tasks: BTreeMap<String, Task>,
    #[serde(default)]
    pub types: BTreeMap<String, TypeDef>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Package {
    pub fn new(name: impl Into<String>, basedir: PathBuf) -> Self {
        Self {
            name: name.into(),
            basedir,
            schema: ParamSchema::new(),
            vars: BTreeMap::new(),
            imports: Vec::new(),
            tasks: BTreeMap::new(),
            types: BTreeMap::new(),
            tags: Vec::new(),
        }
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn type_def(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    /// Fully-qualify a bare or fragment-qualified task name against
    /// this package (§4.2 task-name resolution, case (c)).
    pub fn qualify(&self, task_name: &str) -> String {
        if task_name.starts_with(&format!("{}.", self.name)) {
            task_name.to_string()
        } else {
            format!("{}.{}", self.name, task_name)
        }
    }
}
