//! The on-disk package schema, deserialized from either YAML-family or
//! TOML source into the same `RawPackage` shape (§4.2) before
//! elaboration. Both encodings forbid unknown top-level keys
//! (`deny_unknown_fields`) so a typo surfaces as a loader error rather
//! than being silently ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{CachePolicy, ConsumesSpec, ControlFlow, Pattern, Strategy};
use crate::value::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawPackage {
    pub package: RawPackageHeader,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub fragments: Vec<String>,
    #[serde(default)]
    pub tasks: BTreeMap<String, RawTask>,
    #[serde(default)]
    pub types: BTreeMap<String, RawType>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawPackageHeader {
    pub name: String,
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawTask {
    #[serde(default)]
    pub uses: Option<String>,
    #[serde(rename = "override", default)]
    pub override_target: Option<String>,
    #[serde(default)]
    pub with: BTreeMap<String, Value>,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub feeds: Vec<String>,
    #[serde(default)]
    pub consumes: ConsumesSpec,
    #[serde(default)]
    pub produces: Vec<Pattern>,
    #[serde(default)]
    pub subtasks: Vec<String>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub control: Option<ControlFlow>,
    #[serde(default)]
    pub rundir: Option<String>,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default)]
    pub passthrough: Option<String>,
    #[serde(default)]
    pub iff: Option<String>,
    #[serde(default)]
    pub cache: CachePolicy,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawType {
    #[serde(default)]
    pub uses: Option<String>,
    #[serde(default)]
    pub with: BTreeMap<String, Value>,
    #[serde(default)]
    pub doc: Option<String>,
}

/// The set of fields `RawTask` accepts, used by the loader's
/// edit-distance suggestion for unknown-field diagnostics (§4.2).
pub const RAW_TASK_FIELDS: &[&str] = &[
    "uses",
    "override",
    "with",
    "needs",
    "feeds",
    "consumes",
    "produces",
    "subtasks",
    "strategy",
    "control",
    "rundir",
    "visibility",
    "passthrough",
    "iff",
    "cache",
    "shell",
    "tags",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_task_fields_cover_needs_typo_candidate() {
        assert!(RAW_TASK_FIELDS.contains(&"needs"));
    }
}
